//! Segment-Anything (SAM) running as two ONNX graphs.
//!
//! * encoder: `[1, 3, 1024, 1024]` normalized image → image embeddings
//! * decoder (the upstream `export_onnx_model.py` layout): embeddings + box
//!   prompt → `masks [1, K, H, W]` at original resolution and
//!   `iou_predictions [1, K]`
//!
//! The encoder is the expensive half and runs once per image in
//! `set_image`; every box only costs a decoder pass.

use super::ort::{ExecutionDevice, OnnxError, OrtRuntime, Session, Tensor, TensorRef};
use super::{Mask, MaskCandidate, PixelBox, SegmentationModel};
use crate::error::SegmentError;
use crate::settings::{AppSettings, DevicePreference};
use image::RgbImage;
use rayon::prelude::*;
use std::sync::Arc;

/// Side of the square encoder input.
pub const SAM_INPUT_SIZE: u32 = 1024;
/// Side of the low-resolution mask prompt the decoder accepts.
const LOW_RES_MASK_SIZE: usize = 256;
/// Per-channel normalization, in 0..255 units.
const PIXEL_MEAN: [f32; 3] = [123.675, 116.28, 103.53];
const PIXEL_STD: [f32; 3] = [58.395, 57.12, 57.375];
/// Prompt-point labels marking the top-left and bottom-right box corners.
const BOX_TOP_LEFT_LABEL: f32 = 2.0;
const BOX_BOTTOM_RIGHT_LABEL: f32 = 3.0;

const DECODER_INPUTS: [&str; 6] = [
    "image_embeddings",
    "point_coords",
    "point_labels",
    "mask_input",
    "has_mask_input",
    "orig_im_size",
];
const DECODER_OUTPUTS: [&str; 2] = ["masks", "iou_predictions"];

/// Size of the image after scaling its longest side to `target`, plus the
/// per-axis factors that map original pixel coordinates into it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResizeLongestSide {
    pub new_width: u32,
    pub new_height: u32,
    pub scale_x: f32,
    pub scale_y: f32,
}

impl ResizeLongestSide {
    pub fn new(width: u32, height: u32, target: u32) -> Self {
        let scale = target as f64 / width.max(height).max(1) as f64;
        let new_width = ((width as f64 * scale + 0.5) as u32).clamp(1, target);
        let new_height = ((height as f64 * scale + 0.5) as u32).clamp(1, target);
        Self {
            new_width,
            new_height,
            scale_x: new_width as f32 / width.max(1) as f32,
            scale_y: new_height as f32 / height.max(1) as f32,
        }
    }

    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        (x * self.scale_x, y * self.scale_y)
    }
}

/// Resize, normalize and zero-pad `image` into a CHW `[1, 3, 1024, 1024]` buffer.
pub fn preprocess(image: &RgbImage) -> (Vec<f32>, ResizeLongestSide) {
    let resize = ResizeLongestSide::new(image.width(), image.height(), SAM_INPUT_SIZE);
    let resized = image::imageops::resize(
        image,
        resize.new_width,
        resize.new_height,
        image::imageops::FilterType::Triangle,
    );

    let side = SAM_INPUT_SIZE as usize;
    let plane = side * side;
    let mut tensor = vec![0.0f32; 3 * plane];
    tensor.par_chunks_mut(plane).enumerate().for_each(|(c, channel)| {
        for (x, y, pixel) in resized.enumerate_pixels() {
            channel[y as usize * side + x as usize] = (pixel[c] as f32 - PIXEL_MEAN[c]) / PIXEL_STD[c];
        }
    });
    (tensor, resize)
}

/// Box corners as the two labelled prompt points the decoder expects.
pub fn box_prompt(pixel_box: PixelBox, resize: &ResizeLongestSide) -> ([f32; 4], [f32; 2]) {
    let (x0, y0) = resize.apply(pixel_box.x_min as f32, pixel_box.y_min as f32);
    let (x1, y1) = resize.apply(pixel_box.x_max as f32, pixel_box.y_max as f32);
    ([x0, y0, x1, y1], [BOX_TOP_LEFT_LABEL, BOX_BOTTOM_RIGHT_LABEL])
}

/// Split decoder outputs into thresholded candidates in model order.
///
/// The decoder always emits the single-mask token first. In multimask mode
/// that token is dropped and only the remaining proposals are ranked; in
/// single-mask mode it is the only candidate.
pub fn candidates_from_outputs(
    masks: &Tensor,
    ious: &Tensor,
    width: u32,
    height: u32,
    threshold: f32,
    multimask: bool,
) -> Result<Vec<MaskCandidate>, SegmentError> {
    if masks.shape.len() != 4 || masks.dim(2) != height as usize || masks.dim(3) != width as usize {
        return Err(SegmentError::Inference(format!(
            "decoder masks have shape {:?}, expected [1, K, {}, {}]",
            masks.shape, height, width
        )));
    }
    let count = masks.dim(1);
    let plane = width as usize * height as usize;
    if count == 0 || ious.data.len() < count || masks.data.len() < count * plane {
        return Err(SegmentError::Inference(format!(
            "decoder returned {} masks and {} scores",
            count,
            ious.data.len()
        )));
    }
    let tokens = if multimask && count > 1 { 1..count } else { 0..1 };
    tokens
        .into_par_iter()
        .map(|k| {
            let mask = Mask::from_scores(width, height, &masks.data[k * plane..(k + 1) * plane], threshold)?;
            Ok(MaskCandidate { mask, score: ious.data[k] })
        })
        .collect()
}

struct Embedding {
    tensor: Tensor,
    width: u32,
    height: u32,
    resize: ResizeLongestSide,
}

pub struct SamModel {
    encoder: Session,
    decoder: Session,
    embedding: Option<Embedding>,
    multimask: bool,
    mask_threshold: f32,
    runtime_version: String,
}

impl SamModel {
    /// Load the runtime library and both graphs named in `settings`.
    pub fn load(settings: &AppSettings) -> Result<Self, SegmentError> {
        if !settings.model_configured() {
            return Err(SegmentError::ModelUnavailable(
                "ONNX Runtime library, encoder and decoder paths must all be set in Settings".into(),
            ));
        }
        let runtime = OrtRuntime::load(&settings.onnx_runtime_path)?;

        let (encoder, decoder) = match settings.device {
            DevicePreference::Cpu => Self::open_pair(&runtime, settings, false)?,
            DevicePreference::Cuda => Self::open_pair(&runtime, settings, true)?,
            DevicePreference::Auto if runtime.has_cuda() => match Self::open_pair(&runtime, settings, true) {
                Ok(pair) => pair,
                Err(OnnxError::ProviderUnavailable(e)) => {
                    crate::log_warn!("CUDA provider unavailable ({}), falling back to CPU", e);
                    Self::open_pair(&runtime, settings, false)?
                }
                Err(e) => return Err(e.into()),
            },
            DevicePreference::Auto => Self::open_pair(&runtime, settings, false)?,
        };

        if let Some(missing) = DECODER_INPUTS.iter().find(|n| !decoder.input_names.iter().any(|i| i == *n)) {
            return Err(SegmentError::ModelUnavailable(format!(
                "decoder has no '{}' input; export it with segment-anything's export_onnx_model.py",
                missing
            )));
        }
        if encoder.input_names.is_empty() || encoder.output_names.is_empty() {
            return Err(SegmentError::ModelUnavailable("encoder graph has no inputs or outputs".into()));
        }

        crate::log_info!("SAM model ready on {}", encoder.device().label());
        Ok(Self {
            encoder,
            decoder,
            embedding: None,
            multimask: settings.multimask,
            mask_threshold: settings.mask_threshold,
            runtime_version: runtime.version().to_string(),
        })
    }

    fn open_pair(runtime: &Arc<OrtRuntime>, settings: &AppSettings, cuda: bool) -> Result<(Session, Session), OnnxError> {
        let encoder = Session::new(runtime.clone(), &settings.encoder_model_path, cuda)?;
        let decoder = Session::new(runtime.clone(), &settings.decoder_model_path, cuda)?;
        Ok((encoder, decoder))
    }

    pub fn runtime_version(&self) -> &str {
        &self.runtime_version
    }
}

impl SegmentationModel for SamModel {
    fn set_image(&mut self, image: &RgbImage) -> Result<(), SegmentError> {
        self.embedding = None;
        let started = std::time::Instant::now();
        let (pixels, resize) = preprocess(image);
        let side = SAM_INPUT_SIZE as i64;
        let input = TensorRef {
            name: &self.encoder.input_names[0],
            shape: vec![1, 3, side, side],
            data: &pixels,
        };
        let output_name = self.encoder.output_names[0].as_str();
        let tensor = self
            .encoder
            .run(&[input], &[output_name])?
            .pop()
            .ok_or_else(|| SegmentError::Inference("encoder produced no output".into()))?;
        crate::log_info!(
            "Image {}x{} embedded in {:.2}s, embedding shape {:?}",
            image.width(),
            image.height(),
            started.elapsed().as_secs_f32(),
            tensor.shape
        );
        self.embedding = Some(Embedding {
            tensor,
            width: image.width(),
            height: image.height(),
            resize,
        });
        Ok(())
    }

    fn predict(&mut self, pixel_box: PixelBox) -> Result<Vec<MaskCandidate>, SegmentError> {
        let embedding = self.embedding.as_ref().ok_or(SegmentError::NoImageLoaded)?;
        let (coords, labels) = box_prompt(pixel_box, &embedding.resize);
        let mask_input = vec![0.0f32; LOW_RES_MASK_SIZE * LOW_RES_MASK_SIZE];
        let has_mask_input = [0.0f32];
        let orig_im_size = [embedding.height as f32, embedding.width as f32];
        let low_res = LOW_RES_MASK_SIZE as i64;

        let inputs = [
            TensorRef { name: DECODER_INPUTS[0], shape: embedding.tensor.shape.clone(), data: &embedding.tensor.data },
            TensorRef { name: DECODER_INPUTS[1], shape: vec![1, 2, 2], data: &coords },
            TensorRef { name: DECODER_INPUTS[2], shape: vec![1, 2], data: &labels },
            TensorRef { name: DECODER_INPUTS[3], shape: vec![1, 1, low_res, low_res], data: &mask_input },
            TensorRef { name: DECODER_INPUTS[4], shape: vec![1], data: &has_mask_input },
            TensorRef { name: DECODER_INPUTS[5], shape: vec![2], data: &orig_im_size },
        ];
        let outputs = self.decoder.run(&inputs, &DECODER_OUTPUTS)?;
        let [masks, ious] = <[Tensor; 2]>::try_from(outputs)
            .map_err(|_| SegmentError::Inference("decoder returned an unexpected number of outputs".into()))?;

        let candidates = candidates_from_outputs(
            &masks,
            &ious,
            embedding.width,
            embedding.height,
            self.mask_threshold,
            self.multimask,
        )?;
        crate::log_info!(
            "Box {:?}: {} candidate(s), scores {:?}",
            pixel_box.as_array(),
            candidates.len(),
            candidates.iter().map(|c| c.score).collect::<Vec<_>>()
        );
        Ok(candidates)
    }

    fn device(&self) -> String {
        let device: ExecutionDevice = self.encoder.device();
        format!("{}, ONNX Runtime {}", device.label(), self.runtime_version())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_side_becomes_1024() {
        let r = ResizeLongestSide::new(2000, 1000, SAM_INPUT_SIZE);
        assert_eq!((r.new_width, r.new_height), (1024, 512));
        let r = ResizeLongestSide::new(100, 100, SAM_INPUT_SIZE);
        assert_eq!((r.new_width, r.new_height), (1024, 1024));
        assert!((r.scale_x - 10.24).abs() < 1e-5);
    }

    #[test]
    fn box_prompt_scales_corners() {
        let r = ResizeLongestSide::new(100, 100, SAM_INPUT_SIZE);
        let (coords, labels) = box_prompt(PixelBox::new(10, 10, 60, 80), &r);
        let expected = [102.4, 102.4, 614.4, 819.2];
        for (c, e) in coords.iter().zip(expected) {
            assert!((c - e).abs() < 1e-3, "{:?} vs {:?}", coords, expected);
        }
        assert_eq!(labels, [2.0, 3.0]);
    }

    #[test]
    fn preprocess_pads_with_zero_after_normalizing() {
        let img = RgbImage::from_pixel(4, 2, image::Rgb([255, 0, 128]));
        let (tensor, r) = preprocess(&img);
        assert_eq!((r.new_width, r.new_height), (1024, 512));
        let side = SAM_INPUT_SIZE as usize;
        let plane = side * side;
        assert_eq!(tensor.len(), 3 * plane);
        // inside the resized area
        assert!((tensor[0] - (255.0 - PIXEL_MEAN[0]) / PIXEL_STD[0]).abs() < 1e-4);
        assert!((tensor[plane] - (0.0 - PIXEL_MEAN[1]) / PIXEL_STD[1]).abs() < 1e-4);
        // padding rows below the image stay zero in every channel
        let below = 600 * side + 10;
        assert_eq!([tensor[below], tensor[plane + below], tensor[2 * plane + below]], [0.0, 0.0, 0.0]);
    }

    fn decoder_outputs(width: u32, height: u32, scores: &[f32]) -> (Tensor, Tensor) {
        let plane = (width * height) as usize;
        let mut data = Vec::new();
        for k in 0..scores.len() {
            data.extend((0..plane).map(|i| if i % (k + 2) == 0 { 1.5 } else { -1.5 }));
        }
        (
            Tensor { shape: vec![1, scores.len() as i64, height as i64, width as i64], data },
            Tensor { shape: vec![1, scores.len() as i64], data: scores.to_vec() },
        )
    }

    #[test]
    fn outputs_split_into_candidates() {
        let (masks, ious) = decoder_outputs(3, 2, &[0.3, 0.62, 0.91, 0.4]);
        let c = candidates_from_outputs(&masks, &ious, 3, 2, 0.0, true).unwrap();
        assert_eq!(c.len(), 3);
        assert_eq!(c[1].score, 0.91);
        // output 1 sets every third pixel
        assert_eq!(c[0].mask.data, vec![true, false, false, true, false, false]);
        assert_eq!((c[2].mask.width, c[2].mask.height), (3, 2));
    }

    #[test]
    fn multimask_never_ranks_the_single_mask_token() {
        let (masks, ious) = decoder_outputs(3, 2, &[0.99, 0.6, 0.7, 0.8]);
        let c = candidates_from_outputs(&masks, &ious, 3, 2, 0.0, true).unwrap();
        assert_eq!(c.iter().map(|c| c.score).collect::<Vec<_>>(), vec![0.6, 0.7, 0.8]);
        let best = crate::segmentation::select_best(&c).unwrap();
        assert_eq!(c[best].score, 0.8);
    }

    #[test]
    fn multimask_with_one_output_keeps_it() {
        let (masks, ious) = decoder_outputs(3, 2, &[0.7]);
        let c = candidates_from_outputs(&masks, &ious, 3, 2, 0.0, true).unwrap();
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].score, 0.7);
    }

    #[test]
    fn single_mask_mode_keeps_first_candidate() {
        let (masks, ious) = decoder_outputs(3, 2, &[0.5, 0.9]);
        let c = candidates_from_outputs(&masks, &ious, 3, 2, 0.0, false).unwrap();
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].score, 0.5);
    }

    #[test]
    fn mismatched_output_size_is_an_error() {
        let (masks, ious) = decoder_outputs(3, 2, &[0.5]);
        assert!(candidates_from_outputs(&masks, &ious, 4, 2, 0.0, true).is_err());
    }

    #[test]
    fn unconfigured_settings_report_model_unavailable() {
        assert!(matches!(
            SamModel::load(&AppSettings::default()),
            Err(SegmentError::ModelUnavailable(_))
        ));
    }
}
