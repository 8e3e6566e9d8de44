//! Boundary around the pretrained segmentation model.
//!
//! `SegmentationAdapter` owns whatever implements `SegmentationModel`
//! (the ONNX Segment-Anything pair in production, an in-memory fake in
//! tests), embeds each image once, and refuses to forward any box that is
//! degenerate or outside the image.

pub mod ort;
pub mod sam;
pub mod worker;

use crate::error::SegmentError;
use image::RgbImage;

/// Model query box in image pixels, `[x_min, y_min, x_max, y_max]`,
/// max edges exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PixelBox {
    pub x_min: u32,
    pub y_min: u32,
    pub x_max: u32,
    pub y_max: u32,
}

impl PixelBox {
    pub fn new(x_min: u32, y_min: u32, x_max: u32, y_max: u32) -> Self {
        Self { x_min, y_min, x_max, y_max }
    }

    pub fn width(&self) -> u32 {
        self.x_max.saturating_sub(self.x_min)
    }

    pub fn height(&self) -> u32 {
        self.y_max.saturating_sub(self.y_min)
    }

    pub fn as_array(&self) -> [u32; 4] {
        [self.x_min, self.y_min, self.x_max, self.y_max]
    }

    /// Non-zero area and fully inside a `width`×`height` image.
    pub fn validate(&self, width: u32, height: u32) -> Result<(), SegmentError> {
        if self.x_min >= self.x_max || self.y_min >= self.y_max {
            return Err(SegmentError::InvalidRegion(format!(
                "box {:?} has zero area",
                self.as_array()
            )));
        }
        if self.x_max > width || self.y_max > height {
            return Err(SegmentError::InvalidRegion(format!(
                "box {:?} exceeds the {}x{} image",
                self.as_array(),
                width,
                height
            )));
        }
        Ok(())
    }
}

/// Per-pixel foreground flags aligned with the source image.
#[derive(Clone, Debug, PartialEq)]
pub struct Mask {
    pub width: u32,
    pub height: u32,
    /// Row-major, `width * height` entries.
    pub data: Vec<bool>,
}

impl Mask {
    pub fn new(width: u32, height: u32, data: Vec<bool>) -> Result<Self, SegmentError> {
        if data.len() != width as usize * height as usize {
            return Err(SegmentError::Inference(format!(
                "mask has {} values, expected {}x{}",
                data.len(),
                width,
                height
            )));
        }
        Ok(Self { width, height, data })
    }

    pub fn empty(width: u32, height: u32) -> Self {
        Self { width, height, data: vec![false; width as usize * height as usize] }
    }

    /// Threshold raw logits (or probabilities) into a mask: `v > threshold`.
    pub fn from_scores(width: u32, height: u32, scores: &[f32], threshold: f32) -> Result<Self, SegmentError> {
        Self::new(width, height, scores.iter().map(|&v| v > threshold).collect())
    }

    pub fn foreground_count(&self) -> usize {
        self.data.iter().filter(|&&v| v).count()
    }
}

/// One mask proposed by the model for a single box, with its confidence.
#[derive(Clone, Debug, PartialEq)]
pub struct MaskCandidate {
    pub mask: Mask,
    pub score: f32,
}

/// Index of the highest-scoring candidate. Ties go to the earliest entry;
/// NaN scores never win against a real number.
pub fn select_best(candidates: &[MaskCandidate]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, c) in candidates.iter().enumerate() {
        let better = match best {
            None => true,
            Some((_, s)) => c.score > s || (s.is_nan() && !c.score.is_nan()),
        };
        if better {
            best = Some((i, c.score));
        }
    }
    best.map(|(i, _)| i)
}

/// Ranked model output for one box.
#[derive(Clone, Debug)]
pub struct Prediction {
    pub pixel_box: PixelBox,
    pub candidates: Vec<MaskCandidate>,
    pub best_index: usize,
}

impl Prediction {
    pub fn best(&self) -> &MaskCandidate {
        &self.candidates[self.best_index]
    }

    pub fn into_best(mut self) -> MaskCandidate {
        self.candidates.swap_remove(self.best_index)
    }
}

/// What the adapter needs from a pretrained model.
pub trait SegmentationModel {
    /// Run the (expensive) image encoder once for `image`.
    fn set_image(&mut self, image: &RgbImage) -> Result<(), SegmentError>;

    /// Candidate masks for `pixel_box` on the image last passed to `set_image`.
    fn predict(&mut self, pixel_box: PixelBox) -> Result<Vec<MaskCandidate>, SegmentError>;

    /// Human-readable compute device, e.g. "CUDA" or "CPU".
    fn device(&self) -> String;
}

/// Which image the model currently holds features for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct EmbeddedImage {
    generation: u64,
    width: u32,
    height: u32,
}

pub struct SegmentationAdapter<M: SegmentationModel> {
    model: M,
    embedded: Option<EmbeddedImage>,
}

impl<M: SegmentationModel> SegmentationAdapter<M> {
    pub fn new(model: M) -> Self {
        Self { model, embedded: None }
    }

    pub fn device(&self) -> String {
        self.model.device()
    }

    pub fn embedded_generation(&self) -> Option<u64> {
        self.embedded.map(|e| e.generation)
    }

    /// Configure the model for `image`. A repeated call for the generation
    /// already embedded is a no-op, so the encoder runs once per upload.
    pub fn set_image(&mut self, generation: u64, image: &RgbImage) -> Result<(), SegmentError> {
        if self.embedded_generation() == Some(generation) {
            return Ok(());
        }
        self.embedded = None;
        self.model.set_image(image)?;
        self.embedded = Some(EmbeddedImage {
            generation,
            width: image.width(),
            height: image.height(),
        });
        Ok(())
    }

    /// Query the model for `pixel_box` on image `generation`, then pick the
    /// best-scoring candidate. The image must have been embedded first; an
    /// earlier embedding failure surfaces here as `Inference`.
    pub fn predict(&mut self, generation: u64, pixel_box: PixelBox) -> Result<Prediction, SegmentError> {
        let embedded = self.embedded.filter(|e| e.generation == generation).ok_or_else(|| {
            SegmentError::Inference(format!("features for image #{} are not ready, try again", generation))
        })?;
        pixel_box.validate(embedded.width, embedded.height)?;

        let candidates = self.model.predict(pixel_box)?;
        if let Some(bad) = candidates
            .iter()
            .find(|c| c.mask.width != embedded.width || c.mask.height != embedded.height)
        {
            return Err(SegmentError::Inference(format!(
                "model returned a {}x{} mask for a {}x{} image",
                bad.mask.width, bad.mask.height, embedded.width, embedded.height
            )));
        }
        let best_index = select_best(&candidates)
            .ok_or_else(|| SegmentError::Inference("model returned no mask candidates".into()))?;
        Ok(Prediction { pixel_box, candidates, best_index })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Calls observed by `FakeModel`, shared so tests can inspect them after
    /// the model moved into an adapter or a worker thread.
    #[derive(Default, Debug)]
    pub struct Calls {
        pub set_image: Vec<(u32, u32)>,
        pub predict: Vec<PixelBox>,
    }

    /// Returns one all-foreground-inside-the-box mask per configured score.
    pub struct FakeModel {
        pub scores: Vec<f32>,
        pub calls: Arc<Mutex<Calls>>,
        /// Makes the next `set_image` fail the way an encoder running out of
        /// memory would.
        pub fail_next_set_image: bool,
        size: (u32, u32),
    }

    impl FakeModel {
        pub fn new(scores: Vec<f32>) -> (Self, Arc<Mutex<Calls>>) {
            let calls = Arc::new(Mutex::new(Calls::default()));
            let model = Self { scores, calls: calls.clone(), fail_next_set_image: false, size: (0, 0) };
            (model, calls)
        }
    }

    impl SegmentationModel for FakeModel {
        fn set_image(&mut self, image: &RgbImage) -> Result<(), SegmentError> {
            self.calls.lock().unwrap().set_image.push(image.dimensions());
            if std::mem::take(&mut self.fail_next_set_image) {
                return Err(SegmentError::Inference("encoder ran out of memory".into()));
            }
            self.size = image.dimensions();
            Ok(())
        }

        fn predict(&mut self, pixel_box: PixelBox) -> Result<Vec<MaskCandidate>, SegmentError> {
            self.calls.lock().unwrap().predict.push(pixel_box);
            let (w, h) = self.size;
            Ok(self
                .scores
                .iter()
                .enumerate()
                .map(|(i, &score)| {
                    let mut mask = Mask::empty(w, h);
                    for y in pixel_box.y_min..pixel_box.y_max {
                        for x in pixel_box.x_min..pixel_box.x_max {
                            // candidate i leaves its first i columns out so masks differ
                            if x >= pixel_box.x_min + i as u32 {
                                mask.data[(y * w + x) as usize] = true;
                            }
                        }
                    }
                    MaskCandidate { mask, score }
                })
                .collect())
        }

        fn device(&self) -> String {
            "fake".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeModel;
    use super::*;

    fn candidate(score: f32) -> MaskCandidate {
        MaskCandidate { mask: Mask::empty(1, 1), score }
    }

    #[test]
    fn best_is_maximum_score() {
        let c = vec![candidate(0.62), candidate(0.91)];
        assert_eq!(select_best(&c), Some(1));
    }

    #[test]
    fn ties_go_to_first_candidate() {
        let c = vec![candidate(0.3), candidate(0.8), candidate(0.8)];
        assert_eq!(select_best(&c), Some(1));
    }

    #[test]
    fn nan_scores_lose() {
        let c = vec![candidate(f32::NAN), candidate(0.1)];
        assert_eq!(select_best(&c), Some(1));
        assert_eq!(select_best(&[]), None);
    }

    #[test]
    fn box_validation() {
        assert!(PixelBox::new(10, 10, 60, 80).validate(100, 100).is_ok());
        assert!(PixelBox::new(0, 0, 100, 100).validate(100, 100).is_ok());
        assert!(PixelBox::new(10, 10, 10, 80).validate(100, 100).is_err());
        assert!(PixelBox::new(10, 10, 101, 80).validate(100, 100).is_err());
    }

    #[test]
    fn image_is_embedded_once_per_generation() {
        let (model, calls) = FakeModel::new(vec![0.5]);
        let mut adapter = SegmentationAdapter::new(model);
        let img = RgbImage::new(20, 10);
        adapter.set_image(1, &img).unwrap();
        adapter.set_image(1, &img).unwrap();
        adapter.predict(1, PixelBox::new(1, 1, 5, 5)).unwrap();
        adapter.predict(1, PixelBox::new(2, 2, 6, 6)).unwrap();
        adapter.set_image(2, &img).unwrap();
        let calls = calls.lock().unwrap();
        assert_eq!(calls.set_image.len(), 2);
        assert_eq!(calls.predict.len(), 2);
    }

    #[test]
    fn invalid_box_never_reaches_model() {
        let (model, calls) = FakeModel::new(vec![0.5]);
        let mut adapter = SegmentationAdapter::new(model);
        adapter.set_image(1, &RgbImage::new(100, 100)).unwrap();
        let zero = adapter.predict(1, PixelBox::new(10, 10, 10, 50));
        let outside = adapter.predict(1, PixelBox::new(10, 10, 150, 50));
        assert!(matches!(zero, Err(SegmentError::InvalidRegion(_))));
        assert!(matches!(outside, Err(SegmentError::InvalidRegion(_))));
        assert!(calls.lock().unwrap().predict.is_empty());
    }

    #[test]
    fn predicting_for_another_generation_is_rejected() {
        let (model, calls) = FakeModel::new(vec![0.5]);
        let mut adapter = SegmentationAdapter::new(model);
        adapter.set_image(3, &RgbImage::new(10, 10)).unwrap();
        assert!(matches!(
            adapter.predict(2, PixelBox::new(1, 1, 4, 4)),
            Err(SegmentError::Inference(_))
        ));
        assert!(calls.lock().unwrap().predict.is_empty());
    }

    #[test]
    fn failed_embedding_can_be_retried() {
        let (mut model, calls) = FakeModel::new(vec![0.5]);
        model.fail_next_set_image = true;
        let mut adapter = SegmentationAdapter::new(model);
        let img = RgbImage::new(10, 10);

        assert!(adapter.set_image(1, &img).is_err());
        assert_eq!(adapter.embedded_generation(), None);
        let err = adapter.predict(1, PixelBox::new(1, 1, 4, 4)).unwrap_err();
        assert!(matches!(err, SegmentError::Inference(_)), "{:?}", err);
        assert!(err.is_recoverable());

        adapter.set_image(1, &img).unwrap();
        assert!(adapter.predict(1, PixelBox::new(1, 1, 4, 4)).is_ok());
        assert_eq!(calls.lock().unwrap().set_image.len(), 2);
    }

    #[test]
    fn empty_model_output_is_an_inference_error() {
        let (model, _) = FakeModel::new(vec![]);
        let mut adapter = SegmentationAdapter::new(model);
        adapter.set_image(1, &RgbImage::new(10, 10)).unwrap();
        assert!(matches!(
            adapter.predict(1, PixelBox::new(1, 1, 4, 4)),
            Err(SegmentError::Inference(_))
        ));
    }

    #[test]
    fn repeated_predictions_pick_the_same_mask() {
        let (model, _) = FakeModel::new(vec![0.2, 0.9, 0.4]);
        let mut adapter = SegmentationAdapter::new(model);
        adapter.set_image(1, &RgbImage::new(30, 30)).unwrap();
        let b = PixelBox::new(5, 5, 25, 25);
        let first = adapter.predict(1, b).unwrap().into_best();
        for _ in 0..5 {
            assert_eq!(adapter.predict(1, b).unwrap().into_best(), first);
        }
        assert_eq!(first.score, 0.9);
    }

    #[test]
    fn mask_from_scores_thresholds_logits() {
        let m = Mask::from_scores(2, 2, &[-3.0, 0.0, 0.5, 7.0], 0.0).unwrap();
        assert_eq!(m.data, vec![false, false, true, true]);
        assert_eq!(m.foreground_count(), 2);
        assert!(Mask::from_scores(3, 2, &[0.0; 5], 0.0).is_err());
    }
}
