//! Everything the window does, minus the window.
//!
//! `Workspace` ties the image store, the coordinate mapper and the region
//! selector together and decides what is on screen. The egui layer forwards
//! pointer positions and button clicks here and paints whatever `view()`
//! returns, so the whole upload → draw → analyze → display cycle can be
//! driven from tests without a GPU or a model.

use crate::error::SegmentError;
use crate::image_store::{ImageStore, LoadedImage};
use crate::mask;
use crate::region::{RegionRect, RegionSelector};
use crate::segmentation::{PixelBox, Prediction};
use crate::viewport::CoordinateMapper;
use egui::{Pos2, Rect};
use image::{GrayImage, RgbImage};
use std::path::{Path, PathBuf};

/// Corner handles can be grabbed this many screen points away.
pub const HANDLE_GRAB_RADIUS: f32 = 6.0;

/// The most recent segmentation, already rendered.
#[derive(Clone, Debug)]
pub struct MaskResult {
    pub image: GrayImage,
    pub score: f32,
    pub foreground: usize,
    pub pixel_box: PixelBox,
}

/// What the canvas should paint this frame.
pub enum View<'a> {
    Empty,
    Image(&'a LoadedImage),
    Mask(&'a MaskResult),
}

/// One analysis the UI handed to the model.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AnalysisRequest {
    pub generation: u64,
    pub request_id: u64,
    pub pixel_box: PixelBox,
}

/// What happened to a result coming back from the model.
#[derive(Debug, PartialEq)]
pub enum Accepted {
    /// Rendered and now on screen.
    Shown { score: f32, foreground: usize },
    /// Computed for an image that has since been replaced.
    Stale,
    /// A newer request for the same image is outstanding.
    Superseded,
    /// The model failed; nothing on screen changed.
    Failed(SegmentError),
}

#[derive(Default)]
pub struct Workspace {
    images: ImageStore,
    mapper: CoordinateMapper,
    selector: RegionSelector,
    mask: Option<MaskResult>,
    show_mask: bool,
    pending: Option<AnalysisRequest>,
    next_request_id: u64,
    needs_fit: bool,
    /// Bumped whenever the painted raster changes so the canvas knows to
    /// re-upload its texture.
    view_revision: u64,
}

impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn image(&self) -> Option<&LoadedImage> {
        self.images.current()
    }

    pub fn generation(&self) -> u64 {
        self.images.generation()
    }

    pub fn mapper(&self) -> &CoordinateMapper {
        &self.mapper
    }

    pub fn selector(&self) -> &RegionSelector {
        &self.selector
    }

    pub fn mask(&self) -> Option<&MaskResult> {
        self.mask.as_ref()
    }

    pub fn pending(&self) -> Option<AnalysisRequest> {
        self.pending
    }

    pub fn view_revision(&self) -> u64 {
        self.view_revision
    }

    pub fn view(&self) -> View<'_> {
        match (&self.mask, self.images.current()) {
            (Some(m), Some(_)) if self.show_mask => View::Mask(m),
            (_, Some(img)) => View::Image(img),
            _ => View::Empty,
        }
    }

    pub fn showing_mask(&self) -> bool {
        matches!(self.view(), View::Mask(_))
    }

    // ------------------------------------------------------------------
    // Upload
    // ------------------------------------------------------------------

    /// Decode `path` and make it the current image. A file that fails to
    /// decode leaves the workspace untouched.
    pub fn upload(&mut self, path: &Path) -> Result<&LoadedImage, SegmentError> {
        let rgb = crate::image_store::decode_rgb(path)?;
        Ok(self.install_image(rgb, path.to_path_buf()))
    }

    /// Replace the current image. Any mask, rectangle or outstanding
    /// analysis belonging to the previous one is dropped.
    pub fn install_image(&mut self, rgb: RgbImage, path: PathBuf) -> &LoadedImage {
        self.selector.clear();
        self.mask = None;
        self.show_mask = false;
        self.pending = None;
        self.mapper.clear();
        self.needs_fit = true;
        self.view_revision += 1;
        let loaded = self.images.replace(rgb, path);
        crate::log_info!(
            "Loaded image #{} {} ({}x{})",
            loaded.generation,
            loaded.path.display(),
            loaded.width(),
            loaded.height()
        );
        loaded
    }

    // ------------------------------------------------------------------
    // View
    // ------------------------------------------------------------------

    /// Called by the canvas with its current rect every frame: performs the
    /// pending fit after an upload, or keeps a fitted view fitted on resize.
    pub fn sync_viewport(&mut self, viewport: Rect) {
        let Some(img) = self.images.current() else { return };
        if self.needs_fit {
            self.mapper.fit_image(img.width(), img.height(), viewport);
            self.needs_fit = false;
        } else {
            self.mapper.track_viewport(viewport);
        }
    }

    pub fn fit_to_view(&mut self) {
        if self.images.current().is_some() {
            self.needs_fit = true;
        }
    }

    pub fn zoom_at(&mut self, anchor: Pos2, factor: f32) {
        self.mapper.zoom_at(anchor, factor);
    }

    pub fn pan(&mut self, delta: egui::Vec2) {
        self.mapper.pan(delta);
    }

    /// Flip between the source image and the last mask. Returns the new
    /// state; stays on the image when there is no mask yet.
    pub fn toggle_mask_view(&mut self) -> bool {
        if self.mask.is_some() {
            self.show_mask = !self.show_mask;
            self.needs_fit = true;
            self.view_revision += 1;
        }
        self.showing_mask()
    }

    // ------------------------------------------------------------------
    // Region selection
    // ------------------------------------------------------------------

    /// "Segment Input": drop any old rectangle and get ready for a new one.
    pub fn arm_selection(&mut self) -> Result<(), SegmentError> {
        if self.images.current().is_none() {
            return Err(SegmentError::NoImageLoaded);
        }
        self.selector.clear();
        if self.show_mask {
            self.show_mask = false;
            self.view_revision += 1;
        }
        Ok(())
    }

    /// Primary button down at screen position `screen`. Grabs a corner
    /// handle of the finalized rectangle if one is under the pointer,
    /// otherwise starts a fresh rectangle.
    pub fn pointer_pressed(&mut self, screen: Pos2) -> Result<(), SegmentError> {
        let scene = self.mapper.to_image_space(screen)?;
        let scale = self.mapper.transform().map_or(1.0, |t| t.scale);
        if !self.selector.grab_handle(scene, HANDLE_GRAB_RADIUS / scale) {
            self.selector.press(scene);
        }
        Ok(())
    }

    pub fn pointer_dragged(&mut self, screen: Pos2) {
        if !self.selector.is_drawing() {
            return;
        }
        if let Ok(scene) = self.mapper.to_image_space(screen) {
            self.selector.drag(scene);
        }
    }

    pub fn pointer_released(&mut self, screen: Pos2) -> Option<RegionRect> {
        let scene = self.mapper.to_image_space(screen).ok()?;
        let rect = self.selector.release(scene)?;
        crate::log_info!(
            "Region finalized at ({:.1}, {:.1}) size {:.1}x{:.1}",
            rect.x,
            rect.y,
            rect.width,
            rect.height
        );
        Some(rect)
    }

    pub fn clear_selection(&mut self) {
        self.selector.clear();
    }

    /// Rectangle to draw, in screen space.
    pub fn selection_on_screen(&self) -> Option<Rect> {
        let t = self.mapper.transform()?;
        let rect = self.selector.live_rect()?;
        Some(t.scene_rect_to_screen(rect.to_egui_rect()))
    }

    // ------------------------------------------------------------------
    // Analysis
    // ------------------------------------------------------------------

    /// "Analyze Segments": turn the finalized rectangle into a model box for
    /// the current image. Every rejection happens here, before the model
    /// is involved.
    pub fn prepare_analysis(&mut self) -> Result<AnalysisRequest, SegmentError> {
        let img = self.images.current().ok_or(SegmentError::NoImageLoaded)?;
        let rect = self.selector.finalized().ok_or(SegmentError::NoRegionSelected)?;
        let pixel_box = rect.to_pixel_box(img.width(), img.height())?;

        self.next_request_id += 1;
        let request = AnalysisRequest {
            generation: img.generation,
            request_id: self.next_request_id,
            pixel_box,
        };
        self.pending = Some(request);
        crate::log_info!(
            "Analysis #{} requested for box {:?} on image #{}",
            request.request_id,
            pixel_box.as_array(),
            request.generation
        );
        Ok(request)
    }

    /// Take a finished prediction back from the model. Only the answer to
    /// the latest request for the image currently loaded is displayed.
    pub fn accept_result(
        &mut self,
        generation: u64,
        request_id: u64,
        result: Result<Prediction, SegmentError>,
    ) -> Accepted {
        if generation != self.images.generation() {
            crate::log_info!(
                "Discarding result #{} for replaced image #{}",
                request_id,
                generation
            );
            return Accepted::Stale;
        }
        if self.pending.map(|p| p.request_id) != Some(request_id) {
            crate::log_info!("Discarding superseded result #{}", request_id);
            return Accepted::Superseded;
        }
        self.pending = None;

        let prediction = match result {
            Ok(p) => p,
            Err(e) => {
                crate::log_err!("Analysis #{} failed: {}", request_id, e);
                return Accepted::Failed(e);
            }
        };
        let pixel_box = prediction.pixel_box;
        let best = prediction.into_best();
        let shown = MaskResult {
            image: mask::render(&best.mask),
            score: best.score,
            foreground: best.mask.foreground_count(),
            pixel_box,
        };
        crate::log_info!(
            "Showing mask for #{}: score {:.3}, {} foreground pixels",
            request_id,
            shown.score,
            shown.foreground
        );
        let accepted = Accepted::Shown { score: shown.score, foreground: shown.foreground };
        self.mask = Some(shown);
        self.show_mask = true;
        self.needs_fit = true;
        self.view_revision += 1;
        accepted
    }

    /// Forget the outstanding request, e.g. after the model went away.
    pub fn abandon_pending(&mut self) {
        self.pending = None;
    }
}
