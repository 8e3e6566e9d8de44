//! Screen ↔ image-space mapping for the canvas.
//!
//! Scene space is the image's own pixel grid expressed in floats: (0,0) is the
//! top-left corner of the top-left pixel and (w,h) the bottom-right corner of
//! the image. The canvas shows the scene under a uniform scale plus a screen
//! offset; fitting, zooming and panning only change those two numbers.

use crate::error::SegmentError;
use egui::{Pos2, Rect, Vec2};

const MIN_SCALE: f32 = 0.02;
const MAX_SCALE: f32 = 64.0;

/// Uniform scale + translation from scene space to screen points.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewTransform {
    /// Screen points per image pixel.
    pub scale: f32,
    /// Screen position of scene (0,0).
    pub origin: Pos2,
}

impl ViewTransform {
    /// Largest scale that shows the whole image inside `viewport` while
    /// keeping its aspect ratio, centred on both axes.
    pub fn fit(image_size: Vec2, viewport: Rect) -> Self {
        if image_size.x <= 0.0 || image_size.y <= 0.0 || viewport.width() <= 0.0 || viewport.height() <= 0.0 {
            return Self { scale: 1.0, origin: viewport.min };
        }
        let scale = (viewport.width() / image_size.x)
            .min(viewport.height() / image_size.y)
            .clamp(MIN_SCALE, MAX_SCALE);
        let shown = image_size * scale;
        let origin = viewport.center() - shown / 2.0;
        Self { scale, origin }
    }

    pub fn to_scene(&self, screen: Pos2) -> Pos2 {
        Pos2::new(
            (screen.x - self.origin.x) / self.scale,
            (screen.y - self.origin.y) / self.scale,
        )
    }

    pub fn to_screen(&self, scene: Pos2) -> Pos2 {
        Pos2::new(
            self.origin.x + scene.x * self.scale,
            self.origin.y + scene.y * self.scale,
        )
    }

    pub fn scene_rect_to_screen(&self, scene: Rect) -> Rect {
        Rect::from_two_pos(self.to_screen(scene.min), self.to_screen(scene.max))
    }

    /// Multiply the scale by `factor`, keeping the scene point under `anchor` fixed.
    pub fn zoom_at(&mut self, anchor: Pos2, factor: f32) {
        let scene = self.to_scene(anchor);
        self.scale = (self.scale * factor).clamp(MIN_SCALE, MAX_SCALE);
        self.origin = Pos2::new(anchor.x - scene.x * self.scale, anchor.y - scene.y * self.scale);
    }

    pub fn pan(&mut self, delta: Vec2) {
        self.origin += delta;
    }
}

/// Maps pointer positions to image pixels for the current image.
///
/// Holds no transform until an image has been fitted; every mapping request
/// before that fails with `NoImageLoaded`.
#[derive(Clone, Debug, Default)]
pub struct CoordinateMapper {
    transform: Option<ViewTransform>,
    image_size: Vec2,
    /// Viewport used for the last fit; `None` once the user zoomed or panned.
    fitted_to: Option<Rect>,
}

impl CoordinateMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transform(&self) -> Option<ViewTransform> {
        self.transform
    }

    pub fn image_size(&self) -> Vec2 {
        self.image_size
    }

    /// Fit a freshly loaded (or freshly displayed) image into `viewport`.
    pub fn fit_image(&mut self, width: u32, height: u32, viewport: Rect) {
        self.image_size = Vec2::new(width as f32, height as f32);
        self.transform = Some(ViewTransform::fit(self.image_size, viewport));
        self.fitted_to = Some(viewport);
    }

    /// Re-fit the current image, e.g. from the "Fit" button.
    pub fn refit(&mut self, viewport: Rect) {
        if self.transform.is_some() {
            self.transform = Some(ViewTransform::fit(self.image_size, viewport));
            self.fitted_to = Some(viewport);
        }
    }

    /// Keep a fitted view fitted when the window is resized. Zoomed or
    /// panned views are left alone.
    pub fn track_viewport(&mut self, viewport: Rect) {
        if let Some(previous) = self.fitted_to
            && previous != viewport
        {
            self.refit(viewport);
        }
    }

    pub fn clear(&mut self) {
        self.transform = None;
        self.image_size = Vec2::ZERO;
        self.fitted_to = None;
    }

    pub fn zoom_at(&mut self, anchor: Pos2, factor: f32) {
        if let Some(t) = self.transform.as_mut() {
            t.zoom_at(anchor, factor);
            self.fitted_to = None;
        }
    }

    pub fn pan(&mut self, delta: Vec2) {
        if let Some(t) = self.transform.as_mut() {
            t.pan(delta);
            self.fitted_to = None;
        }
    }

    /// True when `screen` lies over the displayed image.
    pub fn is_over_image(&self, screen: Pos2) -> bool {
        self.transform.is_some_and(|t| {
            let p = t.to_scene(screen);
            p.x >= 0.0 && p.y >= 0.0 && p.x <= self.image_size.x && p.y <= self.image_size.y
        })
    }

    /// Screen position → scene position, clamped to the image bounds so a
    /// drag that leaves the image can never describe an out-of-range box.
    pub fn to_image_space(&self, screen: Pos2) -> Result<Pos2, SegmentError> {
        let t = self.transform.ok_or(SegmentError::NoImageLoaded)?;
        let p = t.to_scene(screen);
        Ok(Pos2::new(
            p.x.clamp(0.0, self.image_size.x),
            p.y.clamp(0.0, self.image_size.y),
        ))
    }

    /// Screen rectangle occupied by the image.
    pub fn image_rect_on_screen(&self) -> Option<Rect> {
        self.transform
            .map(|t| t.scene_rect_to_screen(Rect::from_min_size(Pos2::ZERO, self.image_size)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: Pos2, b: Pos2) -> bool {
        (a.x - b.x).abs() < 1e-3 && (a.y - b.y).abs() < 1e-3
    }

    #[test]
    fn fit_keeps_aspect_and_centres() {
        // 200x100 image in a 400x400 viewport: limited by width, scale 2
        let viewport = Rect::from_min_size(Pos2::new(10.0, 20.0), Vec2::new(400.0, 400.0));
        let t = ViewTransform::fit(Vec2::new(200.0, 100.0), viewport);
        assert!((t.scale - 2.0).abs() < 1e-6);
        // shown size 400x200, vertically centred: 20 + (400-200)/2 = 120
        assert!(approx(t.origin, Pos2::new(10.0, 120.0)), "origin {:?}", t.origin);
    }

    #[test]
    fn scene_and_screen_are_inverse() {
        let viewport = Rect::from_min_size(Pos2::new(5.0, 7.0), Vec2::new(300.0, 200.0));
        let mut t = ViewTransform::fit(Vec2::new(640.0, 480.0), viewport);
        t.zoom_at(Pos2::new(100.0, 80.0), 2.5);
        t.pan(Vec2::new(-13.0, 4.0));
        let scene = Pos2::new(123.5, 77.25);
        assert!(approx(t.to_scene(t.to_screen(scene)), scene));
    }

    #[test]
    fn zoom_keeps_anchor_fixed() {
        let viewport = Rect::from_min_size(Pos2::ZERO, Vec2::new(100.0, 100.0));
        let mut t = ViewTransform::fit(Vec2::new(100.0, 100.0), viewport);
        let anchor = Pos2::new(30.0, 60.0);
        let before = t.to_scene(anchor);
        t.zoom_at(anchor, 4.0);
        assert!(approx(t.to_scene(anchor), before));
    }

    #[test]
    fn mapping_without_image_is_an_error() {
        let mapper = CoordinateMapper::new();
        assert_eq!(
            mapper.to_image_space(Pos2::new(1.0, 1.0)),
            Err(SegmentError::NoImageLoaded)
        );
    }

    #[test]
    fn pointer_outside_image_is_clamped() {
        let mut mapper = CoordinateMapper::new();
        // 1:1 fit: 100x100 image in a 100x100 viewport at the origin
        mapper.fit_image(100, 100, Rect::from_min_size(Pos2::ZERO, Vec2::splat(100.0)));
        assert_eq!(mapper.to_image_space(Pos2::new(-20.0, 150.0)), Ok(Pos2::new(0.0, 100.0)));
        assert_eq!(mapper.to_image_space(Pos2::new(10.0, 80.0)), Ok(Pos2::new(10.0, 80.0)));
        assert!(!mapper.is_over_image(Pos2::new(-1.0, 5.0)));
    }

    #[test]
    fn scaled_view_maps_back_to_pixels() {
        let mut mapper = CoordinateMapper::new();
        // 1000x500 image shown in a 500x500 viewport → scale 0.5, offset y = 125
        mapper.fit_image(1000, 500, Rect::from_min_size(Pos2::ZERO, Vec2::splat(500.0)));
        let p = mapper.to_image_space(Pos2::new(250.0, 250.0)).unwrap();
        assert!(approx(p, Pos2::new(500.0, 250.0)), "got {:?}", p);
    }

    #[test]
    fn resize_refits_only_untouched_views() {
        let mut mapper = CoordinateMapper::new();
        let small = Rect::from_min_size(Pos2::ZERO, Vec2::splat(100.0));
        let large = Rect::from_min_size(Pos2::ZERO, Vec2::splat(200.0));
        mapper.fit_image(100, 100, small);
        mapper.track_viewport(large);
        assert_eq!(mapper.transform().map(|t| t.scale), Some(2.0));

        mapper.zoom_at(Pos2::ZERO, 2.0);
        mapper.track_viewport(small);
        assert_eq!(mapper.transform().map(|t| t.scale), Some(4.0));
    }
}
