//! Region of interest: the rectangle the user drags over the object, and
//! the press / move / release state machine that produces it.
//!
//! Everything here lives in scene space (image pixels as floats). The canvas
//! maps pointer positions through the `CoordinateMapper` before calling in,
//! and only reads `live_rect()` back to paint the overlay.

use crate::error::SegmentError;
use crate::segmentation::PixelBox;
use egui::Pos2;

/// Top-left corner plus extent. While drawing, `width`/`height` are negative
/// when the pointer is left of / above the anchor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RegionRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl RegionRect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    /// Rectangle anchored at `anchor` reaching to `corner`, signs preserved.
    pub fn from_anchor(anchor: Pos2, corner: Pos2) -> Self {
        Self {
            x: anchor.x,
            y: anchor.y,
            width: corner.x - anchor.x,
            height: corner.y - anchor.y,
        }
    }

    /// Same area with the origin moved to the true top-left and
    /// non-negative extents.
    pub fn normalized(&self) -> Self {
        let (x0, x1) = min_max(self.x, self.x + self.width);
        let (y0, y1) = min_max(self.y, self.y + self.height);
        Self { x: x0, y: y0, width: x1 - x0, height: y1 - y0 }
    }

    pub fn min(&self) -> Pos2 {
        let n = self.normalized();
        Pos2::new(n.x, n.y)
    }

    pub fn max(&self) -> Pos2 {
        let n = self.normalized();
        Pos2::new(n.x + n.width, n.y + n.height)
    }

    pub fn corners(&self) -> [Pos2; 4] {
        let (a, b) = (self.min(), self.max());
        [a, Pos2::new(b.x, a.y), b, Pos2::new(a.x, b.y)]
    }

    pub fn to_egui_rect(&self) -> egui::Rect {
        egui::Rect::from_min_max(self.min(), self.max())
    }

    /// Integer model box for an image of `image_w`×`image_h` pixels.
    ///
    /// Origin and extent are truncated separately (a (10.7, 10.2, 49.9, 70)
    /// rectangle becomes [10, 10, 59, 80]), partial overlaps are clipped to the
    /// image, and anything that ends up empty or fully outside is rejected.
    pub fn to_pixel_box(&self, image_w: u32, image_h: u32) -> Result<PixelBox, SegmentError> {
        let n = self.normalized();
        if !(n.x.is_finite() && n.y.is_finite() && n.width.is_finite() && n.height.is_finite()) {
            return Err(SegmentError::InvalidRegion("rectangle is not finite".into()));
        }
        let x_min = n.x.trunc() as i64;
        let y_min = n.y.trunc() as i64;
        let x_max = x_min + n.width.trunc() as i64;
        let y_max = y_min + n.height.trunc() as i64;

        let (w, h) = (image_w as i64, image_h as i64);
        if x_max <= 0 || y_max <= 0 || x_min >= w || y_min >= h {
            return Err(SegmentError::InvalidRegion(format!(
                "rectangle [{}, {}, {}, {}] lies outside the {}x{} image",
                x_min, y_min, x_max, y_max, image_w, image_h
            )));
        }
        let clipped = PixelBox {
            x_min: x_min.clamp(0, w) as u32,
            y_min: y_min.clamp(0, h) as u32,
            x_max: x_max.clamp(0, w) as u32,
            y_max: y_max.clamp(0, h) as u32,
        };
        clipped.validate(image_w, image_h)?;
        Ok(clipped)
    }
}

fn min_max(a: f32, b: f32) -> (f32, f32) {
    if a <= b { (a, b) } else { (b, a) }
}

#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub enum SelectorState {
    #[default]
    Idle,
    Drawing { anchor: Pos2, current: Pos2 },
    Finalized(RegionRect),
}

/// At most one live rectangle; every new press throws the previous one away.
#[derive(Clone, Debug, Default)]
pub struct RegionSelector {
    state: SelectorState,
}

impl RegionSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SelectorState {
        self.state
    }

    pub fn is_drawing(&self) -> bool {
        matches!(self.state, SelectorState::Drawing { .. })
    }

    /// Primary button went down at `p`: start a new rectangle anchored there.
    pub fn press(&mut self, p: Pos2) {
        self.state = SelectorState::Drawing { anchor: p, current: p };
    }

    /// If `p` is within `tolerance` of a corner of the finalized rectangle,
    /// restart drawing anchored at the opposite corner so the drag resizes it.
    pub fn grab_handle(&mut self, p: Pos2, tolerance: f32) -> bool {
        let SelectorState::Finalized(rect) = self.state else { return false };
        let corners = rect.corners();
        let hit = corners
            .iter()
            .position(|c| (c.x - p.x).abs() <= tolerance && (c.y - p.y).abs() <= tolerance);
        match hit {
            Some(i) => {
                self.state = SelectorState::Drawing { anchor: corners[(i + 2) % 4], current: corners[i] };
                true
            }
            None => false,
        }
    }

    /// Pointer moved with the button held. Ignored unless drawing.
    pub fn drag(&mut self, p: Pos2) {
        if let SelectorState::Drawing { current, .. } = &mut self.state {
            *current = p;
        }
    }

    /// Button released: freeze the geometry (normalized) and hand it out.
    pub fn release(&mut self, p: Pos2) -> Option<RegionRect> {
        let SelectorState::Drawing { anchor, .. } = self.state else { return None };
        let rect = RegionRect::from_anchor(anchor, p).normalized();
        self.state = SelectorState::Finalized(rect);
        Some(rect)
    }

    /// Geometry to paint right now, as drawn (extents may be negative).
    pub fn live_rect(&self) -> Option<RegionRect> {
        match self.state {
            SelectorState::Idle => None,
            SelectorState::Drawing { anchor, current } => Some(RegionRect::from_anchor(anchor, current)),
            SelectorState::Finalized(rect) => Some(rect),
        }
    }

    pub fn finalized(&self) -> Option<RegionRect> {
        match self.state {
            SelectorState::Finalized(rect) => Some(rect),
            _ => None,
        }
    }

    pub fn clear(&mut self) {
        self.state = SelectorState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drag(selector: &mut RegionSelector, from: (f32, f32), to: (f32, f32)) -> Option<RegionRect> {
        selector.press(Pos2::new(from.0, from.1));
        selector.drag(Pos2::new((from.0 + to.0) / 2.0, (from.1 + to.1) / 2.0));
        selector.drag(Pos2::new(to.0, to.1));
        selector.release(Pos2::new(to.0, to.1))
    }

    #[test]
    fn drag_down_right() {
        let mut s = RegionSelector::new();
        assert_eq!(drag(&mut s, (10.0, 10.0), (60.0, 80.0)), Some(RegionRect::new(10.0, 10.0, 50.0, 70.0)));
    }

    #[test]
    fn extents_are_absolute_for_every_drag_direction() {
        let corners = [(60.0, 80.0), (10.0, 10.0), (60.0, 10.0), (10.0, 80.0)];
        for &from in &corners {
            for &to in &corners {
                if from.0 == to.0 || from.1 == to.1 {
                    continue;
                }
                let mut s = RegionSelector::new();
                let rect = drag(&mut s, from, to).unwrap();
                assert_eq!(rect, RegionRect::new(10.0, 10.0, 50.0, 70.0), "drag {:?} -> {:?}", from, to);
            }
        }
    }

    #[test]
    fn live_rect_keeps_sign_while_drawing() {
        let mut s = RegionSelector::new();
        s.press(Pos2::new(60.0, 80.0));
        s.drag(Pos2::new(10.0, 10.0));
        let live = s.live_rect().unwrap();
        assert_eq!((live.width, live.height), (-50.0, -70.0));
        assert_eq!(s.finalized(), None);
    }

    #[test]
    fn new_press_discards_previous_rectangle() {
        let mut s = RegionSelector::new();
        drag(&mut s, (0.0, 0.0), (20.0, 20.0));
        s.press(Pos2::new(5.0, 5.0));
        assert!(s.is_drawing());
        assert_eq!(s.finalized(), None);
    }

    #[test]
    fn moves_and_releases_outside_a_drag_are_ignored() {
        let mut s = RegionSelector::new();
        s.drag(Pos2::new(3.0, 3.0));
        assert_eq!(s.release(Pos2::new(4.0, 4.0)), None);
        assert_eq!(s.state(), SelectorState::Idle);
    }

    #[test]
    fn grabbing_a_corner_resizes_from_the_opposite_one() {
        let mut s = RegionSelector::new();
        drag(&mut s, (10.0, 10.0), (60.0, 80.0));
        assert!(s.grab_handle(Pos2::new(61.0, 79.0), 3.0));
        s.drag(Pos2::new(40.0, 50.0));
        assert_eq!(s.release(Pos2::new(40.0, 50.0)), Some(RegionRect::new(10.0, 10.0, 30.0, 40.0)));
        assert!(!s.grab_handle(Pos2::new(25.0, 25.0), 3.0));
    }

    #[test]
    fn pixel_box_matches_rectangle() {
        let b = RegionRect::new(10.0, 10.0, 50.0, 70.0).to_pixel_box(100, 100).unwrap();
        assert_eq!([b.x_min, b.y_min, b.x_max, b.y_max], [10, 10, 60, 80]);
    }

    #[test]
    fn pixel_box_truncates_origin_and_extent() {
        let b = RegionRect::new(10.7, 10.2, 49.9, 70.0).to_pixel_box(100, 100).unwrap();
        assert_eq!([b.x_min, b.y_min, b.x_max, b.y_max], [10, 10, 59, 80]);
    }

    #[test]
    fn degenerate_and_outside_rectangles_are_rejected() {
        let zero = RegionRect::new(30.0, 30.0, 0.0, 25.0).to_pixel_box(100, 100);
        assert!(matches!(zero, Err(SegmentError::InvalidRegion(_))));
        let sliver = RegionRect::new(30.0, 30.0, 0.6, 25.0).to_pixel_box(100, 100);
        assert!(matches!(sliver, Err(SegmentError::InvalidRegion(_))));
        let outside = RegionRect::new(120.0, 10.0, 20.0, 20.0).to_pixel_box(100, 100);
        assert!(matches!(outside, Err(SegmentError::InvalidRegion(_))));
    }

    #[test]
    fn partial_overlap_is_clipped() {
        let b = RegionRect::new(-10.0, 90.0, 30.0, 30.0).to_pixel_box(100, 100).unwrap();
        assert_eq!([b.x_min, b.y_min, b.x_max, b.y_max], [0, 90, 20, 100]);
    }
}
