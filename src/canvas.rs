use crate::error::SegmentError;
use crate::region::RegionRect;
use crate::workspace::{View, Workspace};
use egui::{Color32, ColorImage, Pos2, Rect, Stroke, TextureFilter, TextureOptions, Vec2};

/// Outline of the region of interest.
pub const REGION_STROKE: Color32 = Color32::from_rgb(255, 0, 0);
pub const REGION_STROKE_WIDTH: f32 = 2.0;
const REGION_FILL_ALPHA: u8 = 40;
const HANDLE_SIZE: f32 = 7.0;

/// Scroll-wheel zoom sensitivity, per point of scroll delta.
const ZOOM_PER_SCROLL: f32 = 0.005;

/// What happened on the canvas this frame that the shell may want to report.
#[derive(Default)]
pub struct CanvasResponse {
    pub region_finalized: Option<RegionRect>,
    pub error: Option<SegmentError>,
    pub hovered_pixel: Option<(u32, u32)>,
}

pub struct Canvas {
    texture: Option<egui::TextureHandle>,
    /// `(view revision, linear filtering)` the texture was built for.
    texture_key: Option<(u64, bool)>,
    pub background: Color32,
}

impl Default for Canvas {
    fn default() -> Self {
        Self::new()
    }
}

impl Canvas {
    pub fn new() -> Self {
        Self {
            texture: None,
            texture_key: None,
            background: Color32::from_gray(40),
        }
    }

    /// Paint the current view and route pointer input into the workspace.
    /// With `interactive == false` (a modal is open) the canvas only paints.
    pub fn show(&mut self, ui: &mut egui::Ui, ws: &mut Workspace, interactive: bool) -> CanvasResponse {
        let mut out = CanvasResponse::default();
        let available_size = ui.available_size();
        let sense = egui::Sense::click_and_drag().union(egui::Sense::hover());
        let (response, painter) = ui.allocate_painter(available_size, sense);
        let canvas_rect = response.rect;

        ws.sync_viewport(canvas_rect);

        if interactive {
            self.handle_input(ui, &response, ws, &mut out);
        }

        let linear = ws.mapper().transform().is_some_and(|t| use_linear_filter(t.scale));
        self.refresh_texture(ui.ctx(), ws, linear);

        // ---- paint ----
        painter.rect_filled(canvas_rect, 0.0, self.background);

        let Some(image_rect) = ws.mapper().image_rect_on_screen() else {
            painter.text(
                canvas_rect.center(),
                egui::Align2::CENTER_CENTER,
                "Upload an image to begin",
                egui::FontId::proportional(16.0),
                Color32::from_gray(160),
            );
            return out;
        };

        // soft shadow around the image
        for i in 0..4 {
            let distance = (i as f32 + 1.0) * 2.5;
            let alpha = ((4 - i) * 6) as u8;
            painter.rect_filled(image_rect.expand(distance), 2.0, Color32::from_black_alpha(alpha));
        }

        if let Some(texture) = &self.texture {
            let uv = Rect::from_min_max(Pos2::ZERO, Pos2::new(1.0, 1.0));
            painter.image(texture.id(), image_rect, uv, Color32::WHITE);
        }

        if let Some(sel) = ws.selection_on_screen() {
            let fill = Color32::from_rgba_unmultiplied(255, 0, 0, REGION_FILL_ALPHA);
            painter.rect_filled(sel, 0.0, fill);
            painter.rect_stroke(sel, 0.0, Stroke::new(REGION_STROKE_WIDTH, REGION_STROKE));
            if ws.selector().finalized().is_some() {
                for corner in [sel.left_top(), sel.right_top(), sel.right_bottom(), sel.left_bottom()] {
                    let handle = Rect::from_center_size(corner, Vec2::splat(HANDLE_SIZE));
                    painter.rect_filled(handle, 1.0, Color32::WHITE);
                    painter.rect_stroke(handle, 1.0, Stroke::new(1.0, REGION_STROKE));
                }
            }
        }

        if let Some(pos) = response.hover_pos()
            && ws.mapper().is_over_image(pos)
        {
            if interactive {
                ui.ctx().set_cursor_icon(egui::CursorIcon::Crosshair);
            }
            out.hovered_pixel = ws
                .mapper()
                .to_image_space(pos)
                .ok()
                .map(|p| (p.x.floor() as u32, p.y.floor() as u32));
        }

        out
    }

    fn handle_input(
        &mut self,
        ui: &egui::Ui,
        response: &egui::Response,
        ws: &mut Workspace,
        out: &mut CanvasResponse,
    ) {
        // Pan with the middle mouse button
        if response.dragged_by(egui::PointerButton::Middle) {
            ws.pan(response.drag_delta());
        }

        // Zoom around the cursor so the pixel under it stays put
        if response.hovered() {
            let scroll = ui.input(|i| i.scroll_delta.y);
            if let Some(pos) = response.hover_pos()
                && scroll.abs() > 0.1
            {
                ws.zoom_at(pos, zoom_factor(scroll));
            }
        }

        // Rectangle drawing with the primary button
        if response.drag_started_by(egui::PointerButton::Primary) {
            let origin = ui.input(|i| i.pointer.press_origin());
            if let Some(p) = origin.or_else(|| response.interact_pointer_pos())
                && let Err(e) = ws.pointer_pressed(p)
            {
                out.error = Some(e);
            }
        }
        if response.dragged_by(egui::PointerButton::Primary)
            && let Some(p) = response.interact_pointer_pos()
        {
            ws.pointer_dragged(p);
        }
        let released = response.drag_released_by(egui::PointerButton::Primary)
            || response.clicked_by(egui::PointerButton::Primary);
        if released {
            let pos = response
                .interact_pointer_pos()
                .or_else(|| ui.input(|i| i.pointer.latest_pos()));
            if let Some(p) = pos {
                // A bare click never produced a drag start.
                if !ws.selector().is_drawing()
                    && let Err(e) = ws.pointer_pressed(p)
                {
                    out.error = Some(e);
                    return;
                }
                out.region_finalized = ws.pointer_released(p);
            }
        }
    }

    /// Rebuild the texture when the painted raster or the sampling mode changed.
    fn refresh_texture(&mut self, ctx: &egui::Context, ws: &Workspace, linear: bool) {
        let key = (ws.view_revision(), linear);
        if self.texture_key == Some(key) && self.texture.is_some() {
            return;
        }
        let image: Option<ColorImage> = match ws.view() {
            View::Empty => None,
            View::Image(img) => Some(crate::mask::rgb_to_color_image(&img.rgb)),
            View::Mask(m) => Some(crate::mask::to_color_image(&m.image)),
        };
        self.texture_key = Some(key);
        let Some(image) = image else {
            self.texture = None;
            return;
        };
        let options = texture_options(linear);
        match self.texture.as_mut() {
            Some(tex) => tex.set(image, options),
            None => self.texture = Some(ctx.load_texture("segmentfe_canvas", image, options)),
        }
    }
}

/// Smooth sampling while the image is shown smaller than ~2x; crisp pixels
/// beyond that.
fn use_linear_filter(scale: f32) -> bool {
    scale < 2.0
}

fn texture_options(linear: bool) -> TextureOptions {
    let filter = if linear { TextureFilter::Linear } else { TextureFilter::Nearest };
    TextureOptions {
        magnification: filter,
        minification: filter,
        ..Default::default()
    }
}

fn zoom_factor(scroll: f32) -> f32 {
    (1.0 + scroll * ZOOM_PER_SCROLL).clamp(0.5, 2.0)
}
