use crate::canvas::Canvas;
use crate::error::SegmentError;
use crate::segmentation::sam::SamModel;
use crate::segmentation::worker::{Event, InferenceWorker};
use crate::settings::{AppSettings, DevicePreference};
use crate::workspace::{Accepted, Workspace};

const WINDOW_TITLE: &str = "SAM Segmentation";
const DRAW_HINT: &str = "Click and drag on the image to select the object";

const ERROR_COLOR: egui::Color32 = egui::Color32::from_rgb(220, 60, 60);
const OK_COLOR: egui::Color32 = egui::Color32::from_rgb(0, 170, 0);

/// Lifecycle of the model owned by the inference thread.
enum ModelState {
    Loading,
    Ready { device: String },
    Unavailable(String),
}

struct StatusLine {
    text: String,
    is_error: bool,
}

impl StatusLine {
    fn info(text: impl Into<String>) -> Self {
        Self { text: text.into(), is_error: false }
    }

    fn error(err: &SegmentError) -> Self {
        Self { text: err.to_string(), is_error: true }
    }
}

// ============================================================================
// SETTINGS WINDOW: staged edits, applied on demand
// ============================================================================

#[derive(Default)]
struct SettingsWindow {
    open: bool,
    staged: AppSettings,
    /// Result of the last ONNX Runtime probe (None = not tested yet)
    probe_result: Option<Result<String, String>>,
}

impl SettingsWindow {
    fn open_with(&mut self, settings: &AppSettings) {
        self.staged = settings.clone();
        self.probe_result = None;
        self.open = true;
    }

    /// Returns true when the user pressed Apply.
    fn show(&mut self, ctx: &egui::Context) -> bool {
        if !self.open {
            return false;
        }
        let mut applied = false;
        let mut close = false;
        let mut open = self.open;
        egui::Window::new("Settings")
            .open(&mut open)
            .collapsible(false)
            .resizable(false)
            .default_width(460.0)
            .show(ctx, |ui| {
                ui.strong("ONNX Runtime");
                ui.label("Library path");
                path_row(ui, &mut self.staged.onnx_runtime_path, "onnxruntime.dll / libonnxruntime.so", |d| {
                    d.add_filter("Dynamic Library", &["dll", "so", "dylib"])
                });
                ui.horizontal(|ui| {
                    if ui.button("Test runtime").clicked() {
                        self.probe_result = Some(if self.staged.onnx_runtime_path.is_empty() {
                            Err("No library path set".to_string())
                        } else {
                            crate::segmentation::ort::probe_onnx_runtime(&self.staged.onnx_runtime_path)
                                .map_err(|e| e.to_string())
                        });
                    }
                    match &self.probe_result {
                        Some(Ok(version)) => {
                            ui.colored_label(OK_COLOR, format!("ONNX Runtime {} loaded", version));
                        }
                        Some(Err(e)) => {
                            ui.colored_label(ERROR_COLOR, format!("\u{274C} {}", e));
                        }
                        None => {
                            ui.weak("Not tested");
                        }
                    }
                });

                ui.add_space(8.0);
                ui.strong("Segment-Anything model");
                ui.label("Image encoder");
                path_row(ui, &mut self.staged.encoder_model_path, "sam_encoder.onnx", |d| {
                    d.add_filter("ONNX Model", &["onnx"])
                });
                ui.label("Prompt decoder");
                path_row(ui, &mut self.staged.decoder_model_path, "sam_decoder.onnx", |d| {
                    d.add_filter("ONNX Model", &["onnx"])
                });

                ui.add_space(8.0);
                egui::Grid::new("model_options_grid")
                    .num_columns(2)
                    .spacing([16.0, 6.0])
                    .show(ui, |ui| {
                        ui.label("Device");
                        egui::ComboBox::from_id_source("device_combo")
                            .selected_text(self.staged.device.as_str())
                            .show_ui(ui, |ui| {
                                for &d in DevicePreference::all() {
                                    ui.selectable_value(&mut self.staged.device, d, d.as_str());
                                }
                            });
                        ui.end_row();

                        ui.label("Candidate masks");
                        ui.checkbox(&mut self.staged.multimask, "keep the best of several");
                        ui.end_row();

                        ui.label("Mask threshold");
                        ui.add(
                            egui::DragValue::new(&mut self.staged.mask_threshold)
                                .speed(0.05)
                                .clamp_range(-10.0..=10.0),
                        );
                        ui.end_row();
                    });

                ui.add_space(12.0);
                ui.separator();
                ui.horizontal(|ui| {
                    if ui.button("Apply").clicked() {
                        applied = true;
                        close = true;
                    }
                    if ui.button("Cancel").clicked() {
                        close = true;
                    }
                });
            });
        self.open = open && !close;
        applied
    }
}

fn path_row(
    ui: &mut egui::Ui,
    value: &mut String,
    hint: &str,
    filter: impl FnOnce(rfd::FileDialog) -> rfd::FileDialog,
) {
    ui.horizontal(|ui| {
        let field_w = (ui.available_width() - 38.0).max(120.0);
        ui.add(egui::TextEdit::singleline(value).desired_width(field_w).hint_text(hint));
        if ui.button("\u{1F4C2}").clicked()
            && let Some(path) = filter(rfd::FileDialog::new()).pick_file()
        {
            *value = path.display().to_string();
        }
    });
}

fn spawn_worker(settings: &AppSettings) -> InferenceWorker {
    let settings = settings.clone();
    InferenceWorker::spawn(move || SamModel::load(&settings))
}

// ============================================================================
// APPLICATION SHELL
// ============================================================================

pub struct SegmentFEApp {
    settings: AppSettings,
    workspace: Workspace,
    canvas: Canvas,
    worker: InferenceWorker,
    model: ModelState,
    /// Image generation whose embedding the worker reported as ready.
    embedded_generation: Option<u64>,
    status: StatusLine,
    settings_window: SettingsWindow,
    /// Egui time at which the outstanding analysis was sent.
    analysis_started: Option<f64>,
    hovered_pixel: Option<(u32, u32)>,
    last_title: String,
}

impl SegmentFEApp {
    pub fn new(_cc: &eframe::CreationContext<'_>, settings: AppSettings) -> Self {
        let worker = spawn_worker(&settings);
        Self {
            settings,
            workspace: Workspace::new(),
            canvas: Canvas::new(),
            worker,
            model: ModelState::Loading,
            embedded_generation: None,
            status: StatusLine::info("Loading model\u{2026}"),
            settings_window: SettingsWindow::default(),
            analysis_started: None,
            hovered_pixel: None,
            last_title: String::new(),
        }
    }

    fn model_ready(&self) -> bool {
        matches!(self.model, ModelState::Ready { .. })
    }

    // --- button actions ---

    fn upload_image(&mut self) {
        let Some(path) = crate::image_store::pick_image_path(&self.settings.last_open_dir) else {
            return;
        };
        match self.workspace.upload(&path) {
            Ok(img) => {
                let (generation, rgb) = (img.generation, img.rgb.clone());
                let text = format!("Loaded {} ({}x{})", img.file_name(), img.width(), img.height());
                self.worker.set_image(generation, rgb);
                self.embedded_generation = None;
                self.analysis_started = None;
                self.status = StatusLine::info(text);
                if let Some(dir) = path.parent() {
                    self.settings.last_open_dir = dir.display().to_string();
                    self.settings.save();
                }
            }
            Err(e) => {
                crate::log_err!("{}", e);
                self.status = StatusLine::error(&e);
            }
        }
    }

    fn segment_input(&mut self) {
        match self.workspace.arm_selection() {
            Ok(()) => self.status = StatusLine::info(DRAW_HINT),
            Err(e) => self.status = StatusLine::error(&e),
        }
    }

    fn analyze(&mut self, now: f64) {
        if let ModelState::Unavailable(reason) = &self.model {
            self.status = StatusLine::error(&SegmentError::ModelUnavailable(reason.clone()));
            return;
        }
        match self.workspace.prepare_analysis() {
            Ok(req) => {
                // Re-embed when the last attempt failed; the worker skips
                // this if the features are already there.
                if self.embedded_generation != Some(req.generation)
                    && let Some(img) = self.workspace.image()
                {
                    self.worker.set_image(img.generation, img.rgb.clone());
                }
                self.worker.predict(req.generation, req.request_id, req.pixel_box);
                self.analysis_started = Some(now);
                self.status = StatusLine::info("Analyzing segments\u{2026}");
            }
            Err(e) => {
                crate::log_warn!("Analysis rejected: {}", e);
                self.status = StatusLine::error(&e);
            }
        }
    }

    fn apply_settings(&mut self, staged: AppSettings) {
        let reload = staged.onnx_runtime_path != self.settings.onnx_runtime_path
            || staged.encoder_model_path != self.settings.encoder_model_path
            || staged.decoder_model_path != self.settings.decoder_model_path
            || staged.device != self.settings.device
            || staged.multimask != self.settings.multimask
            || staged.mask_threshold != self.settings.mask_threshold
            || matches!(self.model, ModelState::Unavailable(_));
        self.settings = AppSettings { last_open_dir: self.settings.last_open_dir.clone(), ..staged };
        self.settings.save();
        if !reload {
            return;
        }
        crate::log_info!("Settings changed, reloading model");
        // Dropping the old handle stops its thread once it is idle.
        self.worker = spawn_worker(&self.settings);
        self.model = ModelState::Loading;
        self.embedded_generation = None;
        self.analysis_started = None;
        self.workspace.abandon_pending();
        if let Some(img) = self.workspace.image() {
            self.worker.set_image(img.generation, img.rgb.clone());
        }
        self.status = StatusLine::info("Loading model\u{2026}");
    }

    // --- worker events ---

    fn poll_worker(&mut self) {
        while let Some(event) = self.worker.poll() {
            match event {
                Event::ModelReady { device } => {
                    crate::log_info!("Model ready on {}", device);
                    self.status = StatusLine::info(format!("Model ready ({})", device));
                    self.model = ModelState::Ready { device };
                }
                Event::ModelFailed(e) => {
                    crate::log_err!("Segmentation disabled: {}", e);
                    self.status = StatusLine::error(&e);
                    self.model = ModelState::Unavailable(match &e {
                        SegmentError::ModelUnavailable(reason) => reason.clone(),
                        other => other.to_string(),
                    });
                    self.workspace.abandon_pending();
                    self.analysis_started = None;
                }
                Event::ImageReady { generation } => {
                    if generation == self.workspace.generation() {
                        self.embedded_generation = Some(generation);
                    }
                }
                Event::ImageFailed { generation, error } => {
                    if generation == self.workspace.generation() {
                        crate::log_err!("Embedding image #{} failed: {}", generation, error);
                        self.status = StatusLine::error(&error);
                    }
                }
                Event::PredictionDone { generation, request_id, result } => {
                    match self.workspace.accept_result(generation, request_id, result) {
                        Accepted::Shown { score, foreground } => {
                            self.analysis_started = None;
                            self.status = StatusLine::info(format!(
                                "Mask ready: score {:.3}, {} pixels",
                                score, foreground
                            ));
                        }
                        Accepted::Failed(e) => {
                            self.analysis_started = None;
                            self.status = StatusLine::error(&e);
                        }
                        Accepted::Stale | Accepted::Superseded => {}
                    }
                }
            }
        }
    }

    // --- panels ---

    fn button_bar(&mut self, ui: &mut egui::Ui, now: f64) {
        let has_image = self.workspace.image().is_some();
        ui.horizontal(|ui| {
            if ui.button("Upload Image").clicked() {
                self.upload_image();
            }
            if ui.add_enabled(has_image, egui::Button::new("Segment Input")).clicked() {
                self.segment_input();
            }
            let can_analyze = has_image && self.model_ready();
            let analyze = ui
                .add_enabled(can_analyze, egui::Button::new("Analyze Segments"))
                .on_disabled_hover_text("Needs an image and a loaded model");
            if analyze.clicked() {
                self.analyze(now);
            }

            ui.separator();
            let toggle_label = if self.workspace.showing_mask() { "Show Image" } else { "Show Mask" };
            if ui
                .add_enabled(self.workspace.mask().is_some(), egui::Button::new(toggle_label))
                .clicked()
            {
                self.workspace.toggle_mask_view();
            }
            if ui
                .add_enabled(self.workspace.selector().live_rect().is_some(), egui::Button::new("Clear Selection"))
                .clicked()
            {
                self.workspace.clear_selection();
            }
            if ui.add_enabled(has_image, egui::Button::new("Fit")).clicked() {
                self.workspace.fit_to_view();
            }

            ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                if ui.button("\u{2699} Settings").clicked() {
                    self.settings_window.open_with(&self.settings);
                }
            });
        });
    }

    fn status_bar(&self, ui: &mut egui::Ui, now: f64) {
        ui.horizontal(|ui| {
            if self.status.is_error {
                ui.colored_label(ERROR_COLOR, &self.status.text);
            } else {
                ui.label(&self.status.text);
            }

            ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                match &self.model {
                    ModelState::Loading => {
                        ui.add(egui::Spinner::new());
                        ui.weak("Model loading");
                    }
                    ModelState::Ready { device } => {
                        ui.weak(format!("Model: {}", device));
                    }
                    ModelState::Unavailable(_) => {
                        ui.colored_label(ERROR_COLOR, "Model unavailable");
                    }
                }
                if let Some(started) = self.analysis_started {
                    ui.separator();
                    ui.add(egui::Spinner::new());
                    ui.weak(format!("{:.1}s", now - started));
                }
                if let Some(m) = self.workspace.mask() {
                    ui.separator();
                    ui.weak(format!("score {:.3} \u{2022} {} px", m.score, m.foreground));
                }
                if let Some(rect) = self.workspace.selector().finalized() {
                    ui.separator();
                    ui.weak(format!(
                        "box ({:.0}, {:.0}) {:.0}\u{00D7}{:.0}",
                        rect.x, rect.y, rect.width, rect.height
                    ));
                }
                if let Some((x, y)) = self.hovered_pixel {
                    ui.separator();
                    ui.weak(format!("{}, {}", x, y));
                }
                if let Some(img) = self.workspace.image() {
                    ui.separator();
                    let embedded = if self.embedded_generation == Some(img.generation) { "" } else { " \u{2022} embedding" };
                    ui.weak(format!("{} \u{2022} {}\u{00D7}{}{}", img.path.display(), img.width(), img.height(), embedded));
                }
            });
        });
    }

    fn update_title(&mut self, ctx: &egui::Context) {
        let title = match self.workspace.image() {
            Some(img) => format!("{} - {}", WINDOW_TITLE, img.file_name()),
            None => WINDOW_TITLE.to_string(),
        };
        if title != self.last_title {
            ctx.send_viewport_cmd(egui::ViewportCommand::Title(title.clone()));
            self.last_title = title;
        }
    }
}

impl eframe::App for SegmentFEApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        let now = ctx.input(|i| i.time);

        // --- Poll async inference results ---
        self.poll_worker();
        // Keep polling while the worker has something in flight
        if self.analysis_started.is_some() || matches!(self.model, ModelState::Loading) {
            ctx.request_repaint();
        }

        self.update_title(ctx);

        let modal_open = self.settings_window.open;
        if !modal_open && ctx.input(|i| i.key_pressed(egui::Key::Escape)) {
            self.workspace.clear_selection();
        }

        egui::TopBottomPanel::top("button_bar").show(ctx, |ui| {
            ui.add_space(2.0);
            self.button_bar(ui, now);
            ui.add_space(2.0);
        });

        egui::TopBottomPanel::bottom("status_bar").show(ctx, |ui| {
            self.status_bar(ui, now);
        });

        egui::CentralPanel::default()
            .frame(egui::Frame::none())
            .show(ctx, |ui| {
                let response = self.canvas.show(ui, &mut self.workspace, !modal_open);
                self.hovered_pixel = response.hovered_pixel;
                if let Some(e) = response.error {
                    self.status = StatusLine::error(&e);
                } else if let Some(rect) = response.region_finalized {
                    self.status = StatusLine::info(format!(
                        "Region {:.0}\u{00D7}{:.0} at ({:.0}, {:.0}) - press Analyze Segments",
                        rect.width, rect.height, rect.x, rect.y
                    ));
                }
            });

        if self.settings_window.show(ctx) {
            let staged = self.settings_window.staged.clone();
            self.apply_settings(staged);
        }
    }
}
