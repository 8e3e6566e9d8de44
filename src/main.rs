// GUI-subsystem binary: no console window is ever allocated by Windows.
#![windows_subsystem = "windows"]

use segmentfe::app::SegmentFEApp;
use segmentfe::settings::AppSettings;
use segmentfe::{log_info, logger};

fn main() -> Result<(), eframe::Error> {
    // Initialize session log (overwrites previous session log)
    logger::init();

    let settings = AppSettings::load();
    log_info!(
        "Settings loaded: device={}, encoder={}, decoder={}",
        settings.device.as_str(),
        display_or_unset(&settings.encoder_model_path),
        display_or_unset(&settings.decoder_model_path)
    );

    // Define the native window options
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([800.0, 600.0])
            .with_min_inner_size([480.0, 360.0])
            .with_title("SAM Segmentation"),
        ..Default::default()
    };

    // Run the application
    eframe::run_native(
        "SegmentFE",
        options,
        Box::new(move |cc| Box::new(SegmentFEApp::new(cc, settings))),
    )
}

fn display_or_unset(path: &str) -> &str {
    if path.is_empty() { "<unset>" } else { path }
}
