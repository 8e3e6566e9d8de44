//! The currently loaded source image and where it came from.

use crate::error::SegmentError;
use image::RgbImage;
use rfd::FileDialog;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Extensions offered by the upload dialog.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "webp"];

/// An uploaded image. `generation` increases with every upload so results
/// computed for an older image can be recognised and dropped.
#[derive(Clone, Debug)]
pub struct LoadedImage {
    pub rgb: Arc<RgbImage>,
    pub path: PathBuf,
    pub generation: u64,
}

impl LoadedImage {
    pub fn width(&self) -> u32 {
        self.rgb.width()
    }

    pub fn height(&self) -> u32 {
        self.rgb.height()
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

#[derive(Default)]
pub struct ImageStore {
    current: Option<LoadedImage>,
    next_generation: u64,
}

impl ImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&LoadedImage> {
        self.current.as_ref()
    }

    /// Generation of the current image; 0 when nothing is loaded.
    pub fn generation(&self) -> u64 {
        self.current.as_ref().map_or(0, |img| img.generation)
    }

    /// Install an already decoded image, replacing the previous one wholesale.
    pub fn replace(&mut self, rgb: RgbImage, path: PathBuf) -> &LoadedImage {
        self.next_generation += 1;
        self.current.insert(LoadedImage {
            rgb: Arc::new(rgb),
            path,
            generation: self.next_generation,
        })
    }
}

/// Decode any supported raster file into 8-bit RGB (alpha dropped).
pub fn decode_rgb(path: &Path) -> Result<RgbImage, SegmentError> {
    let img = image::open(path)
        .map_err(|e| SegmentError::ImageLoad(format!("{}: {}", path.display(), e)))?
        .to_rgb8();
    if img.width() == 0 || img.height() == 0 {
        return Err(SegmentError::ImageLoad(format!(
            "{}: image has no pixels",
            path.display()
        )));
    }
    Ok(img)
}

/// Show the native "Select an Image" dialog. `None` when cancelled.
pub fn pick_image_path(start_dir: &str) -> Option<PathBuf> {
    let mut dialog = FileDialog::new()
        .set_title("Select an Image")
        .add_filter("Images", IMAGE_EXTENSIONS);
    if !start_dir.is_empty() && Path::new(start_dir).is_dir() {
        dialog = dialog.set_directory(start_dir);
    }
    dialog.pick_file()
}
