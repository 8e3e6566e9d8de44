//! Error taxonomy shared by the selector, the segmentation boundary and the shell.

use std::fmt;

/// Everything that can go wrong between "upload" and "mask displayed".
///
/// Only `ModelUnavailable` disables a feature; every other variant is
/// reported in the status bar and leaves the session usable.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentError {
    /// Runtime library or weights missing / incompatible.
    ModelUnavailable(String),
    /// An action needs an image and none has been uploaded.
    NoImageLoaded,
    /// Analyze requested without a finalized rectangle.
    NoRegionSelected,
    /// Zero-area or out-of-bounds box, rejected before reaching the model.
    InvalidRegion(String),
    /// The picked file could not be decoded.
    ImageLoad(String),
    /// The model failed while running (fatal to the operation only).
    Inference(String),
}

impl SegmentError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SegmentError::ModelUnavailable(_))
    }
}

impl fmt::Display for SegmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentError::ModelUnavailable(e) => write!(f, "Segmentation model unavailable: {}", e),
            SegmentError::NoImageLoaded => write!(f, "No image loaded. Upload an image first."),
            SegmentError::NoRegionSelected => {
                write!(f, "No region selected. Drag a rectangle over the object first.")
            }
            SegmentError::InvalidRegion(e) => write!(f, "Invalid region: {}", e),
            SegmentError::ImageLoad(e) => write!(f, "Failed to load image: {}", e),
            SegmentError::Inference(e) => write!(f, "Segmentation failed: {}", e),
        }
    }
}

impl std::error::Error for SegmentError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_model_unavailable_is_fatal() {
        assert!(!SegmentError::ModelUnavailable("x".into()).is_recoverable());
        assert!(SegmentError::NoImageLoaded.is_recoverable());
        assert!(SegmentError::NoRegionSelected.is_recoverable());
        assert!(SegmentError::InvalidRegion("zero area".into()).is_recoverable());
        assert!(SegmentError::Inference("oom".into()).is_recoverable());
    }

    #[test]
    fn display_includes_detail() {
        let msg = SegmentError::InvalidRegion("box has zero area".into()).to_string();
        assert!(msg.contains("zero area"), "got {}", msg);
    }
}
