//! SegmentFE: load an image, drag a box around an object, and let a
//! Segment-Anything model cut it out.
//!
//! The library holds everything except `main`, so the selection and
//! analysis flow can be exercised by integration tests with a stand-in
//! model.

pub mod logger;

pub mod app;
pub mod canvas;
pub mod error;
pub mod image_store;
pub mod mask;
pub mod region;
pub mod segmentation;
pub mod settings;
pub mod viewport;
pub mod workspace;

pub use error::SegmentError;
