pub mod camera;
pub mod metadata;
pub mod sink;

pub use camera::{Camera, DirectoryCamera, SyntheticCamera};
pub use sink::{CaptureReport, CaptureSink};
