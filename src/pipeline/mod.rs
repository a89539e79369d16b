// Pipeline execution module
// Runs the live detection loop and exposes the detector facade

pub mod detector;
pub mod processor;

pub use detector::{Detector, DetectorError, DetectorResult};
pub use processor::FrameProcessor;
