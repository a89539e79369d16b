// Audio module
// Capture, framing, windowing and feature extraction for the live detection path

pub mod capture;
pub mod features;
pub mod frame;
pub mod ingest;
pub mod queue;
pub mod resample;
pub mod window;

pub use capture::{
    AudioSource, CaptureError, CaptureEvent, CaptureEventHandler, DeviceConfig, FrameSource,
    SourceState, SyntheticSource,
};
pub use features::{FeatureConfig, FeatureExtractor, FeatureVector, FEATURE_DIM, MODEL_SAMPLE_RATE};
pub use frame::{Frame, Window};
pub use ingest::{decode_wav, encode_wav, AudioData, AudioError};
pub use queue::{FrameQueue, PushOutcome};
pub use window::{FrameAggregator, WindowConfig};
