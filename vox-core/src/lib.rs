//! Voice-command edge pipeline core.
//! Host-driven: no I/O; host passes events (fragments, ticks, inference outcomes) and receives actions.

pub mod aggregator;
pub mod backoff;
pub mod bridge;
pub mod controller;
pub mod features;
pub mod fragment;
pub mod hardware;
pub mod labels;
pub mod mqtt;
pub mod record;

pub use aggregator::{Aggregator, Closure, SessionState, DEFAULT_SESSION_TIMEOUT};
pub use backoff::Backoff;
pub use bridge::{InferenceBridge, InferenceError};
pub use controller::{Action, InferenceJob, SessionController};
pub use features::{FeatureExtractor, LogMelSpectrogram, INPUT_SIZE, TARGET_LEN};
pub use fragment::{Fragment, FragmentError};
pub use hardware::{Accelerator, BufferPool, DeviceError, DmaBuffer, HardwareTransaction, OUTPUT_SIZE};
pub use labels::{Command, Label};
pub use record::{ClassificationResult, FailureReason};
