pub mod backend;
pub mod capture;
pub mod devices;
pub mod file;
pub mod playback;

pub use backend::{AudioBackend, AudioBackendConfig, AudioFrame, CaptureError};
pub use capture::{AudioCapture, CapturedAudio, FrameLevel};
pub use devices::{AudioDevices, DeviceGuard, DeviceKind};
pub use file::{AudioFile, FileBackend};
pub use playback::{AudioOutput, DecodingOutput, Playback, PlaybackError, PlaybackOutcome};
