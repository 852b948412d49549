use thiserror::Error;
use tokio::sync::mpsc;

/// Audio sample data (16-bit PCM, interleaved)
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Raw audio samples (i16 PCM, interleaved)
    pub samples: Vec<i16>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
    /// Monotonic sequence number within the current turn, assigned by capture
    pub sequence: u64,
}

impl AudioFrame {
    /// Mean absolute amplitude mapped onto a 0-255 scale
    pub fn level(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }

        let sum: u64 = self
            .samples
            .iter()
            .map(|&s| (s as i32).unsigned_abs() as u64)
            .sum();
        let mean = sum as f32 / self.samples.len() as f32;

        (mean / 32768.0 * 255.0).min(255.0)
    }
}

/// Configuration for audio backend
#[derive(Debug, Clone)]
pub struct AudioBackendConfig {
    /// Sample rate of emitted frames
    pub sample_rate: u32,
    /// Channel count (1 = mono, 2 = stereo)
    pub channels: u16,
    /// Frame duration in milliseconds (sets the sampling cadence)
    pub buffer_duration_ms: u64,
}

impl AudioBackendConfig {
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as u64 * self.buffer_duration_ms / 1000) as usize * self.channels as usize
    }
}

impl Default for AudioBackendConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,     // 16kHz for transcription
            channels: 1,            // Mono
            buffer_duration_ms: 16, // ~60Hz level sampling
        }
    }
}

impl From<&crate::config::AudioConfig> for AudioBackendConfig {
    fn from(cfg: &crate::config::AudioConfig) -> Self {
        Self {
            sample_rate: cfg.sample_rate,
            channels: cfg.channels,
            buffer_duration_ms: cfg.buffer_duration_ms,
        }
    }
}

/// Microphone acquisition failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("microphone permission denied")]
    PermissionDenied,

    #[error("microphone is already in use")]
    DeviceBusy,

    #[error("audio backend error: {0}")]
    Backend(String),
}

/// Audio capture backend trait
///
/// Implementations:
/// - File: replays WAV utterances as if spoken live (CLI and batch runs)
/// - Tests provide scripted backends
#[async_trait::async_trait]
pub trait AudioBackend: Send + Sync {
    /// Start capturing audio
    ///
    /// Returns a channel receiver that will receive audio frames
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>, CaptureError>;

    /// Stop capturing audio
    async fn stop(&mut self) -> Result<(), CaptureError>;

    /// Check if backend is currently capturing
    fn is_capturing(&self) -> bool;

    /// Get backend name for logging
    fn name(&self) -> &str;
}
