use anyhow::{Context, Result};
use std::io::Cursor;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::backend::{AudioBackend, AudioFrame, CaptureError};
use super::devices::{AudioDevices, DeviceGuard, DeviceKind};

/// Finalized audio for one turn
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedAudio {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Number of frames concatenated into this payload
    pub frame_count: u64,
}

impl CapturedAudio {
    /// Container produced by [`CapturedAudio::to_wav`], sent as the format hint
    pub const FORMAT: &'static str = "wav";

    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1000 / (self.sample_rate as u64 * self.channels as u64)
    }

    /// Encode as a 16-bit PCM WAV file
    pub fn to_wav(&self) -> Result<Vec<u8>> {
        let spec = hound::WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer =
                hound::WavWriter::new(&mut cursor, spec).context("Failed to create WAV writer")?;
            for &sample in &self.samples {
                writer
                    .write_sample(sample)
                    .context("Failed to write sample to WAV")?;
            }
            writer.finalize().context("Failed to finalize WAV")?;
        }

        Ok(cursor.into_inner())
    }
}

/// Sequence number and mean amplitude of a buffered frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameLevel {
    pub sequence: u64,
    pub level: f32,
}

struct ActiveCapture {
    frames: mpsc::Receiver<AudioFrame>,
    buffered: Vec<AudioFrame>,
    next_sequence: u64,
    _microphone: DeviceGuard,
}

/// Exclusive owner of the microphone for the duration of a turn
///
/// Frames pulled through [`AudioCapture::next_frame`] are numbered and buffered
/// until [`AudioCapture::stop`] either finalizes or discards them.
pub struct AudioCapture {
    backend: Box<dyn AudioBackend>,
    devices: Arc<AudioDevices>,
    active: Option<ActiveCapture>,
}

impl AudioCapture {
    pub fn new(backend: Box<dyn AudioBackend>, devices: Arc<AudioDevices>) -> Self {
        Self {
            backend,
            devices,
            active: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Acquire the microphone and start the backend
    pub async fn start(&mut self) -> Result<(), CaptureError> {
        if self.active.is_some() {
            return Err(CaptureError::DeviceBusy);
        }

        let microphone = self
            .devices
            .try_acquire(DeviceKind::Microphone)
            .ok_or(CaptureError::DeviceBusy)?;

        // On failure the guard drops here and the handle is released
        let frames = self.backend.start().await?;

        info!("Capture started ({})", self.backend.name());

        self.active = Some(ActiveCapture {
            frames,
            buffered: Vec::new(),
            next_sequence: 0,
            _microphone: microphone,
        });

        Ok(())
    }

    /// Receive, number and buffer the next frame of the active capture.
    ///
    /// Returns `None` when nothing is being captured or the backend stream closed.
    pub async fn next_frame(&mut self) -> Option<FrameLevel> {
        let active = self.active.as_mut()?;
        let mut frame = active.frames.recv().await?;

        frame.sequence = active.next_sequence;
        active.next_sequence += 1;

        let level = FrameLevel {
            sequence: frame.sequence,
            level: frame.level(),
        };
        active.buffered.push(frame);

        Some(level)
    }

    /// Release the microphone.
    ///
    /// With `flush` the buffered frames are concatenated into one payload,
    /// otherwise they are discarded. Stopping an idle capture is a no-op.
    pub async fn stop(&mut self, flush: bool) -> Option<CapturedAudio> {
        let active = self.active.take()?;

        if let Err(e) = self.backend.stop().await {
            warn!("Failed to stop audio backend {}: {}", self.backend.name(), e);
        }

        let ActiveCapture {
            frames, buffered, ..
        } = active;
        drop(frames);

        info!(
            "Capture stopped ({} frames, flush={})",
            buffered.len(),
            flush
        );

        if !flush {
            return None;
        }

        let (sample_rate, channels) = buffered
            .first()
            .map(|f| (f.sample_rate, f.channels))
            .unwrap_or((16000, 1));

        let samples: Vec<i16> = buffered
            .iter()
            .flat_map(|f| f.samples.iter().copied())
            .collect();

        Some(CapturedAudio {
            samples,
            sample_rate,
            channels,
            frame_count: buffered.len() as u64,
        })
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            debug!(
                "Capture dropped while active, discarding {} frames",
                active.buffered.len()
            );
        }
    }
}
