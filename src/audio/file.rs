use anyhow::{Context, Result};
use hound::WavReader;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::backend::{AudioBackend, AudioBackendConfig, AudioFrame, CaptureError};

pub struct AudioFile {
    pub path: String,
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<i16>,
}

impl AudioFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening audio file: {}", path.display());

        let reader = WavReader::open(path).context("Failed to open WAV file")?;

        let spec = reader.spec();
        let samples: Vec<i16> = reader
            .into_samples::<i16>()
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read audio samples")?;

        let duration_seconds =
            samples.len() as f64 / (spec.sample_rate as f64 * spec.channels as f64);

        info!(
            "Audio file loaded: {:.1}s, {}Hz, {} channels, {} samples",
            duration_seconds,
            spec.sample_rate,
            spec.channels,
            samples.len()
        );

        Ok(Self {
            path: path.display().to_string(),
            duration_seconds,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            samples,
        })
    }
}

/// Replays WAV utterances as a live microphone
///
/// Every `start()` plays the next queued file at real-time cadence and then
/// keeps emitting silent frames until stopped, like an open mic in a quiet room.
/// Once the queue is exhausted only silence is produced.
pub struct FileBackend {
    config: AudioBackendConfig,
    utterances: VecDeque<PathBuf>,
    task: Option<JoinHandle<()>>,
}

impl FileBackend {
    pub fn new(config: AudioBackendConfig, utterances: Vec<PathBuf>) -> Self {
        Self {
            config,
            utterances: utterances.into(),
            task: None,
        }
    }

    pub fn remaining(&self) -> usize {
        self.utterances.len()
    }
}

#[async_trait::async_trait]
impl AudioBackend for FileBackend {
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>, CaptureError> {
        if self.task.is_some() {
            return Err(CaptureError::DeviceBusy);
        }

        let samples = match self.utterances.pop_front() {
            Some(path) => {
                let audio =
                    AudioFile::open(&path).map_err(|e| CaptureError::Backend(format!("{:#}", e)))?;
                if audio.sample_rate != self.config.sample_rate
                    || audio.channels != self.config.channels
                {
                    return Err(CaptureError::Backend(format!(
                        "{} is {}Hz/{}ch, expected {}Hz/{}ch",
                        audio.path,
                        audio.sample_rate,
                        audio.channels,
                        self.config.sample_rate,
                        self.config.channels
                    )));
                }
                audio.samples
            }
            None => Vec::new(),
        };

        let (tx, rx) = mpsc::channel(64);
        let config = self.config.clone();

        self.task = Some(tokio::spawn(async move {
            let frame_len = config.samples_per_frame().max(1);
            let mut ticker =
                tokio::time::interval(Duration::from_millis(config.buffer_duration_ms.max(1)));
            let mut chunks = samples.chunks(frame_len);

            loop {
                ticker.tick().await;

                let samples = match chunks.next() {
                    Some(chunk) => chunk.to_vec(),
                    None => vec![0i16; frame_len],
                };

                let frame = AudioFrame {
                    samples,
                    sample_rate: config.sample_rate,
                    channels: config.channels,
                    sequence: 0,
                };

                if tx.send(frame).await.is_err() {
                    debug!("File backend receiver closed");
                    break;
                }
            }
        }));

        Ok(rx)
    }

    async fn stop(&mut self) -> Result<(), CaptureError> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.task.is_some()
    }

    fn name(&self) -> &str {
        "file"
    }
}

impl Drop for FileBackend {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
