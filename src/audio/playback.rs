use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::devices::{AudioDevices, DeviceKind};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("failed to decode reply audio: {0}")]
    Decode(String),

    #[error("audio output is already in use")]
    OutputBusy,

    #[error("audio output error: {0}")]
    Output(String),
}

/// Audio output device
#[async_trait::async_trait]
pub trait AudioOutput: Send + Sync {
    /// Play the payload, returning once it finished
    async fn play(&self, payload: &[u8]) -> Result<(), PlaybackError>;

    fn name(&self) -> &str;
}

/// How a playback request resolved. Every variant counts as completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Played,
    Skipped,
    Failed(PlaybackError),
}

/// Plays each synthesized reply once and always reports completion
pub struct Playback {
    output: Arc<dyn AudioOutput>,
    devices: Arc<AudioDevices>,
}

impl Playback {
    pub fn new(output: Arc<dyn AudioOutput>, devices: Arc<AudioDevices>) -> Self {
        Self { output, devices }
    }

    pub fn is_active(&self) -> bool {
        self.devices.playback_active()
    }

    pub async fn play_once(&self, payload: Option<&[u8]>) -> PlaybackOutcome {
        let Some(payload) = payload.filter(|p| !p.is_empty()) else {
            debug!("No reply audio, skipping playback");
            return PlaybackOutcome::Skipped;
        };

        let Some(_output) = self.devices.try_acquire(DeviceKind::Output) else {
            warn!("Audio output busy, treating playback as complete");
            return PlaybackOutcome::Failed(PlaybackError::OutputBusy);
        };

        info!(
            "Playback started on {} ({} bytes)",
            self.output.name(),
            payload.len()
        );

        match self.output.play(payload).await {
            Ok(()) => {
                info!("Playback finished");
                PlaybackOutcome::Played
            }
            Err(e) => {
                warn!("Playback failed, treating as complete: {}", e);
                PlaybackOutcome::Failed(e)
            }
        }
    }
}

/// Decodes the payload and holds the output for its duration
///
/// Used where no speaker is attached (CLI runs, servers). A payload that
/// cannot be decoded fails the same way a real device would.
#[derive(Debug, Default)]
pub struct DecodingOutput;

impl DecodingOutput {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl AudioOutput for DecodingOutput {
    async fn play(&self, payload: &[u8]) -> Result<(), PlaybackError> {
        let bytes = payload.to_vec();
        let duration = tokio::task::spawn_blocking(move || decoded_duration(bytes))
            .await
            .map_err(|e| PlaybackError::Output(e.to_string()))??;

        debug!("Decoded reply audio: {:.2}s", duration.as_secs_f64());
        tokio::time::sleep(duration).await;

        Ok(())
    }

    fn name(&self) -> &str {
        "decoder"
    }
}

/// Decode every packet of the payload and return its playing time
pub fn decoded_duration(bytes: Vec<u8>) -> Result<Duration, PlaybackError> {
    let decode_err = |e: SymphoniaError| PlaybackError::Decode(e.to_string());

    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());
    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(decode_err)?;

    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| PlaybackError::Decode("no audio track".to_string()))?;
    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| PlaybackError::Decode("unknown sample rate".to_string()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(decode_err)?;

    let mut frames: u64 = 0;
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(e) => return Err(decode_err(e)),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = decoder.decode(&packet).map_err(decode_err)?;
        frames += decoded.frames() as u64;
    }

    Ok(Duration::from_millis(frames * 1000 / sample_rate as u64))
}
