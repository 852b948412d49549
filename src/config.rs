use anyhow::{ensure, Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub pipeline: PipelineConfig,
    pub provider: ProviderConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "speak-practice".to_string(),
            http: HttpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Frame cadence in milliseconds (16ms is roughly 60Hz)
    pub buffer_duration_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            buffer_duration_ms: 16,
        }
    }
}

/// Voice activity detection thresholds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Mean frame amplitude (0-255 scale) above which a frame counts as speech
    pub volume_threshold: f32,
    /// Silence after speech required to close an utterance
    pub silence_threshold_ms: u64,
    /// Number of recent levels kept for metering
    pub level_window: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            volume_threshold: 15.0,
            silence_threshold_ms: 1200,
            level_window: 8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Prior messages handed to the dialogue generator
    pub history_limit: usize,
    /// Transcript used when transcription fails
    pub placeholder_transcript: String,
    /// Reply persisted when generation fails
    pub fallback_reply: String,
    pub voice: String,
    /// Extra attempts per stage after the first failure
    pub stage_retries: u32,
    /// Format hint passed to the transcriber
    pub audio_format: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            history_limit: 10,
            placeholder_transcript: "unintelligible".to_string(),
            fallback_reply: "Sorry, I didn't catch that. Could you say it again?".to_string(),
            voice: "alloy".to_string(),
            stage_retries: 0,
            audio_format: "wav".to_string(),
        }
    }
}

/// OpenAI-compatible provider endpoints
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub api_base: String,
    /// Name of the environment variable holding the API key
    pub api_key_env: String,
    pub transcription_model: String,
    pub chat_model: String,
    pub speech_model: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            transcription_model: "whisper-1".to_string(),
            chat_model: "gpt-4o-mini".to_string(),
            speech_model: "tts-1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Reply shown locally when a turn cannot reach the server
    pub fallback_reply: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            fallback_reply: "Sorry, something went wrong. Let's keep going.".to_string(),
        }
    }
}

impl Config {
    /// Load from a config file (any format the `config` crate knows) with
    /// `SPEAK__SECTION__KEY` environment overrides.
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("SPEAK").separator("__"))
            .build()?;

        let cfg: Self = settings
            .try_deserialize()
            .with_context(|| format!("Failed to parse configuration from {}", path))?;
        cfg.validate()
            .with_context(|| format!("Invalid configuration in {}", path))?;

        Ok(cfg)
    }

    /// Reject values the audio loop cannot run with
    pub fn validate(&self) -> Result<()> {
        ensure!(self.audio.sample_rate > 0, "audio.sample_rate must be positive");
        ensure!(self.audio.channels > 0, "audio.channels must be positive");
        ensure!(
            self.audio.buffer_duration_ms > 0,
            "audio.buffer_duration_ms must be positive"
        );
        ensure!(self.vad.level_window > 0, "vad.level_window must be positive");
        ensure!(
            self.vad.silence_threshold_ms > 0,
            "vad.silence_threshold_ms must be positive"
        );
        ensure!(
            !self.pipeline.audio_format.is_empty(),
            "pipeline.audio_format must not be empty"
        );
        Ok(())
    }
}
