use anyhow::{anyhow, Context, Result};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::prompt;
use crate::config::ProviderConfig;
use crate::pipeline::{DialogueContext, DialogueGenerator, Generation, SpeechSynthesizer, Transcriber};

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

/// Transcription, dialogue and speech against an OpenAI-compatible API
#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    config: ProviderConfig,
}

impl OpenAiClient {
    pub fn new(config: ProviderConfig, api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            config,
        }
    }

    /// Read the API key from the environment variable named in the config
    pub fn from_env(config: ProviderConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .with_context(|| format!("{} is not set", config.api_key_env))?;
        Ok(Self::new(config, api_key))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_base.trim_end_matches('/'), path)
    }
}

#[async_trait::async_trait]
impl Transcriber for OpenAiClient {
    async fn transcribe(&self, audio: &[u8], format: &str) -> Result<String> {
        let part = Part::bytes(audio.to_vec())
            .file_name(format!("turn.{}", format))
            .mime_str(&format!("audio/{}", format))?;
        let form = Form::new()
            .text("model", self.config.transcription_model.clone())
            .part("file", part);

        let resp = self
            .client
            .post(self.url("audio/transcriptions"))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?
            .error_for_status()
            .context("Transcription request failed")?
            .json::<TranscriptionResponse>()
            .await?;

        debug!("Transcribed {} bytes: {}", audio.len(), resp.text);
        Ok(resp.text)
    }
}

#[async_trait::async_trait]
impl DialogueGenerator for OpenAiClient {
    async fn generate(&self, context: &DialogueContext) -> Result<Generation> {
        let body = json!({
            "model": self.config.chat_model,
            "messages": prompt::chat_messages(context),
            "response_format": { "type": "json_object" },
        });

        let resp = self
            .client
            .post(self.url("chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()
            .context("Chat completion request failed")?
            .json::<ChatResponse>()
            .await?;

        let content = &resp
            .choices
            .first()
            .ok_or_else(|| anyhow!("No response from LLM"))?
            .message
            .content;

        prompt::parse_generation(content).context("Malformed dialogue response")
    }
}

#[async_trait::async_trait]
impl SpeechSynthesizer for OpenAiClient {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>> {
        let body = json!({
            "model": self.config.speech_model,
            "input": text,
            "voice": voice,
            "response_format": "wav",
        });

        let bytes = self
            .client
            .post(self.url("audio/speech"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()
            .context("Speech request failed")?
            .bytes()
            .await?;

        Ok(bytes.to_vec())
    }
}
