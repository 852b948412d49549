use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::session::{FeedbackItem, Message, ScenarioContext};

/// Captured audio for one turn as it arrives at the server
#[derive(Debug, Clone)]
pub struct TurnAudio {
    pub bytes: Vec<u8>,
    /// Container hint for the transcriber (e.g. "wav")
    pub format: String,
}

/// Everything the dialogue generator sees for one turn
#[derive(Debug, Clone)]
pub struct DialogueContext {
    pub scenario: ScenarioContext,
    /// Prior messages, oldest first
    pub history: Vec<Message>,
    pub user_text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub reply_text: String,
    pub feedback: Vec<FeedbackItem>,
    pub is_finished: bool,
}

/// Result of one turn, as returned to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnResponse {
    pub user_message: Message,
    pub ai_message: Message,
    #[serde(
        default,
        with = "base64_payload",
        skip_serializing_if = "Option::is_none"
    )]
    pub audio_payload: Option<Vec<u8>>,
    pub ended: bool,
}

#[async_trait::async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &[u8], format: &str) -> Result<String>;
}

#[async_trait::async_trait]
pub trait DialogueGenerator: Send + Sync {
    async fn generate(&self, context: &DialogueContext) -> Result<Generation>;
}

#[async_trait::async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>>;
}

/// Optional audio bytes as a base64 string in JSON
pub mod base64_payload {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => {
                s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
            }
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        encoded
            .map(|s| {
                base64::engine::general_purpose::STANDARD
                    .decode(s)
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
    }
}
