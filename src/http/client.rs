use anyhow::{Context, Result};
use base64::Engine;
use reqwest::{Client, StatusCode};
use tracing::info;

use super::handlers::{CreateSessionRequest, ErrorResponse, TurnRequest};
use crate::audio::CapturedAudio;
use crate::pipeline::{PipelineError, TurnResponse};
use crate::session::{ConversationSession, ScenarioContext};
use crate::turn::TurnService;

/// Client for a remote dialogue server
#[derive(Clone)]
pub struct HttpTurnClient {
    client: Client,
    base_url: String,
}

impl HttpTurnClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn create_session(&self, scenario: ScenarioContext) -> Result<ConversationSession> {
        let resp = self
            .client
            .post(format!("{}/sessions", self.base_url))
            .json(&CreateSessionRequest { scenario })
            .send()
            .await
            .context("Failed to reach dialogue server")?;

        let session: ConversationSession = Self::parse(resp).await?;
        info!("Created session {}", session.id);
        Ok(session)
    }

    pub async fn session(&self, session_id: &str) -> Result<ConversationSession> {
        let resp = self
            .client
            .get(format!("{}/sessions/{}", self.base_url, session_id))
            .send()
            .await
            .context("Failed to reach dialogue server")?;

        Self::parse(resp).await
    }

    /// Ask the server to end a session; later turns are rejected
    pub async fn end_session(&self, session_id: &str) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/sessions/{}/end", self.base_url, session_id))
            .send()
            .await
            .context("Failed to reach dialogue server")?;

        if let Some(rejected) = Self::session_rejection(session_id, resp.status()) {
            return Err(rejected.into());
        }
        if !resp.status().is_success() {
            anyhow::bail!("Server returned {} ending {}", resp.status(), session_id);
        }

        info!("Ended session {}", session_id);
        Ok(())
    }

    /// Statuses meaning the session itself refuses turns
    fn session_rejection(session_id: &str, status: StatusCode) -> Option<PipelineError> {
        match status {
            StatusCode::NOT_FOUND => Some(PipelineError::SessionNotFound(session_id.to_string())),
            StatusCode::CONFLICT => Some(PipelineError::SessionEnded(session_id.to_string())),
            _ => None,
        }
    }

    async fn parse<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        if status.is_success() {
            return resp.json::<T>().await.context("Malformed server response");
        }

        let message = resp
            .json::<ErrorResponse>()
            .await
            .map(|e| e.error)
            .unwrap_or_else(|_| status.to_string());
        anyhow::bail!("Server returned {}: {}", status, message)
    }
}

#[async_trait::async_trait]
impl TurnService for HttpTurnClient {
    async fn submit_turn(&self, session_id: &str, audio: CapturedAudio) -> Result<TurnResponse> {
        let wav = audio.to_wav().context("Failed to encode turn audio")?;
        let request = TurnRequest {
            audio: base64::engine::general_purpose::STANDARD.encode(wav),
            format: Some(CapturedAudio::FORMAT.to_string()),
        };

        let resp = self
            .client
            .post(format!("{}/sessions/{}/turns", self.base_url, session_id))
            .json(&request)
            .send()
            .await
            .context("Failed to reach dialogue server")?;

        if let Some(rejected) = Self::session_rejection(session_id, resp.status()) {
            return Err(rejected.into());
        }

        Self::parse(resp).await
    }
}
