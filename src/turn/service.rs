use anyhow::{Context, Result};
use std::sync::Arc;

use crate::audio::CapturedAudio;
use crate::pipeline::{DialoguePipeline, PipelineError, TurnAudio, TurnResponse};

/// Where the turn machine sends finalized captures
///
/// A session the server no longer accepts turns for is reported as a
/// [`PipelineError::SessionNotFound`] or [`PipelineError::SessionEnded`]
/// inside the returned error, so callers can tell it from a transient failure
/// with [`session_closed`].
#[async_trait::async_trait]
pub trait TurnService: Send + Sync {
    async fn submit_turn(&self, session_id: &str, audio: CapturedAudio) -> Result<TurnResponse>;
}

/// Runs the dialogue pipeline in-process
pub struct LocalTurnService {
    pipeline: Arc<DialoguePipeline>,
}

impl LocalTurnService {
    pub fn new(pipeline: Arc<DialoguePipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait::async_trait]
impl TurnService for LocalTurnService {
    async fn submit_turn(&self, session_id: &str, audio: CapturedAudio) -> Result<TurnResponse> {
        let bytes = audio.to_wav().context("Failed to encode turn audio")?;

        let response = self
            .pipeline
            .run_turn(
                session_id,
                TurnAudio {
                    bytes,
                    format: CapturedAudio::FORMAT.to_string(),
                },
            )
            .await?;

        Ok(response)
    }
}

/// Whether a turn failed because its session can no longer take turns
pub fn session_closed(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<PipelineError>(),
        Some(PipelineError::SessionNotFound(_) | PipelineError::SessionEnded(_))
    )
}
