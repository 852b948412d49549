use anyhow::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::types::{
    DialogueContext, DialogueGenerator, Generation, SpeechSynthesizer, Transcriber, TurnAudio,
    TurnResponse,
};
use crate::config::PipelineConfig;
use crate::session::{
    split_words, FeedbackCategory, FeedbackItem, NewExchange, SessionStore, StoreError,
};

/// Failures that escape a turn. Stage failures never do; they become fallbacks.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("session {0} has ended")]
    SessionEnded(String),

    #[error("storage error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::SessionNotFound(id) => PipelineError::SessionNotFound(id),
            StoreError::SessionEnded(id) => PipelineError::SessionEnded(id),
            other => PipelineError::Store(other),
        }
    }
}

/// Server-side turn orchestrator: Transcribe → Compose → Generate → Synthesize → Persist
///
/// Turns of the same session are serialized, so a turn always composes its
/// context from history that includes every earlier turn's messages.
pub struct DialoguePipeline {
    transcriber: Arc<dyn Transcriber>,
    generator: Arc<dyn DialogueGenerator>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    store: Arc<dyn SessionStore>,
    config: PipelineConfig,
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DialoguePipeline {
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        generator: Arc<dyn DialogueGenerator>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        store: Arc<dyn SessionStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            transcriber,
            generator,
            synthesizer,
            store,
            config,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run_turn(
        &self,
        session_id: &str,
        audio: TurnAudio,
    ) -> Result<TurnResponse, PipelineError> {
        let lock = self.session_lock(session_id).await;
        let _serialized = lock.lock().await;

        let session = match self.store.session(session_id).await {
            Ok(session) if !session.ended => session,
            Ok(_) => {
                self.session_locks.lock().await.remove(session_id);
                return Err(PipelineError::SessionEnded(session_id.to_string()));
            }
            Err(e) => {
                self.session_locks.lock().await.remove(session_id);
                return Err(e.into());
            }
        };

        info!(
            "Turn started for {} ({} bytes of {})",
            session_id,
            audio.bytes.len(),
            audio.format
        );

        let transcript = self.transcribe(&audio).await;

        let history = self
            .store
            .recent_messages(session_id, self.config.history_limit)
            .await?;
        let context = DialogueContext {
            scenario: session.scenario,
            history,
            user_text: transcript.clone(),
        };

        let generation = self.generate(&context).await;
        let audio_payload = self.synthesize(&generation.reply_text).await;

        let finished = generation.is_finished;
        let (user_message, ai_message) = self
            .store
            .append_exchange(
                session_id,
                NewExchange {
                    user_text: transcript,
                    feedback: generation.feedback,
                    reply_text: generation.reply_text,
                    finished,
                },
            )
            .await?;

        if finished {
            self.session_locks.lock().await.remove(session_id);
        }

        info!(
            "Turn persisted for {} (audio={}, ended={})",
            session_id,
            audio_payload.is_some(),
            finished
        );

        Ok(TurnResponse {
            user_message,
            ai_message,
            audio_payload,
            ended: finished,
        })
    }

    /// End a session once any turn in flight has been persisted
    pub async fn end_session(&self, session_id: &str) -> Result<(), PipelineError> {
        let lock = self.session_lock(session_id).await;
        let result = {
            let _serialized = lock.lock().await;
            self.store.end_session(session_id).await
        };

        self.session_locks.lock().await.remove(session_id);
        result.map_err(PipelineError::from)
    }

    /// Sessions that currently have a turn lock
    pub async fn tracked_sessions(&self) -> usize {
        self.session_locks.lock().await.len()
    }

    async fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().await;
        Arc::clone(locks.entry(session_id.to_string()).or_default())
    }

    async fn transcribe(&self, audio: &TurnAudio) -> String {
        let result = self
            .with_retries("transcribe", || {
                self.transcriber.transcribe(&audio.bytes, &audio.format)
            })
            .await;

        match result {
            Ok(text) if !text.trim().is_empty() => {
                debug!("Transcript: {}", text);
                text.trim().to_string()
            }
            Ok(_) => {
                warn!("Empty transcript, using placeholder");
                self.config.placeholder_transcript.clone()
            }
            Err(e) => {
                warn!("Transcription failed, using placeholder: {:#}", e);
                self.config.placeholder_transcript.clone()
            }
        }
    }

    async fn generate(&self, context: &DialogueContext) -> Generation {
        match self
            .with_retries("generate", || self.generator.generate(context))
            .await
        {
            Ok(generation) if !generation.reply_text.trim().is_empty() => Generation {
                feedback: normalize_feedback(&context.user_text, generation.feedback),
                ..generation
            },
            Ok(_) => {
                warn!("Generator returned an empty reply, using fallback");
                self.fallback_generation()
            }
            Err(e) => {
                warn!("Generation failed, using fallback reply: {:#}", e);
                self.fallback_generation()
            }
        }
    }

    fn fallback_generation(&self) -> Generation {
        Generation {
            reply_text: self.config.fallback_reply.clone(),
            feedback: Vec::new(),
            is_finished: false,
        }
    }

    async fn synthesize(&self, text: &str) -> Option<Vec<u8>> {
        match self
            .with_retries("synthesize", || {
                self.synthesizer.synthesize(text, &self.config.voice)
            })
            .await
        {
            Ok(bytes) if !bytes.is_empty() => Some(bytes),
            Ok(_) => {
                warn!("Synthesizer returned no audio, replying text-only");
                None
            }
            Err(e) => {
                warn!("Synthesis failed, replying text-only: {:#}", e);
                None
            }
        }
    }

    async fn with_retries<T, F, Fut>(&self, stage: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.config.stage_retries + 1;
        let mut attempt = 1;

        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts => {
                    warn!("{} attempt {}/{} failed: {:#}", stage, attempt, attempts, e);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Drop word feedback that points past the transcript and strip indexes from
/// style feedback, which always covers the whole sentence.
pub fn normalize_feedback(transcript: &str, items: Vec<FeedbackItem>) -> Vec<FeedbackItem> {
    let word_count = split_words(transcript).len();

    items
        .into_iter()
        .filter_map(|mut item| {
            if item.category == FeedbackCategory::Style {
                item.word_index = None;
                return Some(item);
            }

            match item.word_index {
                Some(index) if index >= word_count => {
                    warn!(
                        "Dropping {:?} feedback for word {} (transcript has {} words)",
                        item.category, index, word_count
                    );
                    None
                }
                _ => Some(item),
            }
        })
        .collect()
}
