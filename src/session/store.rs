use chrono::Utc;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use super::types::{ConversationSession, FeedbackItem, Message, Role, ScenarioContext};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("message {0} not found")]
    MessageNotFound(String),

    #[error("feedback already attached to message {0}")]
    FeedbackAlreadyAttached(String),

    #[error("session {0} has ended")]
    SessionEnded(String),
}

/// Conversation persistence
///
/// Messages are append-only. Feedback can be attached once per message and
/// content never changes after creation. Ending a session is terminal.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, scenario: ScenarioContext) -> ConversationSession;

    async fn session(&self, session_id: &str) -> Result<ConversationSession, StoreError>;

    /// The last `limit` messages in arrival order
    async fn recent_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    async fn create_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
    ) -> Result<Message, StoreError>;

    async fn attach_feedback(
        &self,
        message_id: &str,
        feedback: Vec<FeedbackItem>,
    ) -> Result<Message, StoreError>;

    /// Persist one resolved turn in a single step: the user message with its
    /// feedback, the reply, and the end flag when the conversation finished.
    /// Either everything is written or nothing is.
    async fn append_exchange(
        &self,
        session_id: &str,
        exchange: NewExchange,
    ) -> Result<(Message, Message), StoreError>;

    async fn end_session(&self, session_id: &str) -> Result<(), StoreError>;
}

/// Both sides of a turn, ready to persist
#[derive(Debug, Clone)]
pub struct NewExchange {
    pub user_text: String,
    pub feedback: Vec<FeedbackItem>,
    pub reply_text: String,
    pub finished: bool,
}

fn new_message(session_id: &str, role: Role, content: &str) -> Message {
    Message {
        id: uuid::Uuid::new_v4().to_string(),
        session_id: session_id.to_string(),
        role,
        content: content.to_string(),
        feedback: None,
        created_at: Utc::now(),
    }
}

#[derive(Default)]
struct StoreInner {
    sessions: HashMap<String, ConversationSession>,
    /// message id → session id
    message_index: HashMap<String, String>,
}

/// Process-local store, one `RwLock` around all sessions
#[derive(Default)]
pub struct InMemorySessionStore {
    inner: RwLock<StoreInner>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create_session(&self, scenario: ScenarioContext) -> ConversationSession {
        let session = ConversationSession {
            id: format!("session-{}", uuid::Uuid::new_v4()),
            scenario,
            messages: Vec::new(),
            ended: false,
            created_at: Utc::now(),
        };

        info!("Created session {} ({})", session.id, session.scenario.title);

        let mut inner = self.inner.write().await;
        inner.sessions.insert(session.id.clone(), session.clone());
        session
    }

    async fn session(&self, session_id: &str) -> Result<ConversationSession, StoreError> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))
    }

    async fn recent_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.read().await;
        let session = inner
            .sessions
            .get(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;

        let skip = session.messages.len().saturating_sub(limit);
        Ok(session.messages[skip..].to_vec())
    }

    async fn create_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
    ) -> Result<Message, StoreError> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;

        if session.ended {
            return Err(StoreError::SessionEnded(session_id.to_string()));
        }

        let message = new_message(session_id, role, content);
        session.messages.push(message.clone());

        inner
            .message_index
            .insert(message.id.clone(), session_id.to_string());

        Ok(message)
    }

    async fn attach_feedback(
        &self,
        message_id: &str,
        feedback: Vec<FeedbackItem>,
    ) -> Result<Message, StoreError> {
        let mut inner = self.inner.write().await;
        let session_id = inner
            .message_index
            .get(message_id)
            .cloned()
            .ok_or_else(|| StoreError::MessageNotFound(message_id.to_string()))?;

        let message = inner
            .sessions
            .get_mut(&session_id)
            .and_then(|s| s.messages.iter_mut().find(|m| m.id == message_id))
            .ok_or_else(|| StoreError::MessageNotFound(message_id.to_string()))?;

        if message.feedback.is_some() {
            return Err(StoreError::FeedbackAlreadyAttached(message_id.to_string()));
        }

        message.feedback = Some(feedback);
        Ok(message.clone())
    }

    async fn append_exchange(
        &self,
        session_id: &str,
        exchange: NewExchange,
    ) -> Result<(Message, Message), StoreError> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;

        if session.ended {
            return Err(StoreError::SessionEnded(session_id.to_string()));
        }

        let mut user = new_message(session_id, Role::User, &exchange.user_text);
        if !exchange.feedback.is_empty() {
            user.feedback = Some(exchange.feedback);
        }
        let reply = new_message(session_id, Role::Assistant, &exchange.reply_text);

        session.messages.push(user.clone());
        session.messages.push(reply.clone());
        if exchange.finished {
            session.ended = true;
            info!("Session {} finished by the dialogue", session_id);
        }

        for id in [&user.id, &reply.id] {
            inner.message_index.insert(id.clone(), session_id.to_string());
        }

        Ok((user, reply))
    }

    async fn end_session(&self, session_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;

        if !session.ended {
            session.ended = true;
            info!("Session {} ended", session_id);
        }

        Ok(())
    }
}
