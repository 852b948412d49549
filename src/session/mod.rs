//! Conversation sessions
//!
//! This module provides the persisted side of a practice conversation:
//! - Scenario context and message records
//! - Word-level feedback attached to user messages
//! - The `SessionStore` persistence seam and an in-memory store
//! - Conversation statistics reported by the turn machine

mod stats;
mod store;
mod types;

pub use stats::{ConversationStats, EndReason};
pub use store::{InMemorySessionStore, NewExchange, SessionStore, StoreError};
pub use types::{
    split_words, ConversationSession, FeedbackCategory, FeedbackItem, Message, Role,
    ScenarioContext,
};
