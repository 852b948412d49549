use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role-play setup the dialogue is generated against
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioContext {
    pub title: String,
    /// Who the AI plays (e.g. "barista")
    pub ai_role: String,
    /// Who the learner plays (e.g. "customer")
    pub user_role: String,
    pub description: String,
    /// Language being practiced
    pub language: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackCategory {
    Grammar,
    Spelling,
    Word,
    Style,
}

/// Correction attached to a user message
///
/// `word_index` points into the whitespace-split transcript (first token is 0).
/// Style feedback applies to the whole sentence and has no index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackItem {
    pub word_index: Option<usize>,
    pub category: FeedbackCategory,
    pub suggestion: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

/// Persisted record of one side of a resolved turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<Vec<FeedbackItem>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSession {
    pub id: String,
    pub scenario: ScenarioContext,
    pub messages: Vec<Message>,
    pub ended: bool,
    pub created_at: DateTime<Utc>,
}

/// Whitespace tokens of a transcript, the index space of word feedback
pub fn split_words(text: &str) -> Vec<&str> {
    text.split_whitespace().collect()
}
