use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a conversation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Explicit user termination
    UserEnded,
    /// The dialogue generator signalled the conversation is finished
    ConversationFinished,
    /// The microphone could not be acquired
    CaptureFailed,
    /// The server no longer accepts turns for the session
    SessionClosed,
    /// The controlling handle went away (navigation, unmount)
    HandleDropped,
}

/// Statistics about a conversation, reported when it ends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationStats {
    /// When the conversation started
    pub started_at: DateTime<Utc>,

    /// Total duration in seconds
    pub duration_secs: f64,

    /// Turns that produced a reply from the server
    pub turns_completed: usize,

    /// Turns answered with the local fallback reply
    pub fallback_replies: usize,

    pub end_reason: Option<EndReason>,
}
