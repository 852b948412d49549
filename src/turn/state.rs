use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audio::{CaptureError, PlaybackOutcome};
use crate::session::FeedbackItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnState {
    Idle,
    Listening,
    Processing,
    AiSpeaking,
    /// Terminal
    Ended,
}

/// One user utterance → AI response cycle
#[derive(Debug, Clone)]
pub struct Turn {
    pub id: u64,
    pub started_at: DateTime<Utc>,
    pub state: TurnState,
    /// Length of the finalized capture
    pub captured_ms: u64,
    pub transcript: Option<String>,
    pub reply_text: Option<String>,
    pub audio: Option<Vec<u8>>,
    /// Set when the reply was substituted locally
    pub errored: bool,
    /// The server marked the conversation finished with this turn
    pub ended: bool,
}

impl Turn {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            started_at: Utc::now(),
            state: TurnState::Listening,
            captured_ms: 0,
            transcript: None,
            reply_text: None,
            audio: None,
            errored: false,
            ended: false,
        }
    }
}

/// Notifications for whoever renders the conversation
#[derive(Debug, Clone)]
pub enum TurnEvent {
    StateChanged {
        from: TurnState,
        to: TurnState,
    },
    SpeechStarted {
        turn_id: u64,
    },
    /// The server answered the turn
    Exchange {
        turn_id: u64,
        user_text: String,
        reply_text: String,
        feedback: Vec<FeedbackItem>,
        has_audio: bool,
        ended: bool,
    },
    /// The turn could not reach the server
    TransportFailed {
        turn_id: u64,
        message: String,
    },
    /// Reply substituted locally after a failed turn
    LocalReply {
        turn_id: u64,
        text: String,
    },
    PlaybackFinished {
        turn_id: u64,
        outcome: PlaybackOutcome,
    },
    /// The microphone could not be acquired; the conversation is over
    CaptureFailed {
        error: CaptureError,
    },
    /// The cycle resolved and the turn was consumed
    TurnResolved {
        turn: Turn,
    },
}
