//! Client-side turn taking
//!
//! This module sequences one spoken conversation:
//! - Listening through the microphone until the VAD detects an endpoint
//! - Handing the finalized capture to a `TurnService`
//! - Playing the synthesized reply, then listening again or ending
//!
//! States: IDLE → LISTENING → PROCESSING → AI_SPEAKING → (LISTENING | ENDED)

mod machine;
mod service;
mod state;

pub use machine::{TurnConfig, TurnHandle, TurnMachine};
pub use service::{session_closed, LocalTurnService, TurnService};
pub use state::{Turn, TurnEvent, TurnState};
