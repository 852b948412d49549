//! Server-side dialogue pipeline
//!
//! One turn of captured audio becomes a persisted exchange:
//! - Transcribe the audio (placeholder transcript on failure)
//! - Compose the scenario context and recent history
//! - Generate a reply with feedback (fixed apology on failure)
//! - Synthesize the reply (text-only on failure)
//! - Persist both messages and the end-of-conversation flag

mod orchestrator;
mod types;

pub use orchestrator::{normalize_feedback, DialoguePipeline, PipelineError};
pub use types::{
    base64_payload, DialogueContext, DialogueGenerator, Generation, SpeechSynthesizer,
    Transcriber, TurnAudio, TurnResponse,
};
