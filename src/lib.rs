pub mod audio;
pub mod config;
pub mod http;
pub mod pipeline;
pub mod providers;
pub mod session;
pub mod turn;
pub mod vad;

pub use audio::{
    AudioBackend, AudioBackendConfig, AudioCapture, AudioDevices, AudioFile, AudioFrame,
    AudioOutput, CaptureError, CapturedAudio, DecodingOutput, FileBackend, Playback,
    PlaybackError, PlaybackOutcome,
};
pub use config::Config;
pub use http::{create_router, AppState, HttpTurnClient};
pub use pipeline::{DialoguePipeline, PipelineError, TurnAudio, TurnResponse};
pub use session::{
    ConversationSession, ConversationStats, EndReason, InMemorySessionStore, Message,
    ScenarioContext, SessionStore,
};
pub use turn::{LocalTurnService, TurnConfig, TurnEvent, TurnHandle, TurnMachine, TurnService, TurnState};
pub use vad::{VadEvent, VoiceActivityDetector};
