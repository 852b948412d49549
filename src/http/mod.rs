//! HTTP transport between the conversation client and the dialogue pipeline
//!
//! Server routes:
//! - POST /sessions - Create a session for a scenario
//! - GET /sessions/:id - Session with its messages
//! - POST /sessions/:id/turns - Run one spoken turn
//! - POST /sessions/:id/end - End a session
//! - GET /health - Health check
//!
//! `HttpTurnClient` is the client side of the same routes.

mod client;
mod handlers;
mod routes;
mod state;

pub use client::HttpTurnClient;
pub use handlers::{ErrorResponse, TurnRequest};
pub use routes::create_router;
pub use state::AppState;
