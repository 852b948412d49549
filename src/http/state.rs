use crate::pipeline::DialoguePipeline;
use crate::session::SessionStore;
use std::sync::Arc;

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<DialoguePipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<DialoguePipeline>) -> Self {
        Self { pipeline }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        self.pipeline.store()
    }
}
