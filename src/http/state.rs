//! Shared application state handed to every axum handler.

use crate::rag::RagOrchestrator;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<RagOrchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<RagOrchestrator>) -> Self {
        AppState { orchestrator }
    }
}
