//! axum HTTP surface: GhostWire-native, OpenAI-compatible, Ollama-compatible and
//! Qdrant-compatible routes, all over the same [`RagOrchestrator`](crate::rag::RagOrchestrator).

pub mod core;
pub mod ollama;
pub mod openai;
pub mod qdrant;
pub mod state;

use axum::Router;
use state::AppState;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(core::router())
        .merge(openai::router())
        .merge(ollama::router())
        .merge(qdrant::router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
