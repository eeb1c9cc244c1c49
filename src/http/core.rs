//! Core GhostWire-native endpoints: `/chat_embedding`, `/retrieve`, `/rag`, `/health`.

use super::state::AppState;
use crate::error::{GhostWireError, GhostWireResult};
use crate::rag;
use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use axum::routing::{get, post};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/chat_embedding", post(chat_embedding))
        .route("/retrieve", post(retrieve))
        .route("/rag", post(rag))
        .route("/health", get(health))
}

#[derive(Deserialize)]
pub struct ChatEmbeddingRequest {
    session_id: String,
    #[serde(alias = "prompt_text")]
    text: String,
    embedding: Option<Vec<f32>>,
    context: Option<String>,
}

/// Turn a token stream into a streaming HTTP response with the given content type.
pub(crate) fn stream_response_with_content_type(
    stream: impl futures::Stream<Item = String> + Send + 'static,
    content_type: &'static str,
) -> Response {
    let body = Body::from_stream(stream.map(|chunk| Ok::<_, std::io::Error>(chunk)));
    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .body(body)
        .unwrap()
}

fn stream_response(stream: impl futures::Stream<Item = String> + Send + 'static) -> Response {
    stream_response_with_content_type(stream, "text/plain; charset=utf-8")
}

async fn chat_embedding(
    State(state): State<AppState>,
    Json(req): Json<ChatEmbeddingRequest>,
) -> Result<Response, GhostWireError> {
    let stream = state
        .orchestrator
        .clone()
        .run_turn(req.session_id, req.text, req.context, req.embedding, None)
        .await?;
    Ok(stream_response(stream))
}

#[derive(Deserialize)]
pub struct RetrieveRequest {
    session_id: String,
    text: String,
}

async fn retrieve(
    State(state): State<AppState>,
    Json(req): Json<RetrieveRequest>,
) -> GhostWireResult<Json<serde_json::Value>> {
    rag::validate_session_id(&req.session_id)?;
    rag::validate_text(&req.text)?;

    let vector = state.orchestrator.embedder().embed(&req.text).await;
    let contexts = state
        .orchestrator
        .retrieve(&req.session_id, &vector, state.orchestrator.config().top_k)?;

    Ok(Json(json!({ "status": "ok", "contexts": contexts })))
}

#[derive(Deserialize)]
pub struct RagRequest {
    session_id: String,
    text: String,
    model: Option<String>,
}

async fn rag(
    State(state): State<AppState>,
    Json(req): Json<RagRequest>,
) -> Result<Response, GhostWireError> {
    let stream = state
        .orchestrator
        .clone()
        .run_turn(req.session_id, req.text, None, None, req.model)
        .await?;
    Ok(stream_response(stream))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}
