//! Ollama-compatible pass-throughs: `/api/generate`, `/api/chat`, `/api/pull`,
//! `/api/delete`, `/api/tags`, `/api/list`.
//!
//! `/api/list` and `/api/tags` are unified behind one handler serving the same shape
//! for both routes, per this repo's resolution of the upstream's two differently
//! shaped listing endpoints.

use super::state::AppState;
use crate::error::GhostWireError;
use axum::extract::State;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/generate", post(generate))
        .route("/api/chat", post(chat))
        .route("/api/pull", post(pull))
        .route("/api/delete", post(delete))
        .route("/api/tags", get(tags))
        .route("/api/list", get(tags))
}

#[derive(Deserialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    #[serde(default)]
    session_id: Option<String>,
}

async fn generate(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Response, GhostWireError> {
    let session_id = req.session_id.unwrap_or_else(|| "ollama-default".to_string());
    let model = req.model.clone();
    let stream = state
        .orchestrator
        .clone()
        .run_turn(session_id, req.prompt, None, None, Some(req.model))
        .await?;

    let frames = stream
        .map(move |fragment| {
            format!(
                "{}\n",
                json!({ "model": model, "response": fragment, "done": false })
            )
        })
        .chain(futures::stream::once(async move {
            format!("{}\n", json!({ "response": "", "done": true }))
        }));

    Ok(super::core::stream_response_with_content_type(
        frames,
        "application/x-ndjson",
    ))
}

#[derive(Deserialize)]
struct OllamaMessage {
    content: String,
}

#[derive(Deserialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    #[serde(default)]
    session_id: Option<String>,
}

async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, GhostWireError> {
    let session_id = req.session_id.unwrap_or_else(|| "ollama-default".to_string());
    let prompt = req.messages.last().map(|m| m.content.clone()).unwrap_or_default();
    let model = req.model.clone();
    let stream = state
        .orchestrator
        .clone()
        .run_turn(session_id, prompt, None, None, Some(req.model))
        .await?;

    let frames = stream
        .map(move |fragment| {
            format!(
                "{}\n",
                json!({ "model": model, "message": { "role": "assistant", "content": fragment }, "done": false })
            )
        })
        .chain(futures::stream::once(async move {
            format!("{}\n", json!({ "done": true }))
        }));

    Ok(super::core::stream_response_with_content_type(
        frames,
        "application/x-ndjson",
    ))
}

/// Thin passthrough to the local upstream's `/api/pull`. Not expected to affect local
/// state; a failure to reach upstream is reported as a generation-upstream error.
async fn pull(State(state): State<AppState>, Json(body): Json<Value>) -> Result<Json<Value>, GhostWireError> {
    passthrough(&state, "/api/pull", body).await
}

async fn delete(State(state): State<AppState>, Json(body): Json<Value>) -> Result<Json<Value>, GhostWireError> {
    passthrough(&state, "/api/delete", body).await
}

async fn passthrough(state: &AppState, path: &str, body: Value) -> Result<Json<Value>, GhostWireError> {
    let url = format!("{}{}", state.orchestrator.config().local_gen_url, path);
    let client = reqwest::Client::new();
    let response = client
        .post(&url)
        .json(&body)
        .send()
        .await
        .map_err(|e| GhostWireError::UpstreamGeneration(e.to_string()))?;
    let value = response
        .json::<Value>()
        .await
        .unwrap_or_else(|_| json!({ "status": "ok" }));
    Ok(Json(value))
}

async fn tags(State(state): State<AppState>) -> Json<Value> {
    let client = reqwest::Client::new();
    let config = state.orchestrator.config();

    let local = fetch_tags(&client, &config.local_gen_url).await;
    let mut remote = fetch_tags(&client, &config.remote_gen_url).await;
    for entry in remote.iter_mut() {
        if let Some(name) = entry.get("name").and_then(Value::as_str).map(str::to_string) {
            entry["name"] = json!(format!("remote-{name}"));
        }
    }

    let mut models = local;
    models.extend(remote);
    Json(json!({ "models": models }))
}

async fn fetch_tags(client: &reqwest::Client, base_url: &str) -> Vec<Value> {
    let Ok(response) = client.get(format!("{base_url}/api/tags")).send().await else {
        return Vec::new();
    };
    let Ok(body) = response.json::<Value>().await else {
        return Vec::new();
    };
    body.get("models")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}
