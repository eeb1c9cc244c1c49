//! OpenAI-compatible endpoints: `/v1/embeddings`, `/v1/chat/completions`,
//! `/v1/completions`, `/v1/models`, `/v1/models/{id}`.

use super::state::AppState;
use crate::error::{GhostWireError, GhostWireResult};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/models", get(list_models))
        .route("/v1/models/{id}", get(get_model))
}

#[derive(Deserialize)]
struct EmbeddingsRequest {
    input: Value,
    #[serde(default)]
    model: Option<String>,
}

/// Flatten `input` into a flat list of strings. `input` may be a single string, a
/// flat array of strings, or an array nesting further string arrays (e.g.
/// `[["a","b"],"c"]`) — nested arrays are flattened before use.
fn flatten_embeddings_input(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Array(items) => {
            for item in items {
                flatten_embeddings_input(item, out);
            }
        }
        _ => {}
    }
}

async fn embeddings(
    State(state): State<AppState>,
    Json(req): Json<EmbeddingsRequest>,
) -> GhostWireResult<Json<Value>> {
    let mut inputs = Vec::new();
    flatten_embeddings_input(&req.input, &mut inputs);

    let mut data = Vec::with_capacity(inputs.len());
    let mut total_tokens = 0usize;
    for (index, text) in inputs.iter().enumerate() {
        let vector = state.orchestrator.embedder().embed(text).await;
        total_tokens += crate::rag::estimate_token_count(text);
        data.push(json!({
            "object": "embedding",
            "embedding": vector,
            "index": index,
        }));
    }

    let model = req.model.unwrap_or_else(|| state.orchestrator.config().default_model.clone());
    Ok(Json(json!({
        "object": "list",
        "data": data,
        "model": model,
        "usage": { "prompt_tokens": total_tokens, "total_tokens": total_tokens },
    })))
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    #[allow(dead_code)]
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatCompletionsRequest {
    messages: Vec<ChatMessage>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    session_id: Option<String>,
}

fn session_id_or_default(req_session_id: Option<String>) -> String {
    req_session_id.unwrap_or_else(|| "openai-default".to_string())
}

async fn chat_completions(
    State(state): State<AppState>,
    Json(req): Json<ChatCompletionsRequest>,
) -> Result<Response, GhostWireError> {
    let prompt = req
        .messages
        .last()
        .map(|m| m.content.clone())
        .unwrap_or_default();
    let session_id = session_id_or_default(req.session_id);
    let model = req.model.clone();

    if req.stream {
        let stream = state
            .orchestrator
            .clone()
            .run_turn(session_id, prompt, None, None, model.clone())
            .await?;
        let model_for_frames = model.unwrap_or_else(|| state.orchestrator.config().default_model.clone());
        let sse = stream
            .map(move |fragment| {
                let frame = json!({
                    "object": "chat.completion.chunk",
                    "model": model_for_frames,
                    "choices": [{ "delta": { "content": fragment }, "index": 0, "finish_reason": Value::Null }],
                });
                format!("data: {frame}\n\n")
            })
            .chain(futures::stream::once(async { "data: [DONE]\n\n".to_string() }));
        Ok(super::core::stream_response_with_content_type(sse, "text/event-stream"))
    } else {
        let result = state
            .orchestrator
            .clone()
            .run_turn_blocking(session_id, prompt, None, None, model.clone())
            .await?;
        let model = model.unwrap_or_else(|| state.orchestrator.config().default_model.clone());
        Ok(Json(json!({
            "object": "chat.completion",
            "model": model,
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": result.response },
                "finish_reason": "stop",
            }],
        }))
        .into_response())
    }
}

#[derive(Deserialize)]
struct CompletionsRequest {
    prompt: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

async fn completions(
    State(state): State<AppState>,
    Json(req): Json<CompletionsRequest>,
) -> GhostWireResult<Json<Value>> {
    let session_id = session_id_or_default(req.session_id);
    let model = req.model.clone();
    let result = state
        .orchestrator
        .clone()
        .run_turn_blocking(session_id, req.prompt, None, None, model.clone())
        .await?;
    let model = model.unwrap_or_else(|| state.orchestrator.config().default_model.clone());
    Ok(Json(json!({
        "object": "text_completion",
        "model": model,
        "choices": [{ "index": 0, "text": result.response, "finish_reason": "stop" }],
    })))
}

/// Fetch `{models:[{name,...}]}` from an upstream `/api/tags`, tolerating failure.
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

async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let client = reqwest::Client::new();
    let config = state.orchestrator.config();

    let local = fetch_tags(&client, &config.local_gen_url).await;
    let remote = fetch_tags(&client, &config.remote_gen_url).await;

    let mut models: Vec<Value> = local
        .into_iter()
        .filter_map(|m| m.get("name").and_then(Value::as_str).map(|n| json!({ "id": n, "object": "model" })))
        .collect();
    models.extend(remote.into_iter().filter_map(|m| {
        m.get("name")
            .and_then(Value::as_str)
            .map(|n| json!({ "id": format!("remote-{n}"), "object": "model" }))
    }));

    Json(json!({ "object": "list", "data": models }))
}

async fn get_model(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    let _ = &state;
    Json(json!({ "id": id, "object": "model" }))
}
