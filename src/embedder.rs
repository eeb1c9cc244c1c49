//! # Embedder Gateway
//!
//! Produces a dense, L2-normalizable vector of a fixed dimension for arbitrary text,
//! by calling out to an Ollama-shaped embedding endpoint. Never fails outright: every
//! candidate model is tried in turn, and if all of them fail the gateway returns a
//! small-epsilon vector rather than propagating the error, so the RAG pipeline always
//! has *something* to embed with.

use once_cell::sync::Lazy;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Mutex;
use tracing::warn;

/// Replacement value for non-finite components and the uniform fallback vector.
const EPSILON: f32 = 1e-8;
/// Below this L1 norm a vector is considered "all zero" and replaced wholesale.
const MIN_L1_NORM: f32 = 1e-12;

/// Remembers the last provider+model pair that successfully produced an embedding, so
/// subsequent calls try it first instead of walking the whole candidate list again.
static STICKY_MODEL: Lazy<Mutex<Option<String>>> = Lazy::new(|| Mutex::new(None));

pub struct EmbedderGateway {
    client: Client,
    base_url: String,
    candidates: Vec<String>,
    dim: usize,
}

impl EmbedderGateway {
    pub fn new(client: Client, base_url: impl Into<String>, candidates: Vec<String>, dim: usize) -> Self {
        EmbedderGateway {
            client,
            base_url: base_url.into(),
            candidates,
            dim,
        }
    }

    fn sticky_model() -> Option<String> {
        STICKY_MODEL.lock().unwrap().clone()
    }

    fn set_sticky_model(model: &str) {
        *STICKY_MODEL.lock().unwrap() = Some(model.to_string());
    }

    fn clear_sticky_model() {
        *STICKY_MODEL.lock().unwrap() = None;
    }

    /// Extract a raw vector from any of the documented response shapes:
    /// `{embedding: [...]}`, `{embeddings: [[...]]}`, or `{data: [{embedding: [...]}]}`.
    fn extract_vector(body: &Value) -> Option<Vec<f32>> {
        if let Some(arr) = body.get("embedding").and_then(Value::as_array) {
            return Some(arr.iter().filter_map(Value::as_f64).map(|v| v as f32).collect());
        }
        if let Some(arr) = body
            .get("embeddings")
            .and_then(Value::as_array)
            .and_then(|outer| outer.first())
            .and_then(Value::as_array)
        {
            return Some(arr.iter().filter_map(Value::as_f64).map(|v| v as f32).collect());
        }
        if let Some(arr) = body
            .get("data")
            .and_then(Value::as_array)
            .and_then(|outer| outer.first())
            .and_then(|first| first.get("embedding"))
            .and_then(Value::as_array)
        {
            return Some(arr.iter().filter_map(Value::as_f64).map(|v| v as f32).collect());
        }
        None
    }

    async fn try_endpoint(&self, path: &str, model: &str, text: &str) -> Option<Vec<f32>> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "model": model, "input": text }))
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let body: Value = response.json().await.ok()?;
        let vector = Self::extract_vector(&body)?;
        if vector.is_empty() {
            return None;
        }
        Some(vector)
    }

    async fn try_model(&self, model: &str, text: &str) -> Option<Vec<f32>> {
        if let Some(v) = self.try_endpoint("/api/embeddings", model, text).await {
            return Some(v);
        }
        if let Some(v) = self.try_endpoint("/api/embed", model, text).await {
            return Some(v);
        }
        None
    }

    fn sanitize(&self, mut vector: Vec<f32>) -> Vec<f32> {
        for component in vector.iter_mut() {
            if !component.is_finite() {
                *component = EPSILON;
            }
        }

        match vector.len().cmp(&self.dim) {
            std::cmp::Ordering::Less => vector.resize(self.dim, EPSILON),
            std::cmp::Ordering::Greater => vector.truncate(self.dim),
            std::cmp::Ordering::Equal => {}
        }

        let l1_norm: f32 = vector.iter().map(|v| v.abs()).sum();
        if l1_norm < MIN_L1_NORM {
            return vec![EPSILON; self.dim];
        }

        vector
    }

    /// Produce an embedding for `text`. Never returns an error: on total failure across
    /// every candidate, yields a uniform-epsilon vector of the configured dimension.
    pub async fn embed(&self, text: &str) -> Vec<f32> {
        if let Some(sticky) = Self::sticky_model() {
            if let Some(vector) = self.try_model(&sticky, text).await {
                return self.sanitize(vector);
            }
            warn!(model = %sticky, "sticky embedding model failed, clearing and retrying candidates");
            Self::clear_sticky_model();
        }

        for model in &self.candidates {
            if let Some(vector) = self.try_model(model, text).await {
                Self::set_sticky_model(model);
                return self.sanitize(vector);
            }
        }

        warn!("all embedding candidates failed, falling back to epsilon vector");
        vec![EPSILON; self.dim]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use serde_json::Value as JsonValue;

    async fn run_mock_server(body: JsonValue, status: u16) -> (String, tokio::sync::oneshot::Sender<()>) {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let status_code = axum::http::StatusCode::from_u16(status).unwrap();
        let app = Router::new()
            .route(
                "/api/embeddings",
                post(move |Json(_payload): Json<JsonValue>| {
                    let body = body.clone();
                    async move { (status_code, Json(body)) }
                }),
            )
            .route(
                "/api/embed",
                post(|Json(_payload): Json<JsonValue>| async { axum::http::StatusCode::NOT_FOUND }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("http://{addr}");
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
        });
        (url, tx)
    }

    #[tokio::test]
    async fn embed_returns_vector_from_embedding_shape() {
        let (url, stop) = run_mock_server(json!({ "embedding": [0.1, 0.2, 0.3, 0.4] }), 200).await;
        let gateway = EmbedderGateway::new(Client::new(), url, vec!["test-model".into()], 4);
        let vector = gateway.embed("hello").await;
        assert_eq!(vector, vec![0.1, 0.2, 0.3, 0.4]);
        let _ = stop.send(());
    }

    #[tokio::test]
    async fn embed_pads_short_vectors_with_epsilon() {
        let (url, stop) = run_mock_server(json!({ "embedding": [1.0] }), 200).await;
        let gateway = EmbedderGateway::new(Client::new(), url, vec!["test-model".into()], 4);
        let vector = gateway.embed("hello").await;
        assert_eq!(vector.len(), 4);
        assert_eq!(vector[0], 1.0);
        assert_eq!(vector[1], EPSILON);
        let _ = stop.send(());
    }

    #[tokio::test]
    async fn embed_truncates_long_vectors() {
        let (url, stop) = run_mock_server(json!({ "embedding": [1.0, 2.0, 3.0, 4.0, 5.0] }), 200).await;
        let gateway = EmbedderGateway::new(Client::new(), url, vec!["test-model".into()], 3);
        let vector = gateway.embed("hello").await;
        assert_eq!(vector, vec![1.0, 2.0, 3.0]);
        let _ = stop.send(());
    }

    #[tokio::test]
    async fn embed_falls_back_to_epsilon_on_total_failure() {
        *STICKY_MODEL.lock().unwrap() = None;
        let gateway = EmbedderGateway::new(
            Client::new(),
            "http://127.0.0.1:1".to_string(),
            vec!["unreachable-model".into()],
            4,
        );
        let vector = gateway.embed("hello").await;
        assert_eq!(vector, vec![EPSILON; 4]);
    }

    #[test]
    fn extract_vector_supports_nested_embeddings_shape() {
        let body = json!({ "embeddings": [[1.0, 2.0]] });
        assert_eq!(EmbedderGateway::extract_vector(&body), Some(vec![1.0, 2.0]));
    }

    #[test]
    fn extract_vector_supports_data_shape() {
        let body = json!({ "data": [{ "embedding": [3.0, 4.0] }] });
        assert_eq!(EmbedderGateway::extract_vector(&body), Some(vec![3.0, 4.0]));
    }

    #[test]
    fn extract_vector_returns_none_for_unknown_shape() {
        let body = json!({ "unexpected": true });
        assert_eq!(EmbedderGateway::extract_vector(&body), None);
    }
}
