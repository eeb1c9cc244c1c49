//! # Generator Gateway
//!
//! Streams tokens from an upstream Ollama-shaped generation endpoint as newline-
//! delimited JSON frames. Routes between a local and a remote provider based on a
//! model-name affix convention, and degrades to a single sentinel string rather than
//! propagating a connection failure to the caller — the RAG Orchestrator treats a
//! degraded answer as a complete (if apologetic) one.

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde_json::Value;

pub struct GeneratorGateway {
    client: Client,
    local_url: String,
    remote_url: String,
    default_model: String,
}

/// A routed model name: which upstream to call, and the model name with routing
/// affixes (`remote-`/`local-` prefixes, `:remote`/`:local` suffixes) stripped.
struct Route {
    use_remote: bool,
    model: String,
}

fn route_model(model: &str) -> Route {
    let use_remote = model.starts_with("remote-") || model.ends_with(":remote");
    let mut stripped = model;
    stripped = stripped.strip_prefix("remote-").unwrap_or(stripped);
    stripped = stripped.strip_prefix("local-").unwrap_or(stripped);
    stripped = stripped.strip_suffix(":remote").unwrap_or(stripped);
    stripped = stripped.strip_suffix(":local").unwrap_or(stripped);
    Route {
        use_remote,
        model: stripped.to_string(),
    }
}

impl GeneratorGateway {
    pub fn new(
        client: Client,
        local_url: impl Into<String>,
        remote_url: impl Into<String>,
        default_model: impl Into<String>,
    ) -> Self {
        GeneratorGateway {
            client,
            local_url: local_url.into(),
            remote_url: remote_url.into(),
            default_model: default_model.into(),
        }
    }

    /// Split a raw byte stream on `\n` into owned line strings, buffering partial
    /// lines across chunk boundaries. Mirrors the unfold-based line reader used for
    /// other NDJSON upstreams in this codebase's lineage.
    fn lines_of(
        byte_stream: BoxStream<'static, reqwest::Result<Bytes>>,
    ) -> BoxStream<'static, String> {
        let stream = futures::stream::unfold(
            (byte_stream, Vec::<u8>::new()),
            |(mut stream, mut buffer)| async move {
                loop {
                    if let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                        let line_bytes: Vec<u8> = buffer.drain(0..=pos).collect();
                        let line =
                            String::from_utf8_lossy(&line_bytes[..line_bytes.len() - 1]).to_string();
                        return Some((line, (stream, buffer)));
                    }
                    match stream.next().await {
                        Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                        Some(Err(_)) | None => {
                            if buffer.is_empty() {
                                return None;
                            }
                            let line = String::from_utf8_lossy(&buffer).to_string();
                            buffer.clear();
                            return Some((line, (stream, buffer)));
                        }
                    }
                }
            },
        );
        Box::pin(stream)
    }

    /// Extract the token fragment from a single NDJSON frame, and whether it signals
    /// completion. Malformed frames yield `(None, false)` and are simply skipped.
    fn parse_frame(line: &str) -> (Option<String>, bool) {
        if line.trim().is_empty() {
            return (None, false);
        }
        let Ok(obj) = serde_json::from_str::<Value>(line) else {
            return (None, false);
        };
        let chunk = obj
            .get("response")
            .and_then(Value::as_str)
            .or_else(|| obj.get("message").and_then(|m| m.get("content")).and_then(Value::as_str))
            .map(str::to_string);
        let done = obj.get("done").and_then(Value::as_bool).unwrap_or(false);
        (chunk, done)
    }

    async fn open_stream(
        &self,
        url: &str,
        model: &str,
        prompt: &str,
    ) -> reqwest::Result<reqwest::Response> {
        self.client
            .post(url)
            .json(&serde_json::json!({ "model": model, "prompt": prompt, "stream": true }))
            .send()
            .await
    }

    /// Stream tokens for `prompt` against `model` (routing affixes applied). Returns a
    /// stream of plain text fragments; on upstream connection failure the stream
    /// yields exactly one `"[ERROR] ..."` fragment and then ends.
    pub async fn stream(&self, prompt: String, model: &str) -> BoxStream<'static, String> {
        let route = route_model(model);
        let base_url = if route.use_remote {
            &self.remote_url
        } else {
            &self.local_url
        };
        let url = format!("{base_url}/api/generate");
        let is_default_model = route.model == self.default_model;

        let response = match self.open_stream(&url, &route.model, &prompt).await {
            Ok(r) if r.status() == reqwest::StatusCode::NOT_FOUND && !route.use_remote && !is_default_model => {
                match self.open_stream(&url, &self.default_model, &prompt).await {
                    Ok(retry) => retry,
                    Err(e) => return Self::error_stream(e.to_string()),
                }
            }
            Ok(r) => r,
            Err(e) => return Self::error_stream(e.to_string()),
        };

        if !response.status().is_success() {
            return Self::error_stream(format!("upstream returned status {}", response.status()));
        }

        let byte_stream: BoxStream<'static, reqwest::Result<Bytes>> = Box::pin(response.bytes_stream());
        let lines = Self::lines_of(byte_stream);

        let tokens = futures::stream::unfold(lines, |mut lines| async move {
            loop {
                let line = lines.next().await?;
                let (chunk, done) = Self::parse_frame(&line);
                if let Some(chunk) = chunk {
                    if !chunk.is_empty() {
                        return Some((chunk, lines));
                    }
                }
                if done {
                    return None;
                }
            }
        });

        Box::pin(tokens)
    }

    fn error_stream(message: String) -> BoxStream<'static, String> {
        Box::pin(futures::stream::once(async move { format!("[ERROR] {message}") }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Router};

    #[test]
    fn route_model_strips_remote_prefix() {
        let route = route_model("remote-llama3");
        assert!(route.use_remote);
        assert_eq!(route.model, "llama3");
    }

    #[test]
    fn route_model_strips_remote_suffix() {
        let route = route_model("llama3:remote");
        assert!(route.use_remote);
        assert_eq!(route.model, "llama3");
    }

    #[test]
    fn route_model_strips_local_prefix() {
        let route = route_model("local-llama3");
        assert!(!route.use_remote);
        assert_eq!(route.model, "llama3");
    }

    #[test]
    fn route_model_strips_local_suffix() {
        let route = route_model("llama3:local");
        assert!(!route.use_remote);
        assert_eq!(route.model, "llama3");
    }

    #[test]
    fn route_model_with_no_affix_routes_locally() {
        let route = route_model("llama3");
        assert!(!route.use_remote);
        assert_eq!(route.model, "llama3");
    }

    #[test]
    fn parse_frame_extracts_response_field() {
        let (chunk, done) = GeneratorGateway::parse_frame(r#"{"response":"hi","done":false}"#);
        assert_eq!(chunk, Some("hi".to_string()));
        assert!(!done);
    }

    #[test]
    fn parse_frame_extracts_message_content_field() {
        let (chunk, done) =
            GeneratorGateway::parse_frame(r#"{"message":{"content":"hi"},"done":true}"#);
        assert_eq!(chunk, Some("hi".to_string()));
        assert!(done);
    }

    #[test]
    fn parse_frame_is_lenient_on_malformed_json() {
        let (chunk, done) = GeneratorGateway::parse_frame("not json");
        assert_eq!(chunk, None);
        assert!(!done);
    }

    async fn run_mock_server() -> (String, tokio::sync::oneshot::Sender<()>) {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let app = Router::new().route(
            "/api/generate",
            post(|| async {
                "{\"response\":\"Hel\",\"done\":false}\n{\"response\":\"lo\",\"done\":true}\n"
            }),
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
    async fn stream_yields_tokens_and_stops_at_done() {
        let (url, stop) = run_mock_server().await;
        let gateway = GeneratorGateway::new(Client::new(), url.clone(), url, "llama3");
        let mut stream = gateway.stream("hi".to_string(), "llama3").await;
        let mut full = String::new();
        while let Some(chunk) = stream.next().await {
            full.push_str(&chunk);
        }
        assert_eq!(full, "Hello");
        let _ = stop.send(());
    }

    #[tokio::test]
    async fn stream_yields_error_sentinel_on_connection_failure() {
        let gateway = GeneratorGateway::new(
            Client::new(),
            "http://127.0.0.1:1".to_string(),
            "http://127.0.0.1:1".to_string(),
            "llama3",
        );
        let mut stream = gateway.stream("hi".to_string(), "llama3").await;
        let first = stream.next().await.unwrap();
        assert!(first.starts_with("[ERROR]"));
        assert!(stream.next().await.is_none());
    }
}
