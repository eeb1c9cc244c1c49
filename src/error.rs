//! The typed error hierarchy for GhostWire.
//!
//! Every recoverable failure mode described in the error-handling design has its own
//! variant here. Handlers convert this enum into an HTTP response via [`IntoResponse`];
//! most variants never actually reach a client because the component that raises them
//! recovers locally (logs and falls back) before the orchestrator would otherwise
//! propagate it. The enum exists so that recovery policy lives in one place instead of
//! being re-decided ad hoc at every call site.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(thiserror::Error, Debug)]
pub enum GhostWireError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("upstream embedding error: {0}")]
    UpstreamEmbedding(String),

    #[error("upstream generation error: {0}")]
    UpstreamGeneration(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("index error: {0}")]
    Index(String),

    #[error("index shape mismatch: expected dim {expected}, found {found}")]
    IndexShape { expected: usize, found: usize },

    #[error("collection not found: {0}")]
    CollectionNotFound(String),
}

impl GhostWireError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn index(msg: impl Into<String>) -> Self {
        Self::Index(msg.into())
    }

    /// Status code per §7's propagation policy. Most variants are recovered before
    /// they would ever be converted to a response; this mapping exists for the
    /// minority of call sites where the error is observed before streaming starts.
    fn status(&self) -> StatusCode {
        match self {
            GhostWireError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            GhostWireError::UpstreamEmbedding(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GhostWireError::UpstreamGeneration(_) => StatusCode::OK,
            GhostWireError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GhostWireError::Index(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GhostWireError::IndexShape { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            GhostWireError::CollectionNotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for GhostWireError {
    fn into_response(self) -> Response {
        let status = self.status();
        if !matches!(status, StatusCode::OK) {
            tracing::warn!(error = %self, "request failed");
        }
        let body = Json(json!({ "status": "error", "message": self.to_string() }));
        (status, body).into_response()
    }
}

pub type GhostWireResult<T> = Result<T, GhostWireError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_maps_to_422() {
        let err = GhostWireError::validation("bad session id");
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn collection_not_found_maps_to_404() {
        let err = GhostWireError::CollectionNotFound("s1".into());
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn upstream_generation_error_is_ok_status() {
        // the error is already surfaced in-stream as an [ERROR] line; the HTTP
        // status is 200 because headers are already sent by the time it happens.
        let err = GhostWireError::UpstreamGeneration("connection refused".into());
        assert_eq!(err.status(), StatusCode::OK);
    }
}
