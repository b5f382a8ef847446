//! Error taxonomy shared by the strategy runtime and the API layer.
//!
//! Strategies branch on these kinds: validation failures surface synchronously,
//! venue rejections are recorded and survived, timeouts are retryable with the
//! same idempotency key.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Bad caller input: out-of-range numeric, unknown side, below min notional.
    #[error("{0}")]
    Validation(String),

    /// Per-kind concurrency cap reached.
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    /// Duplicate resource, e.g. a second trail stop on the same position.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Execution channel not connected or ENGINE_READY not yet observed.
    #[error("execution engine not ready")]
    NotReady,

    /// Pending engine request timed out; retry with the same idempotency key.
    #[error("execution engine timeout after {0}ms")]
    Timeout(u64),

    /// Venue rejected the command (margin, precision, min-qty).
    #[error("venue rejected: {0}")]
    Rejected(String),

    /// Outbound channel to the engine is gone.
    #[error("execution channel closed")]
    ChannelClosed,

    /// Unknown strategy id.
    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    /// Whether a retry with the same idempotency key is reasonable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Timeout(_) | EngineError::ChannelClosed)
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::LimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            EngineError::Conflict(_) => StatusCode::CONFLICT,
            EngineError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            EngineError::Rejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::ChannelClosed => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(EngineError::Timeout(15_000).is_retryable());
        assert!(EngineError::ChannelClosed.is_retryable());
        assert!(!EngineError::Validation("bad side".into()).is_retryable());
        assert!(!EngineError::Rejected("min qty".into()).is_retryable());
    }
}
