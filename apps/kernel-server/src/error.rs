// [[AXON]]/apps/kernel-server/src/error.rs
// Purpose: Process-wide error taxonomy with JSON-RPC and HTTP mappings.
// Architecture: Shared Error Layer
// Dependencies: thiserror, axum

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// JSON-RPC error codes used on the gateway wire.
pub mod rpc_code {
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL: i32 = -32603;
    pub const AUTH_FAILED: i32 = 4001;
    pub const RATE_LIMITED: i32 = 4002;
}

/// WebSocket close codes.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const INTERNAL: u16 = 1011;
    pub const INVALID_MESSAGE: u16 = 4000;
    pub const AUTH_FAILED: u16 = 4001;
    pub const RATE_LIMITED: u16 = 4002;
    pub const TOO_MANY_CONNECTIONS: u16 = 4003;
}

/// Every error surfaced across a component boundary is one of these kinds.
/// Ignored errors are a correctness violation: callers either recover locally
/// or convert into a `KernelError` and let it propagate.
#[derive(Error, Debug)]
pub enum KernelError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("optimistic lock failed: {0}")]
    OptimisticLock(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("upstream failed: {0}")]
    Upstream(String),

    #[error("circuit open for upstream {0}")]
    CircuitOpen(String),

    #[error("shutting down")]
    ShuttingDown,

    #[error("busy: {0}")]
    Busy(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl KernelError {
    /// Stable kind label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            KernelError::InvalidInput(_) => "invalid-input",
            KernelError::Unauthorized(_) => "unauthorized",
            KernelError::Forbidden(_) => "forbidden",
            KernelError::NotFound(_) => "not-found",
            KernelError::Conflict(_) => "conflict",
            KernelError::OptimisticLock(_) => "optimistic-lock",
            KernelError::RateLimited { .. } => "rate-limited",
            KernelError::Upstream(_) => "upstream-failed",
            KernelError::CircuitOpen(_) => "circuit-open",
            KernelError::ShuttingDown => "shutting-down",
            KernelError::Busy(_) => "busy",
            KernelError::Internal(_) => "internal",
        }
    }

    /// JSON-RPC error code for the gateway response frame.
    pub fn rpc_code(&self) -> i32 {
        match self {
            KernelError::InvalidInput(_) => rpc_code::INVALID_PARAMS,
            KernelError::Unauthorized(_) | KernelError::Forbidden(_) => rpc_code::AUTH_FAILED,
            KernelError::NotFound(_) => rpc_code::METHOD_NOT_FOUND,
            KernelError::RateLimited { .. } => rpc_code::RATE_LIMITED,
            KernelError::Conflict(_) | KernelError::OptimisticLock(_) => rpc_code::INVALID_REQUEST,
            KernelError::Busy(_) | KernelError::ShuttingDown => rpc_code::INVALID_REQUEST,
            _ => rpc_code::INTERNAL,
        }
    }

    /// HTTP status for the admin surface.
    pub fn http_status(&self) -> StatusCode {
        match self {
            KernelError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            KernelError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            KernelError::Forbidden(_) => StatusCode::FORBIDDEN,
            KernelError::NotFound(_) => StatusCode::NOT_FOUND,
            KernelError::Conflict(_) | KernelError::OptimisticLock(_) => StatusCode::CONFLICT,
            KernelError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            KernelError::Upstream(_) | KernelError::CircuitOpen(_) => StatusCode::BAD_GATEWAY,
            KernelError::ShuttingDown | KernelError::Busy(_) => StatusCode::SERVICE_UNAVAILABLE,
            KernelError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Optional retry-after hint, present for rate limiting.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            KernelError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

// The admin surface returns a structured problem object, never a bare status.
impl IntoResponse for KernelError {
    fn into_response(self) -> Response {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let status = self.http_status();

        // Internal details stay in the log; the client sees an opaque message.
        let message = match &self {
            KernelError::Internal(detail) => {
                tracing::error!("internal error [{}]: {}", correlation_id, detail);
                "internal error".to_string()
            }
            other => {
                tracing::warn!("request failed [{}] kind={}: {}", correlation_id, other.kind(), other);
                other.to_string()
            }
        };
        metrics::counter!("errors_total", "kind" => self.kind()).increment(1);

        let mut body = json!({
            "error": {
                "kind": self.kind(),
                "message": message,
                "correlation_id": correlation_id,
            }
        });
        if let Some(secs) = self.retry_after() {
            body["error"]["retry_after"] = json!(secs);
        }

        (status, Json(body)).into_response()
    }
}

pub type KernelResult<T> = Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_labels_are_stable() {
        assert_eq!(KernelError::InvalidInput("x".into()).kind(), "invalid-input");
        assert_eq!(KernelError::CircuitOpen("db".into()).kind(), "circuit-open");
        assert_eq!(
            KernelError::RateLimited { retry_after_secs: 3 }.kind(),
            "rate-limited"
        );
    }

    #[test]
    fn rpc_codes_match_protocol() {
        assert_eq!(KernelError::InvalidInput("x".into()).rpc_code(), -32602);
        assert_eq!(KernelError::Unauthorized("x".into()).rpc_code(), 4001);
        assert_eq!(
            KernelError::RateLimited { retry_after_secs: 1 }.rpc_code(),
            4002
        );
        assert_eq!(KernelError::Internal("x".into()).rpc_code(), -32603);
    }

    #[test]
    fn retry_after_only_for_rate_limits() {
        assert_eq!(
            KernelError::RateLimited { retry_after_secs: 7 }.retry_after(),
            Some(7)
        );
        assert_eq!(KernelError::Busy("q".into()).retry_after(), None);
    }
}
