use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Taxonomy of failures the runtime can produce, per the error-handling design.
///
/// Configuration and internal errors are fatal to the affected component only;
/// transport errors are expected to be recovered by the owning worker's
/// reconnection loop; the rest surface directly to callers.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("coercion error: {0}")]
    Coercion(String),

    #[error("permission error: {0}")]
    Permission(String),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// The taxonomy tag used by the worker to decide reconnect vs. per-operation handling.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Configuration(_) => "configuration",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::Transport(_) => "transport",
            GatewayError::Protocol(_) => "protocol",
            GatewayError::Coercion(_) => "coercion",
            GatewayError::Permission(_) => "permission",
            GatewayError::Resource(_) => "resource",
            GatewayError::Internal(_) => "internal",
        }
    }

    /// Connect/transport failures trigger the worker's reconnection loop; everything
    /// else is a per-operation failure that leaves the connection alone.
    pub fn is_reconnect_trigger(&self) -> bool {
        matches!(self, GatewayError::Transport(_))
    }
}

/// Uniform error body for non-2xx HTTP responses.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        ErrorBody {
            status: "error",
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(message: impl Into<String>, details: serde_json::Value) -> Self {
        ErrorBody {
            status: "error",
            message: message.into(),
            details: Some(details),
        }
    }
}

/// Per-call result type used by protocol adapters.
pub type DriverResult<T> = Result<T, GatewayError>;

/// Maps the taxonomy onto HTTP status codes for the control plane (§4.7,
/// §7): a `GatewayError` returned from a handler renders straight to the
/// uniform `{status:"error",...}` body.
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::Configuration(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Protocol(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Coercion(_) => StatusCode::BAD_REQUEST,
            GatewayError::Permission(_) => StatusCode::FORBIDDEN,
            GatewayError::Resource(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody::new(self.to_string()))).into_response()
    }
}
