use std::time::Duration;

use axum::Json;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::backend::BackendError;
use crate::registry::RegistryError;
use crate::status::BackendStatus;

/// Errors surfaced to HTTP callers.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Backend '{id}' not found")]
    UnknownBackend {
        id: String,
        available_endpoints: Vec<String>,
    },

    #[error("No route for {path}")]
    RouteNotFound {
        path: String,
        available_endpoints: Vec<String>,
    },

    #[error("Backend '{0}' is already registered")]
    DuplicateId(String),

    #[error("Backend '{0}' already has a running process")]
    AlreadyRunning(String),

    #[error("Backend '{id}' uses the {kind} transport, which does not support {operation}")]
    UnsupportedTransport {
        id: String,
        kind: &'static str,
        operation: &'static str,
    },

    #[error("Backend '{id}' is {status}")]
    BackendNotRunning { id: String, status: BackendStatus },

    #[error("Failed to start backend '{id}': {reason}")]
    BackendSpawn { id: String, reason: String },

    #[error("Backend '{id}' is unavailable: {reason}")]
    UpstreamUnavailable { id: String, reason: String },

    #[error("Backend '{id}' did not reply within {}s", .timeout.as_secs())]
    RequestTimeout { id: String, timeout: Duration },

    /// Non-success reply from an upstream, relayed as-is.
    #[error("{message}")]
    Upstream { status: u16, message: String },

    #[error("Invalid request body: {0}")]
    InvalidBody(String),
}

impl GatewayError {
    pub fn from_backend(id: &str, err: BackendError) -> Self {
        match err {
            BackendError::Timeout(timeout) => GatewayError::RequestTimeout {
                id: id.to_string(),
                timeout,
            },
            BackendError::HttpStatus(status, message) => GatewayError::Upstream { status, message },
            BackendError::Spawn(reason) => GatewayError::BackendSpawn {
                id: id.to_string(),
                reason,
            },
            other => GatewayError::UpstreamUnavailable {
                id: id.to_string(),
                reason: other.to_string(),
            },
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::UnknownBackend { .. } | GatewayError::RouteNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            GatewayError::DuplicateId(_) | GatewayError::AlreadyRunning(_) => StatusCode::CONFLICT,
            GatewayError::UnsupportedTransport { .. } | GatewayError::InvalidBody(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::BackendNotRunning { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::BackendSpawn { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::RequestTimeout { .. } => StatusCode::REQUEST_TIMEOUT,
            GatewayError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
        }
    }
}

impl From<RegistryError> for GatewayError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::DuplicateId(id) => GatewayError::DuplicateId(id),
            RegistryError::NotFound(id) => GatewayError::UnknownBackend {
                id,
                available_endpoints: Vec::new(),
            },
            RegistryError::ProcessAttached(id) => GatewayError::AlreadyRunning(id),
            RegistryError::WaitTimeout { id, status, .. } => {
                GatewayError::BackendNotRunning { id, status }
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self, "Request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "Request rejected");
        }

        match self {
            GatewayError::Upstream { message, .. } => {
                let content_type = if serde_json::from_str::<serde_json::Value>(&message).is_ok() {
                    "application/json"
                } else {
                    "text/plain; charset=utf-8"
                };
                (status, [(header::CONTENT_TYPE, content_type)], message).into_response()
            }
            GatewayError::UnknownBackend {
                ref available_endpoints,
                ..
            }
            | GatewayError::RouteNotFound {
                ref available_endpoints,
                ..
            } => {
                let body = json!({
                    "error": self.to_string(),
                    "available_endpoints": available_endpoints,
                });
                (status, Json(body)).into_response()
            }
            other => (status, Json(json!({"error": other.to_string()}))).into_response(),
        }
    }
}
