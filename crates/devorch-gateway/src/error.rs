//! Error types for the gateway

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use devorch_core::OrchestratorError;
use thiserror::Error;

/// Gateway error type
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Core(#[from] OrchestratorError),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Machine-readable code, shared with core errors
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Core(err) => err.code(),
            GatewayError::WebSocket(_) => "websocket",
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::InvalidConfig(_) => "invalid_config",
            GatewayError::Io(_) => "io",
            GatewayError::Serialization(_) => "serialization",
            GatewayError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.code() {
            "service_not_found" | "command_not_found" | "saved_command_not_found" => {
                StatusCode::NOT_FOUND
            }
            "approval_conflict" | "port_conflict" | "invalid_state" => StatusCode::CONFLICT,
            "policy_violation" => StatusCode::FORBIDDEN,
            "approval_required" => StatusCode::ACCEPTED,
            "invalid_request" | "invalid_config" | "serialization" => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("request failed: {}", self);
        } else {
            tracing::debug!("request refused: {}", self);
        }
        let body = axum::Json(serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Serialization(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        GatewayError::WebSocket(e.to_string())
    }
}

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;
    use devorch_core::{ApprovalId, ServiceId};

    #[test]
    fn test_status_mapping() {
        let cases = [
            (OrchestratorError::ServiceNotFound(ServiceId::from("svc_x")), StatusCode::NOT_FOUND),
            (
                OrchestratorError::ApprovalConflict {
                    id: ApprovalId::from("apr_x"),
                    reason: "approval already resolved".to_string(),
                },
                StatusCode::CONFLICT,
            ),
            (
                OrchestratorError::PortConflict {
                    port: 3000,
                    owner: "web".to_string(),
                },
                StatusCode::CONFLICT,
            ),
            (OrchestratorError::PolicyViolation("no".to_string()), StatusCode::FORBIDDEN),
            (OrchestratorError::ApprovalRequired("ask".to_string()), StatusCode::ACCEPTED),
            (OrchestratorError::InvalidRequest("empty".to_string()), StatusCode::BAD_REQUEST),
            (OrchestratorError::Storage("disk".to_string()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(GatewayError::from(err).status(), status);
        }
    }

    #[test]
    fn test_context_does_not_hide_code() {
        use devorch_core::ResultExt;
        let result: devorch_core::Result<()> =
            Err(OrchestratorError::ServiceNotFound(ServiceId::from("svc_x")));
        let err = GatewayError::from(result.context("stopping service").unwrap_err());
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
