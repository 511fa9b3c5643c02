//! Gateway-side error type and its HTTP mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use tonic::{Code, Status};

use crate::supervisor::SupervisorError;

/// Everything a request handler can fail with.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No tenant id could be resolved from the request.
    #[error("tenant id missing: provide X-Tenant-ID, a subdomain, a /tenants/ path or ?tenantId=")]
    MissingTenant,

    /// The request body or parameters were malformed.
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    /// The endpoint's circuit breaker is open.
    #[error("backend circuit open")]
    CircuitOpen,

    /// Transport failure talking to the backend, retries exhausted.
    #[error("backend transport failure: {0}")]
    Transport(Status),

    /// The backend rejected the command with a domain error.
    #[error("{kind}: {message}")]
    Backend { kind: String, message: String },

    /// The backend answered with bytes we cannot decode.
    #[error("malformed backend response: {0}")]
    Decode(String),

    /// Gateway-side failure with no better classification.
    #[error("internal gateway error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    message: String,
}

/// Map a wire error kind to its HTTP status.
fn status_for_kind(kind: &str) -> StatusCode {
    match kind {
        "NotFound" => StatusCode::NOT_FOUND,
        "InvalidArgument" => StatusCode::BAD_REQUEST,
        "CyclicHierarchy" | "ConflictingPolarity" | "CapacityExceeded" | "EdgeMissing" => {
            StatusCode::CONFLICT
        }
        "Cancelled" | "DeadlineExceeded" => StatusCode::REQUEST_TIMEOUT,
        "Shutdown" => StatusCode::SERVICE_UNAVAILABLE,
        // StartupFailed, Internal, TraceOverflow and anything unknown.
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl GatewayError {
    fn status_and_kind(&self) -> (StatusCode, String) {
        match self {
            Self::MissingTenant | Self::BadRequest(_) => {
                (StatusCode::BAD_REQUEST, "InvalidArgument".to_owned())
            }
            Self::Supervisor(e) => (status_for_kind(e.wire_kind()), e.wire_kind().to_owned()),
            Self::CircuitOpen => (StatusCode::SERVICE_UNAVAILABLE, "Unavailable".to_owned()),
            Self::Transport(status) => match status.code() {
                Code::Unavailable => (StatusCode::SERVICE_UNAVAILABLE, "Unavailable".to_owned()),
                Code::DeadlineExceeded => {
                    (StatusCode::REQUEST_TIMEOUT, "DeadlineExceeded".to_owned())
                }
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "Internal".to_owned()),
            },
            Self::Backend { kind, .. } => (status_for_kind(kind), kind.clone()),
            Self::Decode(_) | Self::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal".to_owned())
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        let body = ErrorBody {
            error: kind,
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_status_mapping() {
        assert_eq!(status_for_kind("NotFound"), StatusCode::NOT_FOUND);
        assert_eq!(status_for_kind("InvalidArgument"), StatusCode::BAD_REQUEST);
        assert_eq!(status_for_kind("CyclicHierarchy"), StatusCode::CONFLICT);
        assert_eq!(status_for_kind("ConflictingPolarity"), StatusCode::CONFLICT);
        assert_eq!(status_for_kind("CapacityExceeded"), StatusCode::CONFLICT);
        assert_eq!(status_for_kind("EdgeMissing"), StatusCode::CONFLICT);
        assert_eq!(status_for_kind("Cancelled"), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(status_for_kind("DeadlineExceeded"), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(status_for_kind("Shutdown"), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for_kind("Internal"), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(status_for_kind("StartupFailed"), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(status_for_kind("TraceOverflow"), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn transport_mapping() {
        let (status, kind) =
            GatewayError::Transport(Status::unavailable("down")).status_and_kind();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(kind, "Unavailable");

        let (status, _) = GatewayError::CircuitOpen.status_and_kind();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
