//! Control API error mapping.
//!
//! Every error carries a machine-readable kind plus a human message and
//! maps onto the documented status codes: 401 for authorization failures,
//! 403 for insufficient privilege, 409/422 for the two distinguished
//! start failures, 502 for backend transport failures, 500 for anything
//! that leaves the system in a known-inconsistent state.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use helm_core::auth::AuthError;
use helm_core::process::ProcessError;
use helm_core::store::StoreError;
use serde_json::json;

/// Control API error.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// 400: malformed request.
    #[error("{0}")]
    BadRequest(String),

    /// 401: missing/invalid/expired/revoked token.
    #[error("{0}")]
    Unauthorized(String),

    /// 403: authenticated but not privileged for this endpoint.
    #[error("admin privilege required")]
    Forbidden,

    /// 404: unknown service or entity.
    #[error("{0} not found")]
    NotFound(String),

    /// 409: the service is already running.
    #[error("{0}")]
    Conflict(String),

    /// 422: the service's port is held by a foreign process.
    #[error("{0}")]
    PortInUse(String),

    /// 500: internal failure, with the specific error kind in the body.
    #[error("{message}")]
    Internal {
        /// Machine-readable kind.
        kind: &'static str,
        /// Human message.
        message: String,
    },

    /// 502: a backend (identity service, managed service) could not be
    /// reached.
    #[error("{0}")]
    BadGateway(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::PortInUse(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "already_running",
            Self::PortInUse(_) => "port_in_use",
            Self::Internal { kind, .. } => kind,
            Self::BadGateway(_) => "bad_gateway",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Transport(message) => Self::BadGateway(message),
            other => Self::Unauthorized(other.to_string()),
        }
    }
}

impl From<ProcessError> for ApiError {
    fn from(err: ProcessError) -> Self {
        match &err {
            ProcessError::NotFound(name) => Self::NotFound(format!("service '{name}'")),
            ProcessError::AlreadyRunning { .. } => Self::Conflict(err.to_string()),
            ProcessError::PortInUse { .. } => Self::PortInUse(err.to_string()),
            _ => Self::Internal {
                kind: err.kind(),
                message: err.to_string(),
            },
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::InvalidBatch { .. }
            | StoreError::BatchTooLarge(_)
            | StoreError::InvalidServiceName(_) => Self::BadRequest(err.to_string()),
            StoreError::Storage(_) | StoreError::Io(_) | StoreError::LockPoisoned => {
                Self::Internal {
                    kind: "storage_error",
                    message: err.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::Unauthorized("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ApiError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            ApiError::from(ProcessError::AlreadyRunning { pid: 1 }).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(ProcessError::PortInUse { port: 5010 }).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError::from(ProcessError::StartTimeout).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::from(AuthError::Transport("down".into())).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::from(AuthError::Revoked).status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn test_internal_errors_carry_kind() {
        let err = ApiError::from(ProcessError::KillFailed {
            pid: 42,
            reason: "survived".into(),
        });
        assert_eq!(err.kind(), "kill_failed");
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_batch_validation_maps_to_bad_request() {
        let err = ApiError::from(StoreError::InvalidBatch {
            index: 1,
            reason: "empty message".into(),
        });
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
