use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::mux::OpenError;
use crate::store::StoreError;

/// Structured error type for all API handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers can
/// return `Result<T, ApiError>` directly.
#[derive(Debug)]
pub enum ApiError {
    /// 401 - No authentication credentials provided.
    AuthRequired,
    /// 403 - Credentials provided but invalid.
    AuthInvalid,
    /// 400 - A host record failed validation.
    ValidationFailed(String),
    /// 404 - A specific host ID was not found.
    HostNotFound(String),
    /// 404 - A specific session key was not found.
    SessionNotFound(String),
    /// 409 - The session is tearing down and cannot be reopened yet.
    SessionClosing(String),
    /// 503 - No transport driver is registered for the protocol.
    DriverUnavailable(String),
    /// 500 - Catch-all internal error.
    InternalError(String),
}

impl ApiError {
    /// Returns the HTTP status code for this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::AuthRequired => StatusCode::UNAUTHORIZED,
            ApiError::AuthInvalid => StatusCode::FORBIDDEN,
            ApiError::ValidationFailed(_) => StatusCode::BAD_REQUEST,
            ApiError::HostNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::SessionClosing(_) => StatusCode::CONFLICT,
            ApiError::DriverUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the machine-readable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AuthRequired => "auth_required",
            ApiError::AuthInvalid => "auth_invalid",
            ApiError::ValidationFailed(_) => "validation_failed",
            ApiError::HostNotFound(_) => "host_not_found",
            ApiError::SessionNotFound(_) => "session_not_found",
            ApiError::SessionClosing(_) => "session_closing",
            ApiError::DriverUnavailable(_) => "driver_unavailable",
            ApiError::InternalError(_) => "internal_error",
        }
    }

    /// Returns the human-readable error message.
    pub fn message(&self) -> String {
        match self {
            ApiError::AuthRequired => "Authentication required".to_string(),
            ApiError::AuthInvalid => "Invalid authentication token".to_string(),
            ApiError::ValidationFailed(msg) => format!("Invalid host record: {}", msg),
            ApiError::HostNotFound(id) => format!("Host not found: {}", id),
            ApiError::SessionNotFound(key) => format!("Session not found: {}", key),
            ApiError::SessionClosing(key) => {
                format!("Session is closing and cannot be reopened yet: {}", key)
            }
            ApiError::DriverUnavailable(proto) => {
                format!("No driver registered for protocol: {}", proto)
            }
            ApiError::InternalError(msg) => format!("Internal error: {}", msg),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(e) => ApiError::ValidationFailed(e.to_string()),
            StoreError::NotFound(id) => ApiError::HostNotFound(id.to_string()),
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

impl From<OpenError> for ApiError {
    fn from(err: OpenError) -> Self {
        match err {
            OpenError::HostNotFound(id) => ApiError::HostNotFound(id.to_string()),
            OpenError::DriverUnavailable(proto) => {
                ApiError::DriverUnavailable(proto.to_string())
            }
            OpenError::Closing(key) => ApiError::SessionClosing(key.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        }));
        (status, body).into_response()
    }
}
