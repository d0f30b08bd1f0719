//! Error types shared by the payload service.
//!
//! Every failure on the request path is one of these variants; the HTTP
//! mapping lives in the `IntoResponse` impl below.

use axum::{
    http::{header::HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};

/// Header carrying the machine-readable error code on failed requests.
pub static ERROR_CODE_HEADER: HeaderName = HeaderName::from_static("x-error-code");

/// Result alias used across the workspace.
pub type AppResult<T> = Result<T, AppError>;

/// Application error.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A required configuration value is missing or malformed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network failure or refusal while opening a database session.
    #[error("Database connection failed: {0}")]
    DatabaseConnection(String),

    /// The database (or the IAM credential exchange) rejected our identity.
    #[error("Authentication rejected: {0}")]
    Authentication(String),

    /// Statement failed or a row could not be decoded.
    #[error("Database query failed: {0}")]
    DatabaseQuery(String),

    /// A bounded operation ran past its deadline.
    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: &'static str, secs: u64 },

    /// Cloud SQL Admin API or metadata server failure.
    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable error code, sent in the `x-error-code` response header.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::DatabaseConnection(_) => "CONNECTION_FAILED",
            AppError::Authentication(_) => "AUTHENTICATION_REJECTED",
            AppError::DatabaseQuery(_) => "QUERY_FAILED",
            AppError::Timeout { .. } => "TIMEOUT",
            AppError::ExternalService(_) => "EXTERNAL_SERVICE_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::DatabaseConnection(_)
            | AppError::Authentication(_)
            | AppError::ExternalService(_) => StatusCode::BAD_GATEWAY,
            AppError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            AppError::Config(_) | AppError::DatabaseQuery(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Failed requests carry only a status and the error code header. The body
/// stays empty so a client never sees bytes the success path would not send.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!(code = self.code(), error = %self, "request failed");

        let mut response = self.status_code().into_response();
        response.headers_mut().insert(
            ERROR_CODE_HEADER.clone(),
            HeaderValue::from_static(self.code()),
        );
        response
    }
}
