use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application error types
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid SQL: {0}")]
    InvalidSql(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable code used in error payloads
    pub fn code(&self) -> &'static str {
        match self {
            AppError::MalformedInput(_) => "MALFORMED_INPUT",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::BackendUnavailable(_) => "BACKEND_UNAVAILABLE",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::InvalidSql(_) => "INVALID_SQL",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotImplemented(_) => "NOT_IMPLEMENTED",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound(_))
    }
}

/// Error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.code();
        let (status, error_detail) = match self {
            AppError::MalformedInput(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorDetail::new(code, msg)
                    .with_details("The CSV header or body could not be parsed. No data was stored."),
            ),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, ErrorDetail::new(code, msg)),
            AppError::BackendUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, ErrorDetail::new(code, msg))
            }
            AppError::Database(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, ErrorDetail::new(code, msg))
            }
            AppError::InvalidSql(msg) => {
                let enhanced_msg = format!("{} Only single SELECT queries are allowed.", msg);
                (StatusCode::BAD_REQUEST, ErrorDetail::new(code, enhanced_msg))
            }
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, ErrorDetail::new(code, msg)),
            AppError::NotImplemented(msg) => {
                (StatusCode::NOT_IMPLEMENTED, ErrorDetail::new(code, msg))
            }
            AppError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, ErrorDetail::new(code, msg))
            }
        };

        let body = Json(ErrorResponse {
            error: error_detail,
        });

        (status, body).into_response()
    }
}

/// Convert anyhow::Error to AppError
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Convert rusqlite::Error to AppError
impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::Database(err.to_string())
    }
}
