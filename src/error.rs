use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ts_rs::TS;
use utoipa::ToSchema;

use crate::response::ApiResponse;

/// FieldError
///
/// A single validation failure, reported back to the client inside the
/// envelope's `errors` array. `tag` names the rule that failed
/// (`required`, `duplicate`, `email`, `min`, `exists`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct FieldError {
    pub field: String,
    pub tag: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            tag: tag.into(),
        }
    }
}

/// AppError
///
/// The error taxonomy shared by every layer. Client-side failures
/// (`Validation`, `BadRequest`, `NotFound`, `Unauthorized`, `Forbidden`)
/// are surfaced verbatim; infrastructure failures (`Connection`,
/// `Transaction`, `NoTransaction`, `PanicRecovered`, `Internal`) are logged
/// and rendered as a generic internal error.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation failed")]
    Validation(Vec<FieldError>),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("no transaction provided")]
    NoTransaction,

    #[error("request cancelled")]
    Cancelled,

    #[error("panic recovered")]
    PanicRecovered,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            AppError::Connection(_)
            | AppError::Transaction(_)
            | AppError::NoTransaction
            | AppError::PanicRecovered
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message placed in the envelope. Server-side details never leak to the client.
    fn public_message(&self) -> String {
        match self {
            AppError::Validation(_) => "Invalid or malformed request body".to_string(),
            AppError::BadRequest(msg) => msg.clone(),
            AppError::NotFound(what) => format!("{} not found", what),
            AppError::Unauthorized => "Unauthorized".to_string(),
            AppError::Forbidden => "Forbidden".to_string(),
            AppError::Cancelled => "Request cancelled or timed out".to_string(),
            _ => "Internal Server Error".to_string(),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => AppError::NotFound("Record".to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                AppError::Connection(err.to_string())
            }
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                let field = constraint_column(&**db_err, "_key");
                AppError::Validation(vec![FieldError::new(field, "duplicate")])
            }
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                let field = constraint_column(&**db_err, "_fkey");
                AppError::Validation(vec![FieldError::new(field, "exists")])
            }
            _ => AppError::Internal(err.to_string()),
        }
    }
}

/// Recovers the column from a Postgres default constraint name
/// (`<table>_<column>_key`, `<table>_<column>_fkey`).
fn constraint_column(db_err: &dyn sqlx::error::DatabaseError, suffix: &str) -> String {
    let Some(stem) = db_err.constraint().and_then(|c| c.strip_suffix(suffix)) else {
        return "unknown".to_string();
    };
    match db_err.table().and_then(|t| stem.strip_prefix(t)) {
        Some(column) => column.trim_start_matches('_').to_string(),
        None => stem
            .rsplit_once('_')
            .map(|(_, column)| column.to_string())
            .unwrap_or_else(|| stem.to_string()),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let errors = match &self {
            AppError::Validation(fields) => serde_json::to_value(fields).ok(),
            _ => None,
        };

        let body = ApiResponse::<()>::failure(status, self.public_message(), errors);
        (status, Json(body)).into_response()
    }
}
