use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Core error taxonomy. Every fallible operation in the orchestration core
/// returns one of these kinds; the HTTP layer maps them to status codes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bad input: {0}")]
    BadInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Video id already present in the content index. Not an error upstream;
    /// the scanner counts these.
    #[error("duplicate id: {0}")]
    Duplicate(String),

    #[error("content index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("malformed CSV: {0}")]
    MalformedCsv(String),

    #[error("materialize failed for block {block_id}: {reason}")]
    MaterializeFailed { block_id: String, reason: String },

    #[error("upstream feed error: {0}")]
    Upstream(String),

    #[error("upstream rejected credentials: {0}")]
    Credentials(String),

    #[error("transient: {0}")]
    Transient(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::BadInput(_) | Error::MalformedCsv(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) | Error::Duplicate(_) => StatusCode::CONFLICT,
            Error::InvariantViolation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Upstream(_) | Error::Credentials(_) => StatusCode::BAD_GATEWAY,
            Error::IndexUnavailable(_)
            | Error::MaterializeFailed { .. }
            | Error::Transient(_)
            | Error::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("request failed: {}", self);
        }
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Error::NotFound("row not found".to_string()),
            sqlx::Error::PoolClosed => Error::Fatal("database pool closed".to_string()),
            other => Error::Transient(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::BadInput("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(Error::NotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(Error::Conflict("x".into()).status_code(), StatusCode::CONFLICT);
        assert_eq!(
            Error::InvariantViolation("x".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            Error::MalformedCsv("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(Error::Upstream("x".into()).status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_sqlx_row_not_found_maps_to_not_found() {
        let err: Error = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
