use std::panic::Location;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

/// The error taxonomy of the service. `Transient` is the only variant the
/// core itself retries; everything else propagates to the caller unchanged.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("datarange overlap: {0}")]
    DatarangeOverlap(String),

    #[error("not fully covered: {0}")]
    NotFullyCovered(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("upload failed: {0}")]
    UploadFailed(String),

    #[error("transient error: {0}")]
    Transient(#[source] anyhow::Error),

    #[error("fatal error: {0}")]
    Fatal(anyhow::Error),
}

impl Error {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Conflict(msg.into())
    }

    /// Whether this error class is worth a bounded retry (S3 5xx / network
    /// blips during worker operations). Everything else is surfaced as-is.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Error::NotFound(err.to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => Error::Conflict(err.to_string()),
            _ => Error::Fatal(err.into()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Error::Fatal(err.into())
    }
}

#[track_caller]
pub(crate) fn log(source: &dyn std::error::Error) {
    let location = Location::caller();
    let span_trace = tracing_error::SpanTrace::capture();

    error!(
        target: "datas3t",
        %location,
        error = %source,
        "span trace:\n{span_trace}"
    );
}

/// Logs the error at the call site and converts it with `From`, so
/// nothing gets silently eaten.
macro_rules! try_ {
    ($result:expr) => {
        match $result {
            Ok(val) => val,
            Err(err) => {
                crate::error::log(&err);
                return Err(err.into());
            }
        }
    };
}

pub(crate) use try_;

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        log(&self);
        let status = match &self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::DatarangeOverlap(_) => StatusCode::BAD_REQUEST,
            Error::NotFullyCovered(_) => StatusCode::BAD_REQUEST,
            Error::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            Error::UploadFailed(_) => StatusCode::BAD_GATEWAY,
            Error::Transient(_) => StatusCode::BAD_GATEWAY,
            Error::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
