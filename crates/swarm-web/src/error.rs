use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::store::QueryError;

#[derive(Debug, thiserror::Error)]
pub enum WebError {
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("internal error: {message}")]
    Internal { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            WebError::Io { source } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "io_error",
                source.to_string(),
            ),
            WebError::Query(err) => (StatusCode::INTERNAL_SERVER_ERROR, "store_error", err.0),
            WebError::Internal { message } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
            }
        };

        let body = ErrorBody {
            code: code.to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}
