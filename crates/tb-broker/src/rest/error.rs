//! Error responses
//!
//! Every failure is a JSON body `{"kind": ..., "message": ...}` where
//! `kind` is the stable machine-readable error kind.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use tb_core::{BrokerError, ErrorKind};

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

/// Error returned by a handler
#[derive(Debug)]
pub enum ApiError {
    /// A core operation failed
    Broker(BrokerError),
    /// Missing or unknown bearer token
    Unauthenticated(String),
}

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        ApiError::Broker(err)
    }
}

pub fn status_of(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Unauthorized => StatusCode::FORBIDDEN,
        ErrorKind::Busy | ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::NotEnabled => StatusCode::PRECONDITION_FAILED,
        ErrorKind::DriverFailure => StatusCode::BAD_GATEWAY,
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::InvariantViolation => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Broker(err) => {
                let kind = err.kind();
                if kind == ErrorKind::InvariantViolation {
                    tracing::error!("Request aborted: {}", err);
                } else {
                    tracing::debug!("Request failed: {}", err);
                }
                (
                    status_of(kind),
                    ErrorBody {
                        kind,
                        message: err.to_string(),
                    },
                )
            }
            ApiError::Unauthenticated(message) => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    kind: ErrorKind::Unauthorized,
                    message,
                },
            ),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
