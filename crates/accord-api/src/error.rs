use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::{error, warn};

use accord_core::Error;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

/// Engine failures rendered as HTTP responses.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Unauthorized(_) => StatusCode::FORBIDDEN,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Transient(_) | Error::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::InvariantViolation(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self.0 {
            Error::InvariantViolation(_) | Error::Internal(_) => {
                error!("Request failed: {:#}", self.0);
                "internal error".to_string()
            }
            Error::Transient(_) | Error::Unavailable(_) => {
                warn!("Request degraded: {}", self.0);
                self.0.to_string()
            }
            other => other.to_string(),
        };

        (
            status,
            Json(ErrorBody {
                error: self.0.code(),
                message,
            }),
        )
            .into_response()
    }
}
