use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

/// User-visible failures are limited to bad input (400) and dispatch-layer
/// faults (500); everything asynchronous surfaces through the job and
/// failure tables instead.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing theme")]
    MissingTheme,
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::MissingTheme => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = json!({
            "ok": false,
            "error": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}

impl From<storyloom_core::Error> for ApiError {
    fn from(error: storyloom_core::Error) -> Self {
        ApiError::Internal(error.to_string())
    }
}
