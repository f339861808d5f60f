//! Maps operation errors onto HTTP responses with a `Status` body.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{ApiError, StoreError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub kind: String,
    pub status: String,
    pub message: String,
    pub reason: String,
    pub code: u16,
}

impl Status {
    pub fn failure(code: StatusCode, reason: &str, message: impl Into<String>) -> Self {
        Self {
            kind: "Status".to_string(),
            status: "Failure".to_string(),
            message: message.into(),
            reason: reason.to_string(),
            code: code.as_u16(),
        }
    }
}

fn status_code(err: &ApiError) -> (StatusCode, &'static str) {
    match err {
        ApiError::NoContent(_) => (StatusCode::NO_CONTENT, ""),
        ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BadRequest"),
        ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
        ApiError::Conflict(_) => (StatusCode::CONFLICT, "Conflict"),
        ApiError::Invalid(_) => (StatusCode::UNPROCESSABLE_ENTITY, "Invalid"),
        ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
        ApiError::Store(StoreError::Unavailable(_)) => (StatusCode::SERVICE_UNAVAILABLE, "ServiceUnavailable"),
        ApiError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, reason) = status_code(&self);
        if code == StatusCode::NO_CONTENT {
            return code.into_response();
        }
        if code.is_server_error() {
            error!(error = %self, "request failed");
        }
        let message = match &self {
            ApiError::BadRequest(message)
            | ApiError::NotFound(message)
            | ApiError::Conflict(message)
            | ApiError::Invalid(message)
            | ApiError::Internal(message)
            | ApiError::NoContent(message) => message.clone(),
            ApiError::Store(err) => err.to_string(),
        };
        (code, Json(Status::failure(code, reason, message))).into_response()
    }
}
