//! Error types for the HTTP API.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use qhub::errors::HubError;
use serde::Serialize;

/// API error type that converts to HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// An error raised by the hub.
    #[error(transparent)]
    Hub(#[from] HubError),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl ApiError {
    /// HTTP status for the error.
    pub fn status(&self) -> StatusCode {
        let ApiError::Hub(e) = self;
        match e {
            HubError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            HubError::NotFound { .. } => StatusCode::NOT_FOUND,
            HubError::AlreadyScaffolded(_) | HubError::RunInProgress { .. } => StatusCode::CONFLICT,
            HubError::UnknownTemplate(_) | HubError::InvalidInput(_) | HubError::Configuration(_) => {
                StatusCode::BAD_REQUEST
            }
            HubError::Provisioning(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        let ApiError::Hub(e) = self;
        e.code()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "Request failed");
        }

        let body = Json(ErrorResponse {
            error: self.code().to_string(),
            message: self.to_string(),
        });

        (status, body).into_response()
    }
}
