//! Relay Errors

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use vc_common::ErrorResponse;

/// Errors returned by relay handlers.
#[derive(Debug, Error)]
pub enum RelayServerError {
    /// A required field was missing or empty.
    #[error("{0} required")]
    MissingField(&'static str),

    /// The request body was not a valid relay request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The action is not known for this method.
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    /// Peer id is already registered in another channel.
    #[error("Peer already joined: {0}")]
    AlreadyJoined(String),
}

impl IntoResponse for RelayServerError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Self::MissingField(_) => (StatusCode::BAD_REQUEST, "MISSING_FIELD"),
            Self::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            Self::UnknownAction(_) => (StatusCode::BAD_REQUEST, "UNKNOWN_ACTION"),
            Self::AlreadyJoined(_) => (StatusCode::CONFLICT, "ALREADY_JOINED"),
        };

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: Some(code.to_string()),
        });

        (status, body).into_response()
    }
}
