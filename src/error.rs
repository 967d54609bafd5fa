use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::subscribers::RecipientId;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Webhook signature validation failed")]
    ValidationFailed,

    #[error("Unrecognised webhook payload: {0}")]
    ParseFailed(String),

    #[error("Failed to send to {recipient}: {reason}")]
    SendFailed { recipient: RecipientId, reason: String },
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = match self {
            RelayError::ValidationFailed => StatusCode::FORBIDDEN,
            RelayError::ParseFailed(_) => StatusCode::BAD_REQUEST,
            RelayError::SendFailed { .. } => StatusCode::BAD_GATEWAY,
        };
        (status, self.to_string()).into_response()
    }
}
