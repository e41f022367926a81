//! Dispatch server error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Failure of one dispatch request. Rendered as a status code and plain-text
/// body; stage details go to the log, not the client.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Error loading request: {0}")]
    Load(String),

    #[error("Error processing request: {0}")]
    Process(String),

    #[error("Error saving request: {0}")]
    Save(String),

    #[error("Pipeline unavailable")]
    Unavailable,
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            DispatchError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            DispatchError::Load(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error loading request".to_string(),
            ),
            DispatchError::Process(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error processing request".to_string(),
            ),
            DispatchError::Save(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error saving request".to_string(),
            ),
            DispatchError::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Pipeline unavailable".to_string(),
            ),
        };
        (status, body).into_response()
    }
}
