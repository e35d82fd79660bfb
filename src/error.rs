//! Error kinds recognized at the signaling boundary.
//!
//! Engine failures are converted at the call site into one of these kinds;
//! the same enum serves the HTTP surface (status code + plain text body with
//! a recognizable prefix) and the WebSocket protocol (numeric error code in
//! the response envelope).

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum SignalingError {
    /// Operation illegal in the current lifecycle (join after joined,
    /// pipe mode with a single worker, stopped scheduler).
    #[error("InvalidState: {0}")]
    InvalidState(String),
    /// Capabilities rejection and similar negotiation failures.
    #[error("Unsupported: {0}")]
    Unsupported(String),
    /// Origin mismatch, missing or wrong throttle secret.
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("NotFound: {0}")]
    NotFound(String),
    /// Malformed request payload.
    #[error("TypeError: {0}")]
    TypeError(String),
    /// Any other engine failure.
    #[error("ServerError: {0}")]
    Server(String),
}

impl SignalingError {
    /// Convert an engine error into the catch-all server kind.
    pub fn engine<E: std::fmt::Display>(error: E) -> Self {
        Self::Server(error.to_string())
    }

    pub fn code(&self) -> u16 {
        match self {
            Self::InvalidState(_) | Self::Unsupported(_) => 409,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) => 404,
            Self::TypeError(_) => 400,
            Self::Server(_) => 500,
        }
    }
}

impl ResponseError for SignalingError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .content_type("text/plain; charset=utf-8")
            .body(self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_status_codes() {
        assert_eq!(SignalingError::InvalidState(String::new()).code(), 409);
        assert_eq!(SignalingError::Unsupported(String::new()).code(), 409);
        assert_eq!(SignalingError::Forbidden(String::new()).code(), 403);
        assert_eq!(SignalingError::NotFound(String::new()).code(), 404);
        assert_eq!(SignalingError::TypeError(String::new()).code(), 400);
        assert_eq!(SignalingError::Server(String::new()).code(), 500);
    }

    #[test]
    fn body_carries_recognizable_prefix() {
        let error = SignalingError::NotFound("peer \"alice\" not found".to_string());

        assert_eq!(error.to_string(), "NotFound: peer \"alice\" not found");
    }
}
