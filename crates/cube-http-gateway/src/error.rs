//! Gateway error types.
//!
//! Every error maps to one HTTP status. Error responses carry only the
//! canonical reason phrase, never internal details.

use crate::auth::AuthError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use cube_node::CubeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Invalid gateway parameters.
    #[error("invalid gateway settings: {0}")]
    Settings(String),

    /// Bad token, or no identity while only authorized requests are served.
    #[error("unauthorized: {0}")]
    Unauthorized(#[from] AuthError),

    /// A routing table is configured and has no entry for this URI.
    #[error("no endpoint for {0}")]
    UnknownEndpoint(String),

    /// The node did not answer within the gateway timeout.
    #[error("upstream timeout")]
    Timeout,

    /// Any other bus-side failure.
    #[error("upstream error: {0}")]
    Upstream(CubeError),

    /// The reply could not be turned into an HTTP response.
    #[error("bad upstream reply: {0}")]
    BadReply(String),

    /// Request packing failure.
    #[error("cannot encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::UnknownEndpoint(_) => StatusCode::BAD_REQUEST,
            GatewayError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Settings(_)
            | GatewayError::Upstream(_)
            | GatewayError::BadReply(_)
            | GatewayError::Encode(_)
            | GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<CubeError> for GatewayError {
    fn from(e: CubeError) -> Self {
        if e.is_timeout() {
            GatewayError::Timeout
        } else {
            GatewayError::Upstream(e)
        }
    }
}

/// Plain-text response with the canonical reason phrase of `status`.
pub fn status_response(status: StatusCode) -> Response {
    (status, status.canonical_reason().unwrap_or_default()).into_response()
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        status_response(self.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(GatewayError::Timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            GatewayError::UnknownEndpoint("/x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::Unauthorized(AuthError::MissingIdentity).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::BadReply("status".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_cube_timeout_is_gateway_timeout() {
        let err: GatewayError = CubeError::Timeout.into();
        assert!(matches!(err, GatewayError::Timeout));

        let err: GatewayError = CubeError::PoolClosed.into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
