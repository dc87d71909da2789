//! Gateway error taxonomy and its mapping onto the HTTP boundary.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Error kinds recognised by the gateway core.
///
/// Only `ChannelNotFound`, `NoTunerAvailable` and a pre-header `Tuner` error
/// ever cross the HTTP boundary; everything else is recovered locally and at
/// most logged.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The requested virtual channel number is not in the channel collection.
    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    /// The arbiter exhausted its wait budget without a grantable tuner.
    #[error("no tuner available")]
    NoTunerAvailable,

    /// The demodulator failed to start.
    #[error("tuner error: {0}")]
    Tuner(String),

    /// The stall watchdog fired; the client never sees this as a status.
    #[error("stream stalled")]
    StreamStalled,

    /// EPIPE/ECONNRESET on the client-side pipe; a normal end of session.
    #[error("client pipe closed")]
    PipeBroken,

    /// A single section failed to parse; parsing continues.
    #[error("section parse error: {0}")]
    Parse(&'static str),

    /// A single frequency scan failed; the orchestrator continues.
    #[error("frequency scan failed: {0}")]
    Scan(String),
}

impl GatewayError {
    /// HTTP status for errors that surface before response headers are sent.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::ChannelNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::NoTunerAvailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}
