//! Error types for the control-plane RPC client.

use thiserror::Error;

/// Errors raised by [`super::client::ControlClient`] calls.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The control plane answered with a non-2xx status.
    #[error("control plane returned HTTP {status} for {endpoint}: {body}")]
    Http {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// The request never reached the control plane, or the connection died
    /// mid-flight (DNS, connect, TLS, reset, timeout).
    #[error("transport error calling {endpoint}: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    /// The response body did not parse as the expected JSON shape.
    #[error("malformed response body from {endpoint}: {source}")]
    MalformedResponse {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ApiError {
    /// Whether this failure should trigger re-registration (token rotation
    /// or a lost instance record on the server side).
    #[must_use]
    pub fn requires_reregistration(&self) -> bool {
        matches!(self, ApiError::Http { status, .. } if *status == 401 || *status == 403)
    }
}
