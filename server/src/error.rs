//! Errors surfaced to the HTTP caller when a tunneled request cannot be
//! completed. Display strings are the caller-visible messages; `code()`
//! gives the stable machine-readable form for the JSON envelope.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("No connected clients available")]
    NoClients,

    #[error("Client '{0}' not found")]
    ClientNotFound(String),

    #[error("Client disconnected")]
    Disconnected,

    #[error("Request timeout")]
    Timeout,

    #[error("Failed to send request to client: {0}")]
    SendFailed(String),

    /// The agent answered with an `error` frame.
    #[error("{0}")]
    Agent(String),

    /// The agent's `response` frame did not parse as a response payload.
    #[error("Invalid response from client: {0}")]
    BadResponse(String),
}

impl ProxyError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoClients => "NO_CLIENTS_AVAILABLE",
            Self::ClientNotFound(_) => "CLIENT_NOT_FOUND",
            Self::Disconnected => "CLIENT_DISCONNECTED",
            Self::Timeout => "REQUEST_TIMEOUT",
            Self::SendFailed(_) => "SEND_FAILED",
            Self::Agent(_) => "UPSTREAM_ERROR",
            Self::BadResponse(_) => "BAD_RESPONSE",
        }
    }
}
