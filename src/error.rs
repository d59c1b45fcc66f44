//! Error taxonomy shared across transports, bridges, and factories.

use std::time::Duration;

/// Errors surfaced by transports, protocol bridges, and client factories.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failed to establish a connection to a transport endpoint.
    #[error("connect error: {0}")]
    Connect(String),

    /// Connection-level failure after a transport was established.
    #[error("transport error: {0}")]
    Transport(String),

    /// A payload could not be decoded. Receive loops log and drop these.
    #[error("decode error: {0}")]
    Decode(String),

    /// An operation did not complete within its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The operation was cancelled, typically by a transport or supervisor
    /// shutting down. Expected during teardown.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Transport negotiation found no overlap between the transports a
    /// server's agent card declares and those the client config supports.
    #[error("no compatible transport: server offers {server:?}, client supports {client:?}")]
    NoCompatibleTransport {
        server: Vec<String>,
        client: Vec<String>,
    },

    /// The transport does not implement the requested operation.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// A user-supplied handler failed. Bridges convert this into a JSON-RPC
    /// error response rather than crashing the receive loop.
    #[error("handler error: {0}")]
    Handler(String),

    /// Invalid identity, topic, or transport configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl Error {
    /// Whether this error is an expected shutdown artifact that callers may
    /// silence.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
