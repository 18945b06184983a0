//! # Client Errors
//!
//! One error type for everything the client can surface. Connectivity
//! failures are retryable by the caller; remote and argument errors are not.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use dockv_common::{RemoteError, ValidationError};

/// Result type for the client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the client, its pool, and discovery.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// No ready connection at dispatch time.
    #[error("no active connections")]
    NoConnections,

    /// A connect attempt did not finish within the connect timeout.
    #[error("connect to {addr} timed out after {}ms", .timeout.as_millis())]
    ConnectTimeout { addr: SocketAddr, timeout: Duration },

    /// A connect attempt was rejected.
    #[error("connect to {addr} failed: {source}")]
    ConnectRefused {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Connect retries ran out; the connection is closed for good.
    #[error("gave up connecting to {addr} after {attempts} attempts: {last_error}")]
    RetryExhausted {
        addr: SocketAddr,
        attempts: u32,
        last_error: String,
    },

    /// An established connection went away, or a request stream ended
    /// without a terminal event.
    #[error("connection lost: {reason}")]
    ConnectionLost { reason: String },

    /// The caller's timeout elapsed before the RPC finished. The request is
    /// not aborted server-side.
    #[error("{method}: timeout after {}ms", .timeout.as_millis())]
    CallTimeout { method: String, timeout: Duration },

    /// Terminal error from the server, passed through verbatim.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// DNS resolution failed. Logged by discovery, never returned from a call.
    #[error("DNS lookup of {domain} failed: {message}")]
    Discovery { domain: String, message: String },

    /// Caller passed an argument the client rejects before dispatch.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Client configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Building an RPC payload failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The client has been closed.
    #[error("client is closed")]
    Closed,
}

impl ClientError {
    /// Returns true for connectivity failures a caller may retry.
    ///
    /// The client itself never retries an operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::NoConnections
                | ClientError::ConnectTimeout { .. }
                | ClientError::ConnectRefused { .. }
                | ClientError::ConnectionLost { .. }
        )
    }

    /// Returns the server's error name for remote errors.
    pub fn remote_name(&self) -> Option<&str> {
        match self {
            ClientError::Remote(err) => Some(&err.name),
            _ => None,
        }
    }
}

impl From<ValidationError> for ClientError {
    fn from(err: ValidationError) -> Self {
        ClientError::InvalidArgument(err.to_string())
    }
}
