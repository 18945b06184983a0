//! # RPC Event Model
//!
//! Purpose: Describe what a single streamed RPC can deliver to the caller.
//!
//! ## Design Principles
//! 1. **Ordered Stream**: Zero or more `Data` events, then exactly one of
//!    `End` or `Error`.
//! 2. **Verbatim Remote Errors**: Server-reported failures are carried as-is
//!    so callers can match on the server's error name.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error reported by the server (or the transport) as the terminal event of
/// an RPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Error class name as reported by the server, e.g. `BucketNotFoundError`.
    pub name: String,
    /// Human-readable message.
    pub message: String,
    /// Optional structured context attached by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl RemoteError {
    /// Creates a remote error without structured context.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        RemoteError {
            name: name.into(),
            message: message.into(),
            context: None,
        }
    }

    /// Returns true when the server reported the given error class.
    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for RemoteError {}

/// One event of a streamed RPC.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcEvent {
    /// A data record. The server may send `null` records, which carry nothing.
    Data(Value),
    /// Successful completion; no further records follow.
    End,
    /// Failed completion; no further records follow.
    Error(RemoteError),
}

impl RpcEvent {
    /// Returns true for `End` and `Error`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RpcEvent::Data(_))
    }
}
