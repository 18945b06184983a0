// dockv-common - Shared types and protocol definitions for DocKV
//
// This crate defines the vocabulary spoken between a DocKV client and the
// server: RPC method names, the per-call options envelope, the event model of
// a streamed RPC, and the bucket/batch payload types.

pub mod error;
pub mod event;
pub mod options;
pub mod protocol;
pub mod types;

// Re-export for convenience
pub use error::*;
pub use event::*;
pub use options::*;
pub use protocol::*;
pub use types::*;
