//! # DocKV Client
//!
//! Purpose: Async client for the DocKV document store. Keeps a pool of RPC
//! connections in step with DNS, spreads calls across them round-robin and
//! gives every call the same completion contract.
//!
//! ## Design Principles
//! 1. **Fail Fast**: No ready connection means an immediate `NoConnections`
//!    error; the client never queues calls.
//! 2. **Pluggable Edges**: The streaming transport (`Connector`,
//!    `RpcChannel`) and DNS (`Resolve`) are traits; the client owns only
//!    pooling, discovery and dispatch.
//! 3. **Task per Concern**: Each connection, the pool supervisor and the
//!    discovery loop run as their own tokio task and talk over channels.
//! 4. **At-Most-Once Outcomes**: Timed calls resolve exactly once even when
//!    the server answers after the caller gave up.

mod buckets;
mod client;
mod config;
mod connection;
mod discovery;
mod dispatch;
mod error;
mod host;
mod objects;
mod pool;
mod retry;
mod transport;

pub use client::{Client, ClientEvent, HealthOptions};
pub use config::{ClientConfig, DnsConfig, RetryPolicy};
pub use connection::ConnectionState;
pub use discovery::{DiscoveryLoop, HickoryResolver, Resolve, Target};
pub use dispatch::{parse_version, Dispatcher, RecordStream, RequestContext, Settle, StreamEvent};
pub use error::{ClientError, ClientResult};
pub use host::{Host, HostDelta, HostSet};
pub use pool::{ConnectionInfo, ConnectionPool, PoolConfig, PoolEvent, PooledChannel};
pub use transport::{Connector, RpcChannel, RpcHandle, RpcSender};

pub use dockv_common::{
    BatchOperation, BatchRequest, BucketConfig, RemoteError, RequestOptions, RpcEvent,
};
