//! # Transport Seam
//!
//! Purpose: Define what the pool needs from the streaming RPC transport,
//! without owning framing, serialization, or multiplexing.
//!
//! ## Design Principles
//! 1. **Strategy Pattern**: `Connector` opens channels, `RpcChannel` carries
//!    calls; both are trait objects so the pool stays transport-agnostic.
//! 2. **Ordered Events**: An `RpcHandle` yields its events in send order.
//! 3. **Tolerant Senders**: Sending to a handle nobody reads any more is a
//!    silent no-op, so late transport events never fail.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use dockv_common::{RemoteError, RpcEvent};

/// Opens RPC channels to a single address.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establishes a channel to `addr`. The caller bounds this with the
    /// connect timeout; an `io::ErrorKind::TimedOut` error is treated the
    /// same as the timer firing.
    async fn connect(&self, addr: SocketAddr) -> io::Result<Arc<dyn RpcChannel>>;
}

/// An established, multiplexed RPC channel.
#[async_trait]
pub trait RpcChannel: Send + Sync + 'static {
    /// Issues one RPC. `args` is the positional argument list, options last.
    fn invoke(&self, method: &str, args: Vec<Value>) -> RpcHandle;

    /// Resolves once the channel is gone, with the socket error if there
    /// was one.
    async fn closed(&self) -> Option<io::Error>;

    /// Starts closing the channel. Idempotent.
    fn close(&self);
}

/// Receiving side of one RPC.
#[derive(Debug)]
pub struct RpcHandle {
    rx: mpsc::UnboundedReceiver<RpcEvent>,
}

/// Sending side of one RPC, held by the transport.
#[derive(Debug, Clone)]
pub struct RpcSender {
    tx: mpsc::UnboundedSender<RpcEvent>,
}

impl RpcHandle {
    /// Creates a connected sender/handle pair.
    pub fn channel() -> (RpcSender, RpcHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RpcSender { tx }, RpcHandle { rx })
    }

    /// Waits for the next event. `None` means the transport dropped the
    /// request without (or after) its terminal event.
    pub async fn recv(&mut self) -> Option<RpcEvent> {
        self.rx.recv().await
    }
}

impl RpcSender {
    /// Sends an event; returns false if the handle is gone.
    pub fn send(&self, event: RpcEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn data(&self, record: Value) -> bool {
        self.send(RpcEvent::Data(record))
    }

    pub fn end(&self) -> bool {
        self.send(RpcEvent::End)
    }

    pub fn error(&self, err: RemoteError) -> bool {
        self.send(RpcEvent::Error(err))
    }
}
