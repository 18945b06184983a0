//! # Connection Lifecycle
//!
//! Purpose: Own one outbound channel to a single host, from the first
//! connect attempt until it is closed for good.
//!
//! ## Design Principles
//! 1. **State Machine**: `Connecting -> Ready -> Closing -> Closed`, with
//!    `Connecting -> Connecting` on each failed attempt.
//! 2. **One Task per Connection**: The lifecycle runs on its own tokio task
//!    and reports to the pool over a channel instead of callbacks.
//! 3. **No Self-Reconnect**: A ready connection that fails goes straight to
//!    `Closed`; the pool decides whether to replace it.
//!
//! ## State Diagram
//!
//! ```text
//!   spawn
//!     │
//!     ▼        failure (budget left): sleep(backoff)
//! Connecting ◄──────────┐
//!     │  └──────────────┘
//!     │ success              failure (budget spent) ──► Closed (Failed)
//!     ▼
//!   Ready ── socket error/EOF ──► Closed (Lost)
//!     │
//!     │ close()
//!     ▼
//!  Closing ── channel confirmed closed ──► Closed (Closed)
//! ```

use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::RetryPolicy;
use crate::error::ClientError;
use crate::host::Host;
use crate::retry::Backoff;
use crate::transport::{Connector, RpcChannel};

/// Pool-unique connection identifier. Never reused, so late events from a
/// removed connection cannot be confused with its replacement.
pub(crate) type ConnectionId = u64;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Ready,
    Closing,
    Closed,
}

/// Notification from a connection task to its pool.
pub(crate) enum ConnectionEvent {
    /// Handshake succeeded; the channel may now carry calls.
    Ready {
        id: ConnectionId,
        channel: Arc<dyn RpcChannel>,
    },
    /// Connect retries exhausted before ever becoming ready.
    Failed { id: ConnectionId, error: ClientError },
    /// A ready channel failed.
    Lost { id: ConnectionId, error: ClientError },
    /// Closed on request.
    Closed { id: ConnectionId },
}

/// Settings shared by every connection of a pool.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionSettings {
    pub(crate) connect_timeout: Duration,
    pub(crate) retry: RetryPolicy,
}

#[derive(Debug)]
struct Status {
    state: ConnectionState,
    retry_attempt: u32,
    last_error: Option<String>,
}

/// Handle to a running connection task, exclusively owned by the pool.
pub(crate) struct Connection {
    id: ConnectionId,
    host: Host,
    status: Arc<Mutex<Status>>,
    shutdown: watch::Sender<bool>,
}

impl Connection {
    /// Spawns the lifecycle task. The first connect attempt starts after
    /// `delay`, which is zero for a host that has not flapped.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn(
        id: ConnectionId,
        host: Host,
        delay: Duration,
        settings: &ConnectionSettings,
        connector: Arc<dyn Connector>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let status = Arc::new(Mutex::new(Status {
            state: ConnectionState::Connecting,
            retry_attempt: 0,
            last_error: None,
        }));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = ConnectionTask {
            id,
            host,
            delay,
            settings: settings.clone(),
            connector,
            events,
            status: status.clone(),
            shutdown: shutdown_rx,
        };
        let span = info_span!("connection", id, host = %host);
        tokio::spawn(task.run().instrument(span));

        Connection {
            id,
            host,
            status,
            shutdown,
        }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn host(&self) -> Host {
        self.host
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.status.lock().state
    }

    /// Failed connect attempts since the last success.
    pub(crate) fn retry_attempt(&self) -> u32 {
        self.status.lock().retry_attempt
    }

    pub(crate) fn last_error(&self) -> Option<String> {
        self.status.lock().last_error.clone()
    }

    /// Closes the connection from any state. Idempotent.
    ///
    /// A connection still connecting is closed immediately; a ready one
    /// moves to `Closing` until the channel confirms.
    pub(crate) fn close(&self) {
        {
            let mut status = self.status.lock();
            match status.state {
                ConnectionState::Connecting => status.state = ConnectionState::Closed,
                ConnectionState::Ready => status.state = ConnectionState::Closing,
                ConnectionState::Closing | ConnectionState::Closed => {}
            }
        }
        self.shutdown.send_replace(true);
    }
}

struct ConnectionTask {
    id: ConnectionId,
    host: Host,
    delay: Duration,
    settings: ConnectionSettings,
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    status: Arc<Mutex<Status>>,
    shutdown: watch::Receiver<bool>,
}

impl ConnectionTask {
    async fn run(mut self) {
        let addr = self.host.socket_addr();
        let connect_timeout = self.settings.connect_timeout;
        let mut backoff = Backoff::new(self.settings.retry.clone());

        if !self.delay.is_zero() {
            debug!(delay_ms = self.delay.as_millis() as u64, "delaying reconnect");
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => {
                    self.finish_closed();
                    return;
                }
                _ = time::sleep(self.delay) => {}
            }
        }

        let channel = loop {
            if *self.shutdown.borrow() {
                self.finish_closed();
                return;
            }

            debug!(attempt = backoff.attempt() + 1, "connecting");
            let attempt = tokio::select! {
                biased;
                _ = self.shutdown.changed() => {
                    self.finish_closed();
                    return;
                }
                result = time::timeout(connect_timeout, self.connector.connect(addr)) => result,
            };

            let error = match attempt {
                Ok(Ok(channel)) => break channel,
                Ok(Err(err)) if err.kind() == io::ErrorKind::TimedOut => ClientError::ConnectTimeout {
                    addr,
                    timeout: connect_timeout,
                },
                Ok(Err(source)) => ClientError::ConnectRefused { addr, source },
                Err(_) => ClientError::ConnectTimeout {
                    addr,
                    timeout: connect_timeout,
                },
            };

            let delay = backoff.next_delay();
            {
                let mut status = self.status.lock();
                status.retry_attempt = backoff.attempt();
                status.last_error = Some(error.to_string());
            }

            let Some(delay) = delay else {
                let exhausted = ClientError::RetryExhausted {
                    addr,
                    attempts: backoff.attempt(),
                    last_error: error.to_string(),
                };
                error!(error = %exhausted, "connect retries exhausted");
                self.status.lock().state = ConnectionState::Closed;
                let _ = self.events.send(ConnectionEvent::Failed {
                    id: self.id,
                    error: exhausted,
                });
                return;
            };

            warn!(
                error = %error,
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "connect failed, retrying"
            );
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => {
                    self.finish_closed();
                    return;
                }
                _ = time::sleep(delay) => {}
            }
        };

        backoff.reset();
        if !self.mark_ready() {
            channel.close();
            self.finish_closed();
            return;
        }
        info!("connected");

        let ready = ConnectionEvent::Ready {
            id: self.id,
            channel: channel.clone(),
        };
        if self.events.send(ready).is_err() {
            // Pool is gone.
            channel.close();
            return;
        }

        tokio::select! {
            biased;
            _ = self.shutdown.changed() => {
                self.status.lock().state = ConnectionState::Closing;
                channel.close();
                if time::timeout(connect_timeout, channel.closed()).await.is_err() {
                    debug!("channel did not confirm close in time");
                }
                self.finish_closed();
            }
            reason = channel.closed() => {
                let reason = match reason {
                    Some(err) => format!("{}: {}", addr, err),
                    None => format!("{}: closed by peer", addr),
                };
                let error = ClientError::ConnectionLost { reason };
                warn!(error = %error, "connection lost");
                {
                    let mut status = self.status.lock();
                    status.state = ConnectionState::Closed;
                    status.last_error = Some(error.to_string());
                }
                let _ = self.events.send(ConnectionEvent::Lost { id: self.id, error });
            }
        }
    }

    /// Moves `Connecting -> Ready`. Returns false if `close` won the race.
    fn mark_ready(&self) -> bool {
        let mut status = self.status.lock();
        if status.state != ConnectionState::Connecting {
            return false;
        }
        status.state = ConnectionState::Ready;
        status.retry_attempt = 0;
        true
    }

    fn finish_closed(&self) {
        self.status.lock().state = ConnectionState::Closed;
        debug!("closed");
        let _ = self.events.send(ConnectionEvent::Closed { id: self.id });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, SocketAddr};
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use serde_json::Value;

    use crate::transport::RpcHandle;

    struct TestChannel {
        dead: watch::Sender<bool>,
    }

    impl TestChannel {
        fn new() -> Arc<Self> {
            Arc::new(TestChannel {
                dead: watch::channel(false).0,
            })
        }
    }

    #[async_trait]
    impl RpcChannel for TestChannel {
        fn invoke(&self, _method: &str, _args: Vec<Value>) -> RpcHandle {
            RpcHandle::channel().1
        }

        async fn closed(&self) -> Option<io::Error> {
            let mut rx = self.dead.subscribe();
            let _ = rx.wait_for(|dead| *dead).await;
            Some(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
        }

        fn close(&self) {
            self.dead.send_replace(true);
        }
    }

    /// Refuses the first `failures` attempts, then hands out `channel`.
    struct FlakyConnector {
        failures: u32,
        attempts: AtomicU32,
        channel: Arc<TestChannel>,
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        async fn connect(&self, _addr: SocketAddr) -> io::Result<Arc<dyn RpcChannel>> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            Ok(self.channel.clone())
        }
    }

    fn settings(retries: Option<u32>) -> ConnectionSettings {
        ConnectionSettings {
            connect_timeout: Duration::from_millis(200),
            retry: RetryPolicy {
                retries,
                min_timeout: Duration::from_millis(5),
                max_timeout: Duration::from_millis(20),
                factor: 2.0,
                jitter: 0.0,
            },
        }
    }

    fn host() -> Host {
        Host::new(IpAddr::from([127, 0, 0, 1]), 2020)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
        time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event in time")
            .expect("event")
    }

    #[tokio::test]
    async fn retries_until_ready_and_resets_attempts() {
        let channel = TestChannel::new();
        let connector = Arc::new(FlakyConnector {
            failures: 3,
            attempts: AtomicU32::new(0),
            channel: channel.clone(),
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Connection::spawn(
            1,
            host(),
            Duration::ZERO,
            &settings(None),
            connector.clone(),
            tx,
        );

        match next_event(&mut rx).await {
            ConnectionEvent::Ready { id, .. } => assert_eq!(id, 1),
            _ => panic!("expected ready"),
        }
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(conn.retry_attempt(), 0);
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 4);
        assert!(conn.last_error().is_some());
    }

    #[tokio::test]
    async fn exhausted_budget_reports_failure() {
        let connector = Arc::new(FlakyConnector {
            failures: u32::MAX,
            attempts: AtomicU32::new(0),
            channel: TestChannel::new(),
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Connection::spawn(
            7,
            host(),
            Duration::ZERO,
            &settings(Some(2)),
            connector.clone(),
            tx,
        );

        match next_event(&mut rx).await {
            ConnectionEvent::Failed { id, error } => {
                assert_eq!(id, 7);
                assert!(matches!(error, ClientError::RetryExhausted { attempts: 3, .. }));
            }
            _ => panic!("expected failure"),
        }
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn ready_failure_closes_without_reconnecting() {
        let channel = TestChannel::new();
        let connector = Arc::new(FlakyConnector {
            failures: 0,
            attempts: AtomicU32::new(0),
            channel: channel.clone(),
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Connection::spawn(
            2,
            host(),
            Duration::ZERO,
            &settings(None),
            connector.clone(),
            tx,
        );
        assert!(matches!(next_event(&mut rx).await, ConnectionEvent::Ready { .. }));

        channel.close();
        match next_event(&mut rx).await {
            ConnectionEvent::Lost { error, .. } => {
                assert!(matches!(error, ClientError::ConnectionLost { .. }))
            }
            _ => panic!("expected lost"),
        }
        assert_eq!(conn.state(), ConnectionState::Closed);

        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_while_connecting_is_immediate_and_idempotent() {
        let connector = Arc::new(FlakyConnector {
            failures: u32::MAX,
            attempts: AtomicU32::new(0),
            channel: TestChannel::new(),
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Connection::spawn(
            3,
            host(),
            Duration::ZERO,
            &settings(None),
            connector,
            tx,
        );

        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
        conn.close();
        assert!(matches!(
            next_event(&mut rx).await,
            ConnectionEvent::Closed { id: 3 }
        ));
    }

    #[tokio::test]
    async fn close_when_ready_closes_channel() {
        let channel = TestChannel::new();
        let connector = Arc::new(FlakyConnector {
            failures: 0,
            attempts: AtomicU32::new(0),
            channel: channel.clone(),
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Connection::spawn(
            4,
            host(),
            Duration::ZERO,
            &settings(None),
            connector,
            tx,
        );
        assert!(matches!(next_event(&mut rx).await, ConnectionEvent::Ready { .. }));

        conn.close();
        assert!(matches!(
            next_event(&mut rx).await,
            ConnectionEvent::Closed { id: 4 }
        ));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(*channel.dead.borrow());
    }

    #[tokio::test]
    async fn start_delay_defers_first_attempt() {
        let connector = Arc::new(FlakyConnector {
            failures: 0,
            attempts: AtomicU32::new(0),
            channel: TestChannel::new(),
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Connection::spawn(
            5,
            host(),
            Duration::from_millis(200),
            &settings(None),
            connector.clone(),
            tx,
        );

        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 0);
        assert_eq!(conn.state(), ConnectionState::Connecting);

        conn.close();
        assert!(matches!(
            next_event(&mut rx).await,
            ConnectionEvent::Closed { id: 5 }
        ));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 0);
    }
}
