//! # Connection Pool
//!
//! Purpose: Keep one live channel per backend host and hand them out
//! round-robin, reconciling against the host list discovery reports.
//!
//! ## Design Principles
//! 1. **Fail Fast**: `next()` never blocks or queues; an empty ready set is
//!    reported immediately and retry policy stays with the caller.
//! 2. **Single Lock**: One mutex covers the host set, the connections and the
//!    cursor, so selection never observes a half-applied host change.
//! 3. **Event Driven**: Connection tasks report over a channel to one
//!    supervisor task; callers observe the pool through broadcast events.
//! 4. **Bounded**: At most `max_connections` connections exist at once,
//!    counting those still closing; other hosts wait as pending until a
//!    slot frees.
//! 5. **Backoff on Flap**: A host whose ready connection drops is
//!    reconnected on its own backoff schedule, which survives replacements
//!    and restarts only after a connection stays ready past the retry
//!    ceiling.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, RetryPolicy};
use crate::connection::{
    Connection, ConnectionEvent, ConnectionId, ConnectionSettings, ConnectionState,
};
use crate::error::ClientError;
use crate::host::{Host, HostSet};
use crate::retry::Backoff;
use crate::transport::{Connector, RpcChannel, RpcHandle};

const EVENT_CAPACITY: usize = 64;

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections open at once, closing ones included.
    pub max_connections: usize,
    /// Bound on each connect attempt.
    pub connect_timeout: Duration,
    /// Connect-phase retry policy for every connection.
    pub retry: RetryPolicy,
}

impl From<&ClientConfig> for PoolConfig {
    fn from(config: &ClientConfig) -> Self {
        PoolConfig {
            max_connections: config.max_connections,
            connect_timeout: config.connect_timeout,
            retry: config.retry.clone(),
        }
    }
}

/// Pool-level notifications.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// The first connection became ready. Fires once per pool.
    Online,
    /// A connection failed fatally. Informational only.
    Error(Arc<ClientError>),
    /// Every connection closed after `close()`. Fires once.
    Close,
}

/// Snapshot of one pooled connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub host: Host,
    pub state: ConnectionState,
    pub retry_attempt: u32,
    pub last_error: Option<String>,
}

/// A ready channel borrowed for a single dispatch.
#[derive(Clone)]
pub struct PooledChannel {
    id: ConnectionId,
    host: Host,
    channel: Arc<dyn RpcChannel>,
    since: Instant,
}

impl PooledChannel {
    pub fn host(&self) -> Host {
        self.host
    }

    pub fn invoke(&self, method: &str, args: Vec<serde_json::Value>) -> RpcHandle {
        self.channel.invoke(method, args)
    }

    /// Resolves once the underlying channel is gone.
    pub(crate) async fn closed(&self) -> Option<io::Error> {
        self.channel.closed().await
    }
}

impl fmt::Debug for PooledChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledChannel")
            .field("id", &self.id)
            .field("host", &self.host)
            .finish()
    }
}

/// Reconnect schedule for a host that has lost a ready connection.
struct Reconnect {
    backoff: Backoff,
    delay: Duration,
}

struct PoolState {
    hosts: HostSet,
    /// Every live connection task, including ones still closing.
    entries: Vec<Connection>,
    ready: Vec<PooledChannel>,
    reconnect: HashMap<IpAddr, Reconnect>,
    cursor: usize,
    next_id: ConnectionId,
    announced_online: bool,
    closing: bool,
    close_emitted: bool,
}

impl PoolState {
    /// Drops the connection with `id` from both lists, returning its host
    /// and when it became ready, if it ever did.
    fn remove_entry(&mut self, id: ConnectionId) -> Option<(Host, Option<Instant>)> {
        let since = self.ready.iter().find(|ch| ch.id == id).map(|ch| ch.since);
        self.ready.retain(|ch| ch.id != id);
        let pos = self.entries.iter().position(|c| c.id() == id)?;
        Some((self.entries.swap_remove(pos).host(), since))
    }

    /// Takes the connection to `host` out of rotation and starts closing it.
    /// The entry stays until the task reports `Closed`.
    fn retire(&mut self, host: &Host) {
        self.reconnect.remove(&host.address);
        let Some(conn) = self
            .entries
            .iter()
            .find(|c| c.host().address == host.address)
        else {
            return;
        };
        let id = conn.id();
        conn.close();
        self.ready.retain(|ch| ch.id != id);
    }
}

struct PoolInner {
    settings: ConnectionSettings,
    max_connections: usize,
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    notify: broadcast::Sender<PoolEvent>,
    online: watch::Sender<bool>,
    closed: watch::Sender<bool>,
}

/// Connection pool handle.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates an empty pool. Must be called from within a tokio runtime.
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notify, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(PoolInner {
            settings: ConnectionSettings {
                connect_timeout: config.connect_timeout,
                retry: config.retry,
            },
            max_connections: config.max_connections.max(1),
            connector,
            state: Mutex::new(PoolState {
                hosts: HostSet::new(),
                entries: Vec::new(),
                ready: Vec::new(),
                reconnect: HashMap::new(),
                cursor: 0,
                next_id: 1,
                announced_online: false,
                closing: false,
                close_emitted: false,
            }),
            events_tx,
            notify,
            online: watch::channel(false).0,
            closed: watch::channel(false).0,
        });
        tokio::spawn(supervise(Arc::downgrade(&inner), events_rx));
        ConnectionPool { inner }
    }

    /// Adds a host and starts connecting to it. No-op if already present.
    pub fn add_host(&self, host: Host) {
        let mut state = self.inner.state.lock();
        if state.closing || !state.hosts.insert(host) {
            return;
        }
        debug!(host = %host, "host added");
        self.inner.fill_slots(&mut state);
    }

    /// Reconciles the pool against `hosts`.
    ///
    /// Connections to removed hosts leave the rotation before this returns,
    /// so `next()` never hands them out again. They keep their slot until
    /// the close completes.
    pub fn set_hosts(&self, hosts: &[Host]) {
        let mut state = self.inner.state.lock();
        if state.closing {
            return;
        }

        let delta = state.hosts.diff(hosts);
        if delta.is_empty() {
            return;
        }

        for host in &delta.removed {
            state.retire(host);
        }
        state.hosts.replace(hosts);
        self.inner.fill_slots(&mut state);
        self.inner.online.send_replace(!state.ready.is_empty());

        info!(
            added = delta.added.len(),
            removed = delta.removed.len(),
            total = state.hosts.len(),
            "host set updated"
        );
    }

    /// Next ready channel in round-robin order, or `None` if nothing is
    /// ready or the pool is closing.
    pub fn next(&self) -> Option<PooledChannel> {
        let mut state = self.inner.state.lock();
        if state.closing || state.ready.is_empty() {
            return None;
        }
        let idx = state.cursor % state.ready.len();
        state.cursor = (idx + 1) % state.ready.len();
        Some(state.ready[idx].clone())
    }

    /// True while at least one connection is ready.
    pub fn connected(&self) -> bool {
        self.ready_count() > 0
    }

    pub fn ready_count(&self) -> usize {
        let state = self.inner.state.lock();
        if state.closing {
            0
        } else {
            state.ready.len()
        }
    }

    /// Hosts the pool currently wants, including pending ones.
    pub fn hosts(&self) -> Vec<Host> {
        self.inner.state.lock().hosts.iter().copied().collect()
    }

    /// Snapshot of every open connection, closing ones included.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.inner
            .state
            .lock()
            .entries
            .iter()
            .map(|conn| ConnectionInfo {
                host: conn.host(),
                state: conn.state(),
                retry_attempt: conn.retry_attempt(),
                last_error: conn.last_error(),
            })
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.notify.subscribe()
    }

    /// Waits up to `timeout` for a ready connection.
    pub async fn wait_online(&self, timeout: Duration) -> bool {
        let mut online = self.inner.online.subscribe();
        let reached = matches!(
            time::timeout(timeout, online.wait_for(|ready| *ready)).await,
            Ok(Ok(_))
        );
        reached
    }

    /// Closes every connection and resolves once the pool has emitted
    /// `Close`. Safe to call more than once.
    pub async fn close(&self) {
        let mut emit = false;
        {
            let mut state = self.inner.state.lock();
            if !state.closing {
                info!(connections = state.entries.len(), "closing pool");
                state.closing = true;
                state.ready.clear();
                for conn in &state.entries {
                    conn.close();
                }
                emit = self.inner.check_drained(&mut state);
                self.inner.online.send_replace(false);
            }
        }
        if emit {
            let _ = self.inner.notify.send(PoolEvent::Close);
        }

        let mut closed = self.inner.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ConnectionPool")
            .field("hosts", &state.hosts.len())
            .field("connections", &state.entries.len())
            .field("ready", &state.ready.len())
            .field("closing", &state.closing)
            .finish()
    }
}

impl PoolInner {
    /// Opens connections to pending hosts while slots remain. A host with a
    /// reconnect schedule starts after its current delay.
    fn fill_slots(&self, state: &mut PoolState) {
        if state.closing {
            return;
        }
        let free = self.max_connections.saturating_sub(state.entries.len());
        let pending: Vec<Host> = state
            .hosts
            .iter()
            .filter(|host| {
                !state
                    .entries
                    .iter()
                    .any(|conn| conn.host().address == host.address)
            })
            .take(free)
            .copied()
            .collect();

        for host in pending {
            let id = state.next_id;
            state.next_id += 1;
            let delay = state
                .reconnect
                .get(&host.address)
                .map_or(Duration::ZERO, |r| r.delay);
            let conn = Connection::spawn(
                id,
                host,
                delay,
                &self.settings,
                self.connector.clone(),
                self.events_tx.clone(),
            );
            state.entries.push(conn);
        }
    }

    /// Advances the reconnect schedule for `host` after its ready connection
    /// dropped. Returns the exhaustion error once the host has spent its
    /// retry budget; the host is then removed like an unreachable one.
    fn schedule_reconnect(
        &self,
        state: &mut PoolState,
        host: Host,
        ready_since: Option<Instant>,
        cause: &ClientError,
    ) -> Option<ClientError> {
        let policy = &self.settings.retry;
        let reconnect = state
            .reconnect
            .entry(host.address)
            .or_insert_with(|| Reconnect {
                backoff: Backoff::new(policy.clone()),
                delay: Duration::ZERO,
            });
        if ready_since.is_some_and(|since| since.elapsed() >= policy.max_timeout) {
            reconnect.backoff.reset();
        }

        match reconnect.backoff.next_delay() {
            Some(delay) => {
                reconnect.delay = delay;
                debug!(
                    host = %host,
                    attempt = reconnect.backoff.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    "reconnect scheduled"
                );
                None
            }
            None => {
                let attempts = reconnect.backoff.attempt();
                state.reconnect.remove(&host.address);
                state.hosts.remove(&host.address);
                Some(ClientError::RetryExhausted {
                    addr: host.socket_addr(),
                    attempts,
                    last_error: cause.to_string(),
                })
            }
        }
    }

    /// Marks the pool closed once the last connection is gone. Returns true
    /// if `Close` should be emitted.
    fn check_drained(&self, state: &mut PoolState) -> bool {
        if state.closing && state.entries.is_empty() && !state.close_emitted {
            state.close_emitted = true;
            self.closed.send_replace(true);
            return true;
        }
        false
    }

    fn handle(&self, event: ConnectionEvent) {
        let mut emit = Vec::new();
        {
            let mut state = self.state.lock();
            match event {
                ConnectionEvent::Ready { id, channel } => {
                    let host = state
                        .entries
                        .iter()
                        .find(|conn| conn.id() == id && conn.state() == ConnectionState::Ready)
                        .map(Connection::host);
                    match host {
                        Some(host) if !state.closing => {
                            state.ready.push(PooledChannel {
                                id,
                                host,
                                channel,
                                since: Instant::now(),
                            });
                            if !state.announced_online {
                                state.announced_online = true;
                                emit.push(PoolEvent::Online);
                            }
                        }
                        _ => {
                            debug!(id, "ready event for retired connection");
                            channel.close();
                        }
                    }
                }
                ConnectionEvent::Lost { id, error } => {
                    if let Some((host, since)) = state.remove_entry(id) {
                        warn!(host = %host, error = %error, "connection lost");
                        let exhausted = if state.hosts.contains(&host.address) {
                            self.schedule_reconnect(&mut state, host, since, &error)
                        } else {
                            None
                        };
                        emit.push(PoolEvent::Error(Arc::new(error)));
                        if let Some(exhausted) = exhausted {
                            warn!(host = %host, error = %exhausted, "dropping flapping host");
                            emit.push(PoolEvent::Error(Arc::new(exhausted)));
                        }
                        self.fill_slots(&mut state);
                    }
                }
                ConnectionEvent::Failed { id, error } => {
                    if let Some((host, _)) = state.remove_entry(id) {
                        warn!(host = %host, error = %error, "dropping unreachable host");
                        state.hosts.remove(&host.address);
                        state.reconnect.remove(&host.address);
                        self.fill_slots(&mut state);
                        emit.push(PoolEvent::Error(Arc::new(error)));
                    }
                }
                ConnectionEvent::Closed { id } => {
                    if state.remove_entry(id).is_some() {
                        self.fill_slots(&mut state);
                    }
                }
            }

            self.online
                .send_replace(!state.closing && !state.ready.is_empty());
            if self.check_drained(&mut state) {
                emit.push(PoolEvent::Close);
            }
        }

        for event in emit {
            let _ = self.notify.send(event);
        }
    }
}

async fn supervise(
    inner: Weak<PoolInner>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle(event);
    }
    debug!("pool supervisor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    use async_trait::async_trait;
    use serde_json::Value;

    struct NullChannel;

    #[async_trait]
    impl RpcChannel for NullChannel {
        fn invoke(&self, _method: &str, _args: Vec<Value>) -> RpcHandle {
            RpcHandle::channel().1
        }

        async fn closed(&self) -> Option<io::Error> {
            std::future::pending().await
        }

        fn close(&self) {}
    }

    struct NullConnector;

    #[async_trait]
    impl Connector for NullConnector {
        async fn connect(&self, _addr: SocketAddr) -> io::Result<Arc<dyn RpcChannel>> {
            Ok(Arc::new(NullChannel))
        }
    }

    fn config(max_connections: usize) -> PoolConfig {
        PoolConfig {
            max_connections,
            connect_timeout: Duration::from_millis(100),
            retry: RetryPolicy::default(),
        }
    }

    fn host(last: u8) -> Host {
        Host::new(IpAddr::from([10, 0, 0, last]), 2020)
    }

    async fn settle(pool: &ConnectionPool, ready: usize) {
        for _ in 0..100 {
            if pool.ready_count() == ready {
                return;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pool never reached {} ready connections", ready);
    }

    #[tokio::test]
    async fn max_connections_leaves_extra_hosts_pending() {
        let pool = ConnectionPool::new(config(2), Arc::new(NullConnector));
        pool.set_hosts(&[host(1), host(2), host(3)]);
        settle(&pool, 2).await;

        assert_eq!(pool.hosts().len(), 3);
        assert_eq!(pool.connections().len(), 2);

        let first = pool.next().expect("ready").host();
        let rest: Vec<Host> = [host(1), host(2), host(3)]
            .into_iter()
            .filter(|h| *h != first)
            .collect();
        pool.set_hosts(&rest);
        settle(&pool, 2).await;
        assert!(pool.connections().iter().all(|c| c.host != first));
    }

    #[tokio::test]
    async fn wait_online_times_out_without_hosts() {
        let pool = ConnectionPool::new(config(2), Arc::new(NullConnector));
        assert!(!pool.wait_online(Duration::from_millis(20)).await);

        pool.add_host(host(1));
        assert!(pool.wait_online(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn add_host_is_idempotent() {
        let pool = ConnectionPool::new(config(10), Arc::new(NullConnector));
        pool.add_host(host(1));
        pool.add_host(host(1));
        settle(&pool, 1).await;
        assert_eq!(pool.connections().len(), 1);
    }

    #[tokio::test]
    async fn next_is_none_after_close() {
        let pool = ConnectionPool::new(config(10), Arc::new(NullConnector));
        pool.add_host(host(1));
        settle(&pool, 1).await;

        pool.close().await;
        assert!(pool.next().is_none());
        assert!(!pool.connected());

        pool.add_host(host(2));
        assert!(pool.connections().is_empty());
    }
}
