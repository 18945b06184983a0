#![allow(dead_code)]

use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;

use dockv_client::{
    ClientError, ClientResult, Connector, Resolve, RetryPolicy, RpcChannel, RpcHandle, RpcSender,
};

/// Scripted server: gets the method, its arguments and the sender for the
/// reply stream.
pub type Responder = Arc<dyn Fn(&str, &[Value], RpcSender) + Send + Sync>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn ip(last: u8) -> IpAddr {
    IpAddr::from([10, 0, 0, last])
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::default().with_timeouts(Duration::from_millis(5), Duration::from_millis(20))
}

/// Polls `cond` every few milliseconds for up to two seconds.
pub async fn eventually(cond: impl Fn() -> bool) -> bool {
    for _ in 0..400 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

/// Replies to every call with a bare `end`.
pub fn end_responder() -> Responder {
    Arc::new(|_method: &str, _args: &[Value], tx: RpcSender| {
        tx.end();
    })
}

pub struct MockChannel {
    addr: SocketAddr,
    responder: Arc<Mutex<Responder>>,
    dead: Arc<watch::Sender<bool>>,
    calls: Mutex<Vec<(String, Vec<Value>)>>,
    close_delay: Duration,
    open: Arc<AtomicUsize>,
}

impl MockChannel {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Simulates the server dropping the connection.
    pub fn kill(&self) {
        mark_dead(&self.dead, &self.open);
    }

    pub fn is_dead(&self) -> bool {
        *self.dead.borrow()
    }

    pub fn invocations(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls(&self) -> Vec<(String, Vec<Value>)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl RpcChannel for MockChannel {
    fn invoke(&self, method: &str, args: Vec<Value>) -> RpcHandle {
        self.calls.lock().push((method.to_string(), args.clone()));
        let (tx, handle) = RpcHandle::channel();
        if !self.is_dead() {
            let responder = self.responder.lock().clone();
            responder(method, &args, tx);
        }
        handle
    }

    async fn closed(&self) -> Option<io::Error> {
        let mut dead = self.dead.subscribe();
        let _ = dead.wait_for(|dead| *dead).await;
        Some(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"))
    }

    fn close(&self) {
        if self.close_delay.is_zero() {
            mark_dead(&self.dead, &self.open);
            return;
        }
        let dead = self.dead.clone();
        let open = self.open.clone();
        let delay = self.close_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            mark_dead(&dead, &open);
        });
    }
}

fn mark_dead(dead: &watch::Sender<bool>, open: &AtomicUsize) {
    let changed = dead.send_if_modified(|dead| !std::mem::replace(dead, true));
    if changed {
        open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory transport. Every connect to a non-refused address yields a
/// fresh `MockChannel` sharing the connector's responder.
pub struct MockConnector {
    refused: Mutex<HashSet<IpAddr>>,
    refuse_all: Mutex<bool>,
    responder: Arc<Mutex<Responder>>,
    channels: Mutex<Vec<Arc<MockChannel>>>,
    attempts: AtomicUsize,
    flapping: AtomicBool,
    close_delay: Mutex<Duration>,
    open: Arc<AtomicUsize>,
    peak_open: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        MockConnector::with_responder(end_responder())
    }

    pub fn with_responder(responder: Responder) -> Arc<Self> {
        Arc::new(MockConnector {
            refused: Mutex::new(HashSet::new()),
            refuse_all: Mutex::new(false),
            responder: Arc::new(Mutex::new(responder)),
            channels: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            flapping: AtomicBool::new(false),
            close_delay: Mutex::new(Duration::ZERO),
            open: Arc::new(AtomicUsize::new(0)),
            peak_open: AtomicUsize::new(0),
        })
    }

    /// Every connect succeeds, but the channel is already reset.
    pub fn flapping() -> Arc<Self> {
        let connector = MockConnector::new();
        connector.flapping.store(true, Ordering::SeqCst);
        connector
    }

    /// Channels opened from now on take `delay` to confirm a close.
    pub fn set_close_delay(&self, delay: Duration) {
        *self.close_delay.lock() = delay;
    }

    /// Most channels ever open at the same time.
    pub fn peak_open(&self) -> usize {
        self.peak_open.load(Ordering::SeqCst)
    }

    pub fn refusing() -> Arc<Self> {
        let connector = MockConnector::new();
        *connector.refuse_all.lock() = true;
        connector
    }

    pub fn set_responder(&self, responder: Responder) {
        *self.responder.lock() = responder;
    }

    pub fn refuse(&self, address: IpAddr) {
        self.refused.lock().insert(address);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        self.channels.lock().clone()
    }

    pub fn live_channels(&self) -> Vec<Arc<MockChannel>> {
        self.channels()
            .into_iter()
            .filter(|ch| !ch.is_dead())
            .collect()
    }

    /// Most recent channel opened to `address`.
    pub fn channel_for(&self, address: IpAddr) -> Option<Arc<MockChannel>> {
        self.channels()
            .into_iter()
            .rev()
            .find(|ch| ch.addr.ip() == address)
    }

    /// Every call made on any channel, in channel order.
    pub fn calls(&self) -> Vec<(String, Vec<Value>)> {
        self.channels()
            .iter()
            .flat_map(|ch| ch.calls())
            .collect()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, addr: SocketAddr) -> io::Result<Arc<dyn RpcChannel>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if *self.refuse_all.lock() || self.refused.lock().contains(&addr.ip()) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            ));
        }
        let flapping = self.flapping.load(Ordering::SeqCst);
        let channel = Arc::new(MockChannel {
            addr,
            responder: self.responder.clone(),
            dead: Arc::new(watch::channel(flapping).0),
            calls: Mutex::new(Vec::new()),
            close_delay: *self.close_delay.lock(),
            open: self.open.clone(),
        });
        if !flapping {
            let open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_open.fetch_max(open, Ordering::SeqCst);
        }
        self.channels.lock().push(channel.clone());
        Ok(channel)
    }
}

/// Resolver with a settable answer.
pub struct MockResolver {
    answer: Mutex<Result<Vec<IpAddr>, String>>,
    calls: AtomicUsize,
}

impl MockResolver {
    pub fn new(ips: Vec<IpAddr>) -> Arc<Self> {
        Arc::new(MockResolver {
            answer: Mutex::new(Ok(ips)),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set(&self, ips: Vec<IpAddr>) {
        *self.answer.lock() = Ok(ips);
    }

    pub fn fail(&self, message: &str) {
        *self.answer.lock() = Err(message.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resolve for MockResolver {
    async fn resolve(&self, domain: &str) -> ClientResult<Vec<IpAddr>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer
            .lock()
            .clone()
            .map_err(|message| ClientError::Discovery {
                domain: domain.to_string(),
                message,
            })
    }
}
