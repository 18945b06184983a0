//! # Host Discovery
//!
//! Purpose: Keep the pool's host set in step with what DNS says the service
//! name resolves to.
//!
//! ## Design Principles
//! 1. **Fail Static**: A failed or empty lookup logs and leaves the current
//!    hosts alone; it never empties the pool.
//! 2. **Instance Scoped**: The loop is a task owned by one client and stops
//!    when that client closes or drops it.
//! 3. **Pluggable Lookup**: Resolution sits behind the `Resolve` trait so
//!    tests can script answers.
//!
//! ## Loop
//!
//! ```text
//! spawn ──► resolve ──► set_hosts ──► sleep(check_interval) ──┐
//!              ▲                                              │
//!              └──────────────────────────────────────────────┘
//! ```
//!
//! The next pass is scheduled only after the previous one finished, so a
//! slow resolver never overlaps itself.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfig, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::{Resolver, TokioResolver};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::DnsConfig;
use crate::error::{ClientError, ClientResult};
use crate::host::Host;
use crate::pool::ConnectionPool;

/// Where the client's `host` option points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// An IP literal; the pool is seeded once and never re-resolved.
    Literal(IpAddr),
    /// A name resolved periodically.
    Dns(String),
}

impl Target {
    pub fn parse(host: &str) -> Self {
        match host.parse::<IpAddr>() {
            Ok(addr) => Target::Literal(addr),
            Err(_) => Target::Dns(host.to_string()),
        }
    }
}

/// Name-to-address lookup.
#[async_trait]
pub trait Resolve: Send + Sync + 'static {
    async fn resolve(&self, domain: &str) -> ClientResult<Vec<IpAddr>>;
}

/// `Resolve` backed by hickory's async resolver.
pub struct HickoryResolver {
    resolver: TokioResolver,
}

impl HickoryResolver {
    /// Builds a resolver honouring `dns.resolvers`, `dns.timeout` and
    /// `dns.retries`. With no explicit resolvers the default upstream
    /// configuration is used.
    pub fn from_config(dns: &DnsConfig) -> Self {
        let config = if dns.resolvers.is_empty() {
            ResolverConfig::default()
        } else {
            let mut config = ResolverConfig::new();
            for ip in &dns.resolvers {
                let addr = SocketAddr::new(*ip, 53);
                config.add_name_server(NameServerConfig::new(addr, Protocol::Udp));
                config.add_name_server(NameServerConfig::new(addr, Protocol::Tcp));
            }
            config
        };

        let mut opts = ResolverOpts::default();
        opts.timeout = dns.timeout;
        opts.attempts = dns.retries.max(1) as usize;

        let resolver = Resolver::builder_with_config(config, TokioConnectionProvider::default())
            .with_options(opts)
            .build();
        HickoryResolver { resolver }
    }
}

#[async_trait]
impl Resolve for HickoryResolver {
    async fn resolve(&self, domain: &str) -> ClientResult<Vec<IpAddr>> {
        let lookup = self
            .resolver
            .lookup_ip(domain)
            .await
            .map_err(|err| ClientError::Discovery {
                domain: domain.to_string(),
                message: err.to_string(),
            })?;
        Ok(lookup.iter().collect())
    }
}

/// Background task re-resolving a DNS target into the pool.
pub struct DiscoveryLoop {
    domain: String,
    shutdown: Arc<Notify>,
    refresh: Arc<Notify>,
    task: JoinHandle<()>,
}

impl DiscoveryLoop {
    /// Starts the loop. The first lookup runs immediately.
    pub fn spawn(
        domain: String,
        port: u16,
        resolver: Arc<dyn Resolve>,
        pool: ConnectionPool,
        interval: Duration,
    ) -> Self {
        let shutdown = Arc::new(Notify::new());
        let refresh = Arc::new(Notify::new());
        let span = info_span!("discovery", domain = %domain);

        let task = tokio::spawn(
            run(
                domain.clone(),
                port,
                resolver,
                pool,
                interval,
                shutdown.clone(),
                refresh.clone(),
            )
            .instrument(span),
        );

        DiscoveryLoop {
            domain,
            shutdown,
            refresh,
            task,
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Skips the rest of the current sleep and resolves now.
    pub fn refresh_now(&self) {
        self.refresh.notify_one();
    }

    /// Stops the loop. An in-flight lookup is abandoned.
    pub fn stop(&self) {
        self.shutdown.notify_one();
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for DiscoveryLoop {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    domain: String,
    port: u16,
    resolver: Arc<dyn Resolve>,
    pool: ConnectionPool,
    interval: Duration,
    shutdown: Arc<Notify>,
    refresh: Arc<Notify>,
) {
    info!(interval_ms = interval.as_millis() as u64, "starting discovery");
    loop {
        tokio::select! {
            biased;
            _ = shutdown.notified() => break,
            result = refresh_once(&domain, port, resolver.as_ref(), &pool) => {
                if let Err(err) = result {
                    warn!(error = %err, hosts = pool.hosts().len(), "resolution failed, keeping current hosts");
                }
            }
        }

        tokio::select! {
            biased;
            _ = shutdown.notified() => break,
            _ = refresh.notified() => debug!("refresh requested"),
            _ = time::sleep(interval) => {}
        }
    }
    info!("discovery stopped");
}

/// One resolve-and-reconcile pass. Returns the number of hosts applied.
///
/// Errors and empty answers leave the pool untouched.
pub(crate) async fn refresh_once(
    domain: &str,
    port: u16,
    resolver: &dyn Resolve,
    pool: &ConnectionPool,
) -> ClientResult<usize> {
    let addrs = resolver.resolve(domain).await?;
    if addrs.is_empty() {
        return Err(ClientError::Discovery {
            domain: domain.to_string(),
            message: "no addresses".to_string(),
        });
    }

    let hosts: Vec<Host> = addrs.into_iter().map(|ip| Host::new(ip, port)).collect();
    debug!(count = hosts.len(), "resolved");
    pool.set_hosts(&hosts);
    Ok(hosts.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use serde_json::Value;

    use crate::config::RetryPolicy;
    use crate::pool::PoolConfig;
    use crate::transport::{Connector, RpcChannel, RpcHandle};

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

    #[derive(Default)]
    struct ScriptedResolver {
        answer: Mutex<Option<Vec<IpAddr>>>,
        calls: AtomicUsize,
    }

    impl ScriptedResolver {
        fn answer(&self, ips: Option<Vec<IpAddr>>) {
            *self.answer.lock() = ips;
        }
    }

    #[async_trait]
    impl Resolve for ScriptedResolver {
        async fn resolve(&self, domain: &str) -> ClientResult<Vec<IpAddr>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer
                .lock()
                .clone()
                .ok_or_else(|| ClientError::Discovery {
                    domain: domain.to_string(),
                    message: "SERVFAIL".to_string(),
                })
        }
    }

    fn pool() -> ConnectionPool {
        ConnectionPool::new(
            PoolConfig {
                max_connections: 10,
                connect_timeout: Duration::from_millis(100),
                retry: RetryPolicy::default(),
            },
            Arc::new(NullConnector),
        )
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn parses_literal_and_dns_targets() {
        assert_eq!(
            Target::parse("10.1.2.3"),
            Target::Literal(IpAddr::from([10, 1, 2, 3]))
        );
        assert_eq!(Target::parse("::1"), Target::Literal("::1".parse().unwrap()));
        assert_eq!(
            Target::parse("kv.example.com"),
            Target::Dns("kv.example.com".to_string())
        );
    }

    #[tokio::test]
    async fn failed_or_empty_lookup_keeps_hosts() {
        let pool = pool();
        let resolver = ScriptedResolver::default();

        resolver.answer(Some(vec![ip(1), ip(2)]));
        assert_eq!(refresh_once("kv", 2020, &resolver, &pool).await.unwrap(), 2);
        assert_eq!(pool.hosts().len(), 2);

        resolver.answer(None);
        assert!(refresh_once("kv", 2020, &resolver, &pool).await.is_err());
        assert_eq!(pool.hosts().len(), 2);

        resolver.answer(Some(vec![]));
        assert!(refresh_once("kv", 2020, &resolver, &pool).await.is_err());
        assert_eq!(pool.hosts().len(), 2);

        resolver.answer(Some(vec![ip(2), ip(2), ip(3)]));
        refresh_once("kv", 2020, &resolver, &pool).await.unwrap();
        let hosts: Vec<IpAddr> = pool.hosts().iter().map(|h| h.address).collect();
        assert_eq!(hosts, vec![ip(2), ip(3)]);
    }

    #[tokio::test]
    async fn loop_repeats_until_stopped() {
        let pool = pool();
        let resolver = Arc::new(ScriptedResolver::default());
        resolver.answer(Some(vec![ip(1)]));

        let discovery = DiscoveryLoop::spawn(
            "kv".to_string(),
            2020,
            resolver.clone(),
            pool.clone(),
            Duration::from_millis(10),
        );
        time::sleep(Duration::from_millis(100)).await;
        assert!(resolver.calls.load(Ordering::SeqCst) >= 3);
        assert_eq!(pool.hosts(), vec![Host::new(ip(1), 2020)]);

        discovery.stop();
        time::sleep(Duration::from_millis(20)).await;
        assert!(discovery.is_finished());
        let calls = resolver.calls.load(Ordering::SeqCst);
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(resolver.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn refresh_now_cuts_sleep_short() {
        let pool = pool();
        let resolver = Arc::new(ScriptedResolver::default());
        resolver.answer(Some(vec![ip(1)]));

        let discovery = DiscoveryLoop::spawn(
            "kv".to_string(),
            2020,
            resolver.clone(),
            pool.clone(),
            Duration::from_secs(3600),
        );
        time::sleep(Duration::from_millis(20)).await;
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);

        resolver.answer(Some(vec![ip(4)]));
        discovery.refresh_now();
        time::sleep(Duration::from_millis(20)).await;
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
        assert_eq!(pool.hosts(), vec![Host::new(ip(4), 2020)]);
    }
}
