//! # Client API
//!
//! Purpose: Expose the document store's operations as typed async calls on
//! top of the pool, discovery loop and dispatcher.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Client` hides pooling, discovery and dispatch.
//! 2. **Fail Fast**: With no ready connection a call fails immediately with
//!    `NoConnections`; nothing is queued and nothing is retried.
//! 3. **Observable**: Pool transitions are re-broadcast as `ClientEvent`s.
//! 4. **Owned Lifecycle**: Background tasks belong to the instance and stop
//!    on `close`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use dockv_common::{method, RequestOptions, RpcOptions, MIN_API_VERSION};

use crate::config::ClientConfig;
use crate::discovery::{DiscoveryLoop, HickoryResolver, Resolve, Target};
use crate::dispatch::{parse_version, Dispatcher, RecordStream, RequestContext, Settle};
use crate::error::{ClientError, ClientResult};
use crate::host::Host;
use crate::pool::{ConnectionPool, PoolConfig, PoolEvent};
use crate::transport::Connector;

const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_millis(1_000);
const EVENT_CAPACITY: usize = 64;

/// Client-level notifications.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The first connection became ready.
    Connect,
    /// A connection failed. Informational; calls keep working while any
    /// connection is ready.
    Error(Arc<ClientError>),
    /// The client finished closing.
    Close,
}

/// Options for `ping` and `version`.
#[derive(Debug, Clone, Default)]
pub struct HealthOptions {
    /// Ask the server to check its backing store too.
    pub deep: bool,
    /// Overrides the default timeout.
    pub timeout: Option<Duration>,
    pub req_id: Option<String>,
}

/// Async client for the document store.
pub struct Client {
    config: ClientConfig,
    pool: ConnectionPool,
    pub(crate) dispatcher: Dispatcher,
    discovery: Mutex<Option<DiscoveryLoop>>,
    events: broadcast::Sender<ClientEvent>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Client {
    /// Creates a client and starts connecting.
    ///
    /// A literal `host` seeds the pool once. A DNS name is resolved with
    /// hickory now and every `dns.check_interval` after that. Must be called
    /// from within a tokio runtime.
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>) -> ClientResult<Self> {
        config.validate()?;
        let resolver: Option<Arc<dyn Resolve>> = match Target::parse(&config.host) {
            Target::Dns(_) => Some(Arc::new(HickoryResolver::from_config(&config.dns))),
            Target::Literal(_) => None,
        };
        Client::build(config, connector, resolver)
    }

    /// Like [`Client::new`], with a caller-supplied resolver for DNS targets.
    pub fn with_resolver(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        resolver: Arc<dyn Resolve>,
    ) -> ClientResult<Self> {
        config.validate()?;
        Client::build(config, connector, Some(resolver))
    }

    fn build(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        resolver: Option<Arc<dyn Resolve>>,
    ) -> ClientResult<Self> {
        let pool = ConnectionPool::new(PoolConfig::from(&config), connector);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        // Subscribe before any host is added so `Connect` cannot be missed.
        let forwarder = tokio::spawn(forward(pool.subscribe(), events.clone()));

        let discovery = match Target::parse(&config.host) {
            Target::Literal(address) => {
                pool.add_host(Host::new(address, config.port));
                None
            }
            Target::Dns(domain) => {
                let resolver = resolver.ok_or_else(|| {
                    ClientError::Config(format!("no resolver for {}", domain))
                })?;
                Some(DiscoveryLoop::spawn(
                    domain,
                    config.port,
                    resolver,
                    pool.clone(),
                    config.dns.check_interval,
                ))
            }
        };

        info!(host = %config.host, port = config.port, "client created");
        Ok(Client {
            dispatcher: Dispatcher::new(pool.clone()),
            pool,
            config,
            discovery: Mutex::new(discovery),
            events,
            forwarder: Mutex::new(Some(forwarder)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// True while at least one connection is ready.
    pub fn connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.pool.connected()
    }

    /// Hosts currently in the pool's host set.
    pub fn hosts(&self) -> Vec<Host> {
        self.pool.hosts()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Waits up to `timeout` for a ready connection.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        self.pool.wait_online(timeout).await
    }

    /// Stops discovery, closes every connection and emits `Close`.
    /// Later calls fail with `ClientError::Closed`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("close called twice");
        }
        if let Some(discovery) = self.discovery.lock().take() {
            discovery.stop();
        }
        self.pool.close().await;

        let forwarder = self.forwarder.lock().take();
        if let Some(forwarder) = forwarder {
            let _ = forwarder.await;
        }
        info!(host = %self.config.host, "client closed");
    }

    /// Round-trips a `ping`. `options.timeout` defaults to the configured
    /// `ping_timeout`, then one second.
    pub async fn ping(&self, options: HealthOptions) -> ClientResult<()> {
        let timeout = options
            .timeout
            .or(self.config.ping_timeout)
            .unwrap_or(DEFAULT_HEALTH_TIMEOUT);
        let (ctx, args) = self.health_call(method::PING, &options)?;
        debug!(parent: ctx.span(), deep = options.deep, "ping: entered");
        self.dispatcher
            .call_with_timeout(method::PING, args, &ctx, timeout, Settle::OnEnd)
            .await
            .map(|_| ())
    }

    /// Asks the server for its API version.
    ///
    /// Once the call is issued this never fails: a timeout, an error, a
    /// missing field or a non-positive value all yield the minimum version.
    /// Only `NoConnections` and `Closed` are returned.
    pub async fn version(&self, options: HealthOptions) -> ClientResult<u32> {
        let timeout = options.timeout.unwrap_or(DEFAULT_HEALTH_TIMEOUT);
        let (ctx, args) = self.health_call(method::VERSION, &options)?;
        let result = self
            .dispatcher
            .call_with_timeout(method::VERSION, args, &ctx, timeout, Settle::OnFirstRecord)
            .await;
        match result {
            Ok(records) => Ok(parse_version(records.first())),
            Err(ClientError::NoConnections) => Err(ClientError::NoConnections),
            Err(err) => {
                debug!(parent: ctx.span(), error = %err, "version unavailable");
                Ok(MIN_API_VERSION)
            }
        }
    }

    /// Runs raw SQL. Records stream back; null rows are skipped.
    pub fn sql(&self, statement: &str, values: Vec<Value>, options: &RequestOptions) -> RecordStream {
        let (ctx, opts) = match self.prepare(method::SQL, options, None) {
            Ok(prepared) => prepared,
            Err(err) => return RecordStream::failed(err),
        };
        debug!(parent: ctx.span(), statement, "sql: entered");
        let args = vec![Value::String(statement.to_string()), Value::Array(values), opts];
        self.dispatcher.stream(method::SQL, args, &ctx)
    }

    /// Fetches the server's token list.
    pub async fn get_tokens(&self, options: &RequestOptions) -> ClientResult<Option<Value>> {
        let (ctx, opts) = self.prepare(method::GET_TOKENS, options, None)?;
        let records = self.dispatcher.collect(method::GET_TOKENS, vec![opts], &ctx).await?;
        Ok(records.into_iter().next())
    }

    pub(crate) fn ensure_open(&self) -> ClientResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    /// Builds the request context and wire options for one call.
    pub(crate) fn prepare(
        &self,
        method: &str,
        options: &RequestOptions,
        value: Option<&Value>,
    ) -> ClientResult<(RequestContext, Value)> {
        self.ensure_open()?;
        let rpc = RpcOptions::from_request(options, value);
        let ctx = RequestContext::new(method, Some(rpc.req_id.clone()));
        Ok((ctx, rpc.to_value()?))
    }

    fn health_call(
        &self,
        method: &str,
        options: &HealthOptions,
    ) -> ClientResult<(RequestContext, Vec<Value>)> {
        let request = RequestOptions {
            req_id: options.req_id.clone(),
            ..RequestOptions::default()
        };
        self.ensure_open()?;
        let mut rpc = RpcOptions::from_request(&request, None);
        rpc.insert("deep", json!(options.deep));
        let ctx = RequestContext::new(method, Some(rpc.req_id.clone()));
        Ok((ctx, vec![rpc.to_value()?]))
    }
}

impl fmt::Display for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocKvClient<host={}:{}>", self.config.host, self.config.port)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("pool", &self.pool)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Re-broadcasts pool events as client events until the pool closes.
async fn forward(mut pool_events: broadcast::Receiver<PoolEvent>, events: broadcast::Sender<ClientEvent>) {
    loop {
        let event = match pool_events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "client event forwarder lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let (event, last) = match event {
            PoolEvent::Online => (ClientEvent::Connect, false),
            PoolEvent::Error(err) => (ClientEvent::Error(err), false),
            PoolEvent::Close => (ClientEvent::Close, true),
        };
        let _ = events.send(event);
        if last {
            break;
        }
    }
}
