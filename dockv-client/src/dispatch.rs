//! # Dispatcher
//!
//! Purpose: Turn "call method X" into one RPC on some ready connection, and
//! give callers a uniform completion contract over the streamed events.
//!
//! ## Design Principles
//! 1. **Fail Fast**: No ready connection means `NoConnections` right away.
//!    Nothing is queued and nothing is retried here.
//! 2. **Write-Once Outcome**: Timed calls race the transport against a local
//!    timer through a single-assignment slot. The first writer wins and
//!    later writers are dropped.
//! 3. **Tolerate Stragglers**: After a timed call resolves, its request is
//!    still drained in the background until it terminates or its channel
//!    closes. The transport may keep delivering events for a request the
//!    caller has given up on.
//! 4. **Exactly One Terminal**: Streams yield records, then one `End` or
//!    `Error`, then nothing.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time;
use tracing::{debug, info_span, trace, warn, Instrument, Span};
use uuid::Uuid;

use dockv_common::{RpcEvent, MIN_API_VERSION};

use crate::error::{ClientError, ClientResult};
use crate::pool::{ConnectionPool, PooledChannel};
use crate::transport::RpcHandle;

/// Per-call context: request id, optional deadline and log binding.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub req_id: String,
    pub deadline: Option<Instant>,
    span: Span,
}

impl RequestContext {
    /// Creates a context, generating a request id if none is given.
    pub fn new(method: &str, req_id: Option<String>) -> Self {
        let req_id = req_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let span = info_span!("rpc", method, req_id = %req_id);
        RequestContext {
            req_id,
            deadline: None,
            span,
        }
    }

    /// Bounds the call by `timeout` from now. An earlier deadline already
    /// on the context wins.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        self.deadline = Some(self.deadline.map_or(deadline, |d| d.min(deadline)));
        self
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

/// Single-assignment result slot.
pub(crate) struct Completion<T> {
    slot: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> Completion<T> {
    pub(crate) fn new() -> (Arc<Self>, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        let completion = Arc::new(Completion {
            slot: Mutex::new(Some(tx)),
        });
        (completion, rx)
    }

    /// Stores `value` if nothing was stored yet. Returns whether this call
    /// won.
    pub(crate) fn complete(&self, value: T) -> bool {
        match self.slot.lock().take() {
            Some(tx) => {
                let _ = tx.send(value);
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.slot.lock().is_none()
    }
}

/// When a timed call counts as finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settle {
    /// On `End`, with every record received.
    OnEnd,
    /// On the first non-null record, or on `End` if none arrived.
    OnFirstRecord,
}

/// One event from a [`RecordStream`].
#[derive(Debug)]
pub enum StreamEvent {
    Record(Value),
    End,
    Error(ClientError),
}

/// Observer over a streaming call.
///
/// Yields records, then exactly one `End` or `Error`, then `None` forever.
/// Null records are skipped. The request is released as soon as the
/// terminal event is produced.
#[derive(Debug)]
pub struct RecordStream {
    handle: Option<RpcHandle>,
    pending_error: Option<ClientError>,
    finished: bool,
    records: usize,
    span: Span,
}

impl RecordStream {
    pub(crate) fn new(handle: RpcHandle, span: Span) -> Self {
        RecordStream {
            handle: Some(handle),
            pending_error: None,
            finished: false,
            records: 0,
            span,
        }
    }

    /// A stream whose only event is `error`.
    pub(crate) fn failed(error: ClientError) -> Self {
        RecordStream {
            handle: None,
            pending_error: Some(error),
            finished: false,
            records: 0,
            span: Span::none(),
        }
    }

    /// A stream that reports no active connections.
    pub fn unavailable() -> Self {
        RecordStream::failed(ClientError::NoConnections)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        if let Some(error) = self.pending_error.take() {
            self.finish();
            return Some(StreamEvent::Error(error));
        }

        let handle = match self.handle.as_mut() {
            Some(handle) => handle,
            None => {
                self.finish();
                return None;
            }
        };

        loop {
            match handle.recv().await {
                Some(RpcEvent::Data(Value::Null)) => continue,
                Some(RpcEvent::Data(record)) => {
                    self.records += 1;
                    return Some(StreamEvent::Record(record));
                }
                Some(RpcEvent::End) => {
                    self.finish();
                    debug!(parent: &self.span, records = self.records, "stream ended");
                    return Some(StreamEvent::End);
                }
                Some(RpcEvent::Error(err)) => {
                    self.finish();
                    debug!(parent: &self.span, error = %err, "stream failed");
                    return Some(StreamEvent::Error(ClientError::Remote(err)));
                }
                None => {
                    self.finish();
                    return Some(StreamEvent::Error(dropped_request()));
                }
            }
        }
    }

    /// Drains the stream into a list of records, or the terminal error.
    pub async fn collect(mut self) -> ClientResult<Vec<Value>> {
        let mut records = Vec::new();
        while let Some(event) = self.next().await {
            match event {
                StreamEvent::Record(record) => records.push(record),
                StreamEvent::End => break,
                StreamEvent::Error(err) => return Err(err),
            }
        }
        Ok(records)
    }

    fn finish(&mut self) {
        self.finished = true;
        self.handle = None;
    }
}

/// Issues calls over the pool.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    pool: ConnectionPool,
}

impl Dispatcher {
    pub fn new(pool: ConnectionPool) -> Self {
        Dispatcher { pool }
    }

    /// Next ready channel, or `NoConnections`.
    pub fn acquire(&self) -> ClientResult<PooledChannel> {
        self.pool.next().ok_or(ClientError::NoConnections)
    }

    /// Sends one RPC and returns its raw event handle.
    pub fn invoke(
        &self,
        method: &str,
        args: Vec<Value>,
        ctx: &RequestContext,
    ) -> ClientResult<RpcHandle> {
        self.send(method, args, ctx).map(|(_, handle)| handle)
    }

    fn send(
        &self,
        method: &str,
        args: Vec<Value>,
        ctx: &RequestContext,
    ) -> ClientResult<(PooledChannel, RpcHandle)> {
        let _enter = ctx.span().enter();
        let channel = match self.acquire() {
            Ok(channel) => channel,
            Err(err) => {
                debug!("no active connections");
                return Err(err);
            }
        };
        debug!(host = %channel.host(), "invoking");
        let handle = channel.invoke(method, args);
        Ok((channel, handle))
    }

    /// Unary call: gathers every record until `End`.
    pub async fn collect(
        &self,
        method: &str,
        args: Vec<Value>,
        ctx: &RequestContext,
    ) -> ClientResult<Vec<Value>> {
        let handle = self.invoke(method, args, ctx)?;
        let result = RecordStream::new(handle, ctx.span().clone())
            .collect()
            .await;
        if let Err(err) = &result {
            debug!(parent: ctx.span(), error = %err, "call failed");
        }
        result
    }

    /// Streaming call. Connectivity failures surface as the stream's only
    /// event.
    pub fn stream(&self, method: &str, args: Vec<Value>, ctx: &RequestContext) -> RecordStream {
        match self.invoke(method, args, ctx) {
            Ok(handle) => RecordStream::new(handle, ctx.span().clone()),
            Err(err) => RecordStream::failed(err),
        }
    }

    /// Call bounded by `timeout`, or by the context's deadline if that comes
    /// first. Exactly one of the transport's terminal event and the timer
    /// decides the outcome.
    ///
    /// A timed-out request is not cancelled on the server. Its events are
    /// drained in the background until it terminates or the channel it was
    /// sent on closes, so a request the server never finishes holds one
    /// task until the pool retires that connection.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        args: Vec<Value>,
        ctx: &RequestContext,
        timeout: Duration,
        settle: Settle,
    ) -> ClientResult<Vec<Value>> {
        let ctx = ctx.clone().with_timeout(timeout);
        let (channel, handle) = self.send(method, args, &ctx)?;
        let (completion, mut outcome) = Completion::new();

        let gone = async move {
            channel.closed().await;
        };
        tokio::spawn(
            pump(handle, gone, completion.clone(), settle).instrument(ctx.span().clone()),
        );

        let remaining = ctx.remaining().unwrap_or(timeout);
        tokio::select! {
            biased;
            result = &mut outcome => return result.unwrap_or_else(|_| Err(dropped_request())),
            _ = time::sleep(remaining) => {
                let timed_out = ClientError::CallTimeout {
                    method: method.to_string(),
                    timeout,
                };
                if completion.complete(Err(timed_out)) {
                    warn!(parent: ctx.span(), timeout_ms = timeout.as_millis() as u64, "call timed out");
                }
            }
        }

        outcome.await.unwrap_or_else(|_| Err(dropped_request()))
    }
}

/// Feeds a request's events into `completion`, then keeps draining
/// whatever the transport still sends. Stops once `gone` resolves, which
/// fails the call if it had not settled yet.
async fn pump(
    mut handle: RpcHandle,
    gone: impl Future<Output = ()>,
    completion: Arc<Completion<ClientResult<Vec<Value>>>>,
    settle: Settle,
) {
    tokio::pin!(gone);
    let mut records = Vec::new();
    loop {
        let event = tokio::select! {
            biased;
            event = handle.recv() => event,
            _ = &mut gone => {
                trace!("channel closed, request abandoned");
                None
            }
        };
        let Some(event) = event else {
            break;
        };
        if completion.is_complete() {
            trace!("event after completion ignored");
            continue;
        }
        match event {
            RpcEvent::Data(Value::Null) => {}
            RpcEvent::Data(record) => {
                if settle == Settle::OnFirstRecord {
                    completion.complete(Ok(vec![record]));
                } else {
                    records.push(record);
                }
            }
            RpcEvent::End => {
                completion.complete(Ok(std::mem::take(&mut records)));
            }
            RpcEvent::Error(err) => {
                completion.complete(Err(ClientError::Remote(err)));
            }
        }
    }
    completion.complete(Err(dropped_request()));
}

fn dropped_request() -> ClientError {
    ClientError::ConnectionLost {
        reason: "request dropped before completion".to_string(),
    }
}

/// Reads `version` from a version reply, flooring at the minimum API
/// version. Integers, floats (truncated) and strings with a leading integer
/// are accepted; anything else floors.
pub fn parse_version(reply: Option<&Value>) -> u32 {
    let version = match reply.and_then(|reply| reply.get("version")) {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Some(Value::String(s)) => leading_int(s),
        _ => None,
    };
    match version {
        Some(v) if v >= MIN_API_VERSION as i64 => u32::try_from(v).unwrap_or(u32::MAX),
        _ => MIN_API_VERSION,
    }
}

fn leading_int(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let (sign, digits) = match s.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, s.strip_prefix('+').unwrap_or(s)),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end].parse::<i64>().ok().map(|v| sign * v)
}
