//! # Request Options Envelope
//!
//! Purpose: Turn caller-supplied request options into the options object that
//! travels as the last argument of every RPC.
//!
//! ## Design Principles
//! 1. **Stable Wire Names**: Field names match what the server reads
//!    (`req_id`, `noCache`, `_value`, ...).
//! 2. **Defaults Applied Once**: `RpcOptions::from_request` is the single
//!    place defaults are filled in.
//! 3. **Passthrough**: Unknown caller options (`limit`, `sort`, ...) are
//!    forwarded untouched.
//!
//! ## Wire Shape
//!
//! ```text
//! {
//!   "req_id":   "<uuid>",           // generated when absent
//!   "etag":     <any>,              // omitted when unset; null is meaningful
//!   "headers":  { ... },            // defaults to {}
//!   "no_count": false,
//!   "sql_only": false,
//!   "noCache":  true,               // caller may override
//!   "_value":   "<json string>",    // puts only
//!   ...passthrough
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Legacy spelling of `etag` still accepted from callers.
const LEGACY_ETAG_KEY: &str = "_etag";

/// Options a caller may attach to a single request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestOptions {
    /// Request id used for log correlation; generated when absent.
    pub req_id: Option<String>,
    /// Conditional-write etag. `Some(Value::Null)` means "must not exist".
    pub etag: Option<Value>,
    /// Arbitrary headers forwarded to the server.
    pub headers: Map<String, Value>,
    /// Skip the total-count computation on finds.
    pub no_count: bool,
    /// Ask the server to return the generated SQL instead of running it.
    pub sql_only: bool,
    /// Override the server-side bucket cache bypass (defaults to true).
    #[serde(rename = "noCache")]
    pub no_cache: Option<bool>,
    /// Any other options (`limit`, `offset`, `sort`, ...), passed through.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RequestOptions {
    /// Creates options pinned to an explicit request id.
    pub fn with_req_id(req_id: impl Into<String>) -> Self {
        RequestOptions {
            req_id: Some(req_id.into()),
            ..RequestOptions::default()
        }
    }

    /// Sets a passthrough option.
    pub fn set(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Options object as sent on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcOptions {
    pub req_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<Value>,
    pub headers: Map<String, Value>,
    pub no_count: bool,
    pub sql_only: bool,
    #[serde(rename = "noCache")]
    pub no_cache: bool,
    /// Stringified copy of the value being written. Older servers read it
    /// instead of the structured value.
    #[serde(rename = "_value", skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RpcOptions {
    /// Builds the wire options for a request, filling in defaults.
    ///
    /// `value` is the object being written, when there is one; its JSON text
    /// is embedded as `_value`.
    pub fn from_request(options: &RequestOptions, value: Option<&Value>) -> Self {
        let mut extra = options.extra.clone();
        let legacy_etag = extra.remove(LEGACY_ETAG_KEY);

        RpcOptions {
            req_id: options
                .req_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            etag: options.etag.clone().or(legacy_etag),
            headers: options.headers.clone(),
            no_count: options.no_count,
            sql_only: options.sql_only,
            no_cache: options.no_cache.unwrap_or(true),
            value: value.map(Value::to_string),
            extra,
        }
    }

    /// Adds a passthrough field (e.g. `deep` for health checks).
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.extra.insert(key.into(), value);
    }

    /// Serializes into the JSON value passed as the RPC's final argument.
    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}
