//! Object operations.
//!
//! Unary calls resolve with the first record the server sent (or an empty
//! object for writes), except `reindex_objects`, which reports the last.

use serde_json::{Map, Value};
use tracing::debug;

use dockv_common::{method, BatchRequest, RequestOptions, ValidationError};

use crate::client::Client;
use crate::dispatch::RecordStream;
use crate::error::ClientResult;

fn require_object(field: &str, value: &Value) -> ClientResult<()> {
    if !value.is_object() {
        return Err(ValidationError::InvalidField {
            field: field.to_string(),
            expected: "an object",
        }
        .into());
    }
    Ok(())
}

fn first_or_empty(records: Vec<Value>) -> Value {
    records
        .into_iter()
        .next()
        .unwrap_or_else(|| Value::Object(Map::new()))
}

impl Client {
    /// Writes `value` under `key`, returning the server's metadata (etag).
    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        value: &Value,
        options: &RequestOptions,
    ) -> ClientResult<Value> {
        require_object("value", value)?;
        let (ctx, opts) = self.prepare(method::PUT_OBJECT, options, Some(value))?;
        debug!(parent: ctx.span(), bucket, key, etag = ?options.etag, "putObject: entered");
        let args = vec![Value::from(bucket), Value::from(key), value.clone(), opts];
        let records = self.dispatcher.collect(method::PUT_OBJECT, args, &ctx).await?;
        Ok(first_or_empty(records))
    }

    /// Reads one object. `None` if the server ended without a record.
    pub async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        options: &RequestOptions,
    ) -> ClientResult<Option<Value>> {
        let (ctx, opts) = self.prepare(method::GET_OBJECT, options, None)?;
        let args = vec![Value::from(bucket), Value::from(key), opts];
        let records = self.dispatcher.collect(method::GET_OBJECT, args, &ctx).await?;
        Ok(records.into_iter().next())
    }

    pub async fn delete_object(
        &self,
        bucket: &str,
        key: &str,
        options: &RequestOptions,
    ) -> ClientResult<()> {
        let (ctx, opts) = self.prepare(method::DELETE_OBJECT, options, None)?;
        let args = vec![Value::from(bucket), Value::from(key), opts];
        self.dispatcher
            .collect(method::DELETE_OBJECT, args, &ctx)
            .await
            .map(|_| ())
    }

    /// Streams every object in `bucket` matching the LDAP-style `filter`.
    pub fn find_objects(&self, bucket: &str, filter: &str, options: &RequestOptions) -> RecordStream {
        let (ctx, opts) = match self.prepare(method::FIND_OBJECTS, options, None) {
            Ok(prepared) => prepared,
            Err(err) => return RecordStream::failed(err),
        };
        debug!(parent: ctx.span(), bucket, filter, "findObjects: entered");
        let args = vec![Value::from(bucket), Value::from(filter), opts];
        self.dispatcher.stream(method::FIND_OBJECTS, args, &ctx)
    }

    /// Applies several writes in one server-side transaction.
    pub async fn batch(
        &self,
        mut requests: Vec<BatchRequest>,
        options: &RequestOptions,
    ) -> ClientResult<Value> {
        for (index, request) in requests.iter_mut().enumerate() {
            request.prepare(index)?;
        }

        let (ctx, opts) = self.prepare(method::BATCH, options, None)?;
        debug!(parent: ctx.span(), requests = requests.len(), "batch: entered");
        let args = vec![serde_json::to_value(&requests)?, opts];
        let records = self.dispatcher.collect(method::BATCH, args, &ctx).await?;
        Ok(first_or_empty(records))
    }

    /// Sets `fields` on every object matching `filter`.
    pub async fn update_objects(
        &self,
        bucket: &str,
        fields: &Value,
        filter: &str,
        options: &RequestOptions,
    ) -> ClientResult<Value> {
        require_object("fields", fields)?;
        let (ctx, opts) = self.prepare(method::UPDATE_OBJECTS, options, None)?;
        let args = vec![Value::from(bucket), fields.clone(), Value::from(filter), opts];
        let records = self
            .dispatcher
            .collect(method::UPDATE_OBJECTS, args, &ctx)
            .await?;
        Ok(first_or_empty(records))
    }

    pub async fn delete_many(
        &self,
        bucket: &str,
        filter: &str,
        options: &RequestOptions,
    ) -> ClientResult<Value> {
        let (ctx, opts) = self.prepare(method::DELETE_MANY, options, None)?;
        let args = vec![Value::from(bucket), Value::from(filter), opts];
        let records = self.dispatcher.collect(method::DELETE_MANY, args, &ctx).await?;
        Ok(first_or_empty(records))
    }

    /// Reindexes up to `count` rows, returning the final progress record
    /// (`{"processed": n, ...}`).
    pub async fn reindex_objects(
        &self,
        bucket: &str,
        count: u32,
        options: &RequestOptions,
    ) -> ClientResult<Value> {
        if count == 0 {
            return Err(ValidationError::NotPositive {
                field: "count".to_string(),
            }
            .into());
        }

        let (ctx, opts) = self.prepare(method::REINDEX_OBJECTS, options, None)?;
        let args = vec![Value::from(bucket), Value::from(count), opts];
        let records = self
            .dispatcher
            .collect(method::REINDEX_OBJECTS, args, &ctx)
            .await?;
        let result = records
            .into_iter()
            .last()
            .unwrap_or_else(|| Value::Object(Map::new()));
        debug!(parent: ctx.span(), processed = ?result.get("processed"), "reindexObjects: done");
        Ok(result)
    }
}
