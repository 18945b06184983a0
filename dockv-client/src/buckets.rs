//! Bucket schema operations.

use serde_json::Value;
use tracing::debug;

use dockv_common::{method, BucketConfig, RequestOptions, BUCKET_NOT_FOUND};

use crate::client::Client;
use crate::error::{ClientError, ClientResult};

impl Client {
    /// Creates a bucket. Fails if it already exists.
    pub async fn create_bucket(
        &self,
        name: &str,
        config: &BucketConfig,
        options: &RequestOptions,
    ) -> ClientResult<()> {
        let (ctx, opts) = self.prepare(method::CREATE_BUCKET, options, None)?;
        let args = vec![Value::from(name), serde_json::to_value(config)?, opts];
        debug!(parent: ctx.span(), bucket = name, "createBucket: entered");
        self.dispatcher
            .collect(method::CREATE_BUCKET, args, &ctx)
            .await
            .map(|_| ())
    }

    /// Fetches a bucket's stored configuration.
    ///
    /// A missing bucket is a remote `BucketNotFoundError`.
    pub async fn get_bucket(&self, name: &str, options: &RequestOptions) -> ClientResult<Value> {
        let (ctx, opts) = self.prepare(method::GET_BUCKET, options, None)?;
        // getBucket takes its options first.
        let args = vec![opts, Value::from(name)];
        let records = self.dispatcher.collect(method::GET_BUCKET, args, &ctx).await?;
        records.into_iter().next().ok_or_else(|| {
            ClientError::Remote(dockv_common::RemoteError::new(
                BUCKET_NOT_FOUND,
                format!("{} does not exist", name),
            ))
        })
    }

    pub async fn list_buckets(&self, options: &RequestOptions) -> ClientResult<Vec<Value>> {
        let (ctx, opts) = self.prepare(method::LIST_BUCKETS, options, None)?;
        self.dispatcher
            .collect(method::LIST_BUCKETS, vec![opts], &ctx)
            .await
    }

    /// Replaces an existing bucket's configuration.
    pub async fn update_bucket(
        &self,
        name: &str,
        config: &BucketConfig,
        options: &RequestOptions,
    ) -> ClientResult<()> {
        let (ctx, opts) = self.prepare(method::UPDATE_BUCKET, options, None)?;
        let args = vec![Value::from(name), serde_json::to_value(config)?, opts];
        debug!(parent: ctx.span(), bucket = name, "updateBucket: entered");
        self.dispatcher
            .collect(method::UPDATE_BUCKET, args, &ctx)
            .await
            .map(|_| ())
    }

    pub async fn delete_bucket(&self, name: &str, options: &RequestOptions) -> ClientResult<()> {
        let (ctx, opts) = self.prepare(method::DELETE_BUCKET, options, None)?;
        let args = vec![Value::from(name), opts];
        self.dispatcher
            .collect(method::DELETE_BUCKET, args, &ctx)
            .await
            .map(|_| ())
    }

    /// Creates the bucket, or updates it if it already exists.
    ///
    /// This is a get followed by a create or update, not an atomic upsert.
    pub async fn put_bucket(
        &self,
        name: &str,
        config: &BucketConfig,
        options: &RequestOptions,
    ) -> ClientResult<()> {
        match self.get_bucket(name, options).await {
            Ok(_) => self.update_bucket(name, config, options).await,
            Err(err) if err.remote_name() == Some(BUCKET_NOT_FOUND) => {
                self.create_bucket(name, config, options).await
            }
            Err(err) => Err(err),
        }
    }
}
