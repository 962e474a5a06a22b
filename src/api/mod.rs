//! HTTP surface (§6): a thin axum layer translating JSON requests into
//! calls against the core modules. Every handler borrows `AppState`,
//! which owns the metadata store, the index cache, and a small
//! lazily-populated pool of `S3Capability`s keyed by bucket config name.

mod aggregate;
mod bucket;
mod dataset;
mod download;
mod upload;

use std::collections::HashMap;
use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;

use crate::cache::IndexCache;
use crate::config::Settings;
use crate::crypto;
use crate::db::{Dataset, MetaStore};
use crate::error::Result;
use crate::s3client::{BucketTarget, S3Capability};

pub struct AppState {
    pub meta: MetaStore,
    pub cache: IndexCache,
    pub settings: Arc<Settings>,
    s3_pool: Mutex<HashMap<String, Arc<S3Capability>>>,
}

impl AppState {
    pub fn new(meta: MetaStore, cache: IndexCache, settings: Arc<Settings>) -> Self {
        Self { meta, cache, settings, s3_pool: Mutex::new(HashMap::new()) }
    }

    /// Builds (or reuses) the `S3Capability` for one bucket config,
    /// decrypting its stored credentials on first use.
    pub async fn s3_for_bucket_config(&self, bucket_config_name: &str) -> Result<Arc<S3Capability>> {
        if let Some(existing) = self.s3_pool.lock().await.get(bucket_config_name) {
            return Ok(existing.clone());
        }

        let row = self.meta.get_bucket_config(bucket_config_name).await?;
        let access_key = crypto::decrypt(&self.settings.encryption_key, &row.access_key_encrypted)?;
        let secret_key = crypto::decrypt(&self.settings.encryption_key, &row.secret_key_encrypted)?;
        let target = BucketTarget { endpoint: row.endpoint, bucket: row.bucket, access_key, secret_key };
        let s3 = Arc::new(S3Capability::new(&target).await?);

        self.s3_pool.lock().await.insert(bucket_config_name.to_owned(), s3.clone());
        Ok(s3)
    }

    pub async fn dataset_and_s3(&self, dataset_name: &str) -> Result<(Dataset, Arc<S3Capability>)> {
        let dataset = self.meta.get_dataset(dataset_name).await?;
        let s3 = self.s3_for_bucket_config(&dataset.bucket_config_name).await?;
        Ok((dataset, s3))
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/bucket", post(bucket::create))
        .route("/api/buckets", get(bucket::list))
        .route("/api/datas3t", post(dataset::create))
        .route("/api/datas3t", get(dataset::list))
        .route("/api/datas3t/:name", get(dataset::get))
        .route("/api/datas3t/:name", delete(dataset::delete))
        .route("/api/datas3t/:name/bitmap", get(dataset::bitmap))
        .route("/api/datas3t/import", post(dataset::import))
        .route("/api/datarange/upload/start", post(upload::start))
        .route("/api/datarange/upload/complete", post(upload::complete))
        .route("/api/datarange/upload/cancel", post(upload::cancel))
        .route("/api/download/presign", post(download::presign))
        .route("/api/v1/aggregate", post(aggregate::start))
        .route("/api/v1/aggregate/complete", post(aggregate::complete))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
