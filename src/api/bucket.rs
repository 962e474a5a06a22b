use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::crypto;
use crate::error::Result;

#[derive(Debug, Deserialize)]
pub struct CreateBucketConfigRequest {
    pub name: String,
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
}

pub async fn create(State(state): State<Arc<AppState>>, Json(req): Json<CreateBucketConfigRequest>) -> Result<impl IntoResponse> {
    let access_key_encrypted = crypto::encrypt(&state.settings.encryption_key, &req.access_key)?;
    let secret_key_encrypted = crypto::encrypt(&state.settings.encryption_key, &req.secret_key)?;
    state
        .meta
        .create_bucket_config(&req.name, &req.endpoint, &req.bucket, &access_key_encrypted, &secret_key_encrypted)
        .await?;
    Ok((axum::http::StatusCode::CREATED, Json(serde_json::json!({ "name": req.name }))))
}

#[derive(Debug, Serialize)]
pub struct BucketConfigSummary {
    pub name: String,
    pub endpoint: String,
    pub bucket: String,
}

pub async fn list(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    let rows = state.meta.list_bucket_configs().await?;
    let summaries: Vec<BucketConfigSummary> =
        rows.into_iter().map(|r| BucketConfigSummary { name: r.name, endpoint: r.endpoint, bucket: r.bucket }).collect();
    Ok(Json(summaries))
}
