use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate;
use crate::api::AppState;
use crate::error::Result;

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub datas3t_name: String,
    pub first_datapoint_index: i64,
    pub last_datapoint_index: i64,
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub aggregate_upload_id: Uuid,
    pub use_direct_put: bool,
    pub presigned_data_put_url: Option<String>,
    pub presigned_multipart_upload_id: Option<String>,
    pub part_urls: Vec<String>,
    pub presigned_index_put_url: String,
    pub total_size_bytes: i64,
}

pub async fn start(State(state): State<Arc<AppState>>, Json(req): Json<StartRequest>) -> Result<impl IntoResponse> {
    let (_, s3) = state.dataset_and_s3(&req.datas3t_name).await?;
    let result = aggregate::start(
        &state.meta,
        &state.cache,
        &s3,
        &req.datas3t_name,
        req.first_datapoint_index,
        req.last_datapoint_index,
    )
    .await?;

    // The worker that actually moves bytes runs detached from the request
    // that started it (§4.7 Execute is worker-driven); spawning it here
    // means the HTTP caller gets its ids back immediately and polls
    // `/aggregate/complete` once the object is in place.
    let spawned_id = result.aggregate_upload_id;
    let meta = state.meta.clone();
    let worker_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = aggregate::execute(&meta, &worker_state.cache, &s3, spawned_id, 4, 3).await {
            tracing::warn!(aggregate_upload_id = %spawned_id, error = %e, "aggregation worker failed");
        }
    });

    Ok(Json(StartResponse {
        aggregate_upload_id: result.aggregate_upload_id,
        use_direct_put: result.use_direct_put,
        presigned_data_put_url: result.presigned_data_put_url,
        presigned_multipart_upload_id: result.presigned_multipart_upload_id,
        part_urls: result.part_urls,
        presigned_index_put_url: result.presigned_index_put_url,
        total_size_bytes: result.total_size_bytes,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub aggregate_upload_id: Uuid,
}

pub async fn complete(State(state): State<Arc<AppState>>, Json(req): Json<CompleteRequest>) -> Result<impl IntoResponse> {
    let row = state.meta.get_aggregate_upload(req.aggregate_upload_id).await?;
    let (_, s3) = state.dataset_and_s3(&row.dataset_name).await?;
    let grace = std::time::Duration::from_secs(state.settings.deletion_grace_seconds as u64);
    aggregate::complete(&state.meta, &s3, req.aggregate_upload_id, grace).await?;
    Ok(axum::http::StatusCode::OK)
}
