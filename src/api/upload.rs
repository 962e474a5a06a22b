use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::AppState;
use crate::error::Result;
use crate::upload::{self, PartId};

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub datas3t_name: String,
    pub first_datapoint_index: i64,
    pub number_of_datapoints: i64,
    pub claimed_size_bytes: i64,
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub upload_id: Uuid,
    pub use_direct_put: bool,
    pub presigned_data_put_url: Option<String>,
    pub presigned_multipart_upload_id: Option<String>,
    pub part_urls: Vec<String>,
    pub presigned_index_put_url: String,
}

pub async fn start(State(state): State<Arc<AppState>>, Json(req): Json<StartRequest>) -> Result<impl IntoResponse> {
    let (_, s3) = state.dataset_and_s3(&req.datas3t_name).await?;
    let result = upload::start(
        &state.meta,
        &s3,
        &req.datas3t_name,
        req.first_datapoint_index,
        req.number_of_datapoints,
        req.claimed_size_bytes,
    )
    .await?;

    Ok(Json(StartResponse {
        upload_id: result.upload_id,
        use_direct_put: result.use_direct_put,
        presigned_data_put_url: result.presigned_data_put_url,
        presigned_multipart_upload_id: result.presigned_multipart_upload_id,
        part_urls: result.part_urls,
        presigned_index_put_url: result.presigned_index_put_url,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub datarange_upload_id: Uuid,
    #[serde(default)]
    pub part_ids: Vec<CompletePartIdRequest>,
}

#[derive(Debug, Deserialize)]
pub struct CompletePartIdRequest {
    pub part_number: i32,
    pub e_tag: String,
}

pub async fn complete(State(state): State<Arc<AppState>>, Json(req): Json<CompleteRequest>) -> Result<impl IntoResponse> {
    let row = state.meta.get_datarange_upload(req.datarange_upload_id).await?;
    let (_, s3) = state.dataset_and_s3(&row.dataset_name).await?;
    let parts = req.part_ids.into_iter().map(|p| PartId { part_number: p.part_number, e_tag: p.e_tag }).collect();
    let grace = std::time::Duration::from_secs(state.settings.deletion_grace_seconds as u64);
    upload::complete(&state.meta, &s3, req.datarange_upload_id, parts, grace).await?;
    Ok(axum::http::StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub datarange_upload_id: Uuid,
}

pub async fn cancel(State(state): State<Arc<AppState>>, Json(req): Json<CancelRequest>) -> Result<impl IntoResponse> {
    let row = state.meta.get_datarange_upload(req.datarange_upload_id).await?;
    let (_, s3) = state.dataset_and_s3(&row.dataset_name).await?;
    let grace = std::time::Duration::from_secs(state.settings.deletion_grace_seconds as u64);
    upload::cancel(&state.meta, &s3, req.datarange_upload_id, grace).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}
