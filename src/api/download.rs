use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::download::plan_download;
use crate::error::Result;

#[derive(Debug, Deserialize)]
pub struct PresignRequest {
    pub datas3t_name: String,
    pub first_datapoint: i64,
    pub last_datapoint: i64,
}

#[derive(Debug, Serialize)]
pub struct SegmentResponse {
    pub presigned_url: String,
    pub range: String,
}

#[derive(Debug, Serialize)]
pub struct PresignResponse {
    pub segments: Vec<SegmentResponse>,
}

pub async fn presign(State(state): State<Arc<AppState>>, Json(req): Json<PresignRequest>) -> Result<impl IntoResponse> {
    let (_, s3) = state.dataset_and_s3(&req.datas3t_name).await?;
    let segments = plan_download(&state.meta, &state.cache, &s3, &req.datas3t_name, req.first_datapoint, req.last_datapoint).await?;

    let segments = segments
        .into_iter()
        .map(|s| SegmentResponse { presigned_url: s.presigned_url, range: format!("{}-{}", s.start, s.end) })
        .collect();

    Ok(Json(PresignResponse { segments }))
}
