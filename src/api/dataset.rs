use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::error::Result;
use crate::{bitmap, dataset, import};

#[derive(Debug, Deserialize)]
pub struct CreateDatasetRequest {
    pub name: String,
    pub bucket: String,
}

pub async fn create(State(state): State<Arc<AppState>>, Json(req): Json<CreateDatasetRequest>) -> Result<impl IntoResponse> {
    state.meta.create_dataset(&req.name, &req.bucket).await?;
    Ok((axum::http::StatusCode::CREATED, Json(serde_json::json!({ "name": req.name }))))
}

#[derive(Debug, Serialize)]
pub struct DatasetSummary {
    pub name: String,
    pub bucket_config_name: String,
    pub datarange_count: i64,
    pub total_datapoints: i64,
    pub min_key: Option<i64>,
    pub max_key: Option<i64>,
    pub total_bytes: i64,
}

pub async fn list(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    let datasets = state.meta.list_datasets().await?;
    let mut summaries = Vec::with_capacity(datasets.len());
    for d in datasets {
        let stats = state.meta.dataset_stats(&d.name).await?;
        summaries.push(DatasetSummary {
            name: d.name,
            bucket_config_name: d.bucket_config_name,
            datarange_count: stats.datarange_count,
            total_datapoints: stats.total_datapoints,
            min_key: stats.min_key,
            max_key: stats.max_key,
            total_bytes: stats.total_bytes,
        });
    }
    Ok(Json(summaries))
}

pub async fn get(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Result<impl IntoResponse> {
    let d = state.meta.get_dataset(&name).await?;
    let stats = state.meta.dataset_stats(&name).await?;
    Ok(Json(DatasetSummary {
        name: d.name,
        bucket_config_name: d.bucket_config_name,
        datarange_count: stats.datarange_count,
        total_datapoints: stats.total_datapoints,
        min_key: stats.min_key,
        max_key: stats.max_key,
        total_bytes: stats.total_bytes,
    }))
}

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub clear: bool,
}

pub async fn delete(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<impl IntoResponse> {
    if query.clear {
        let (_, s3) = state.dataset_and_s3(&name).await?;
        dataset::clear(&state.meta, &s3, &name).await?;
    } else {
        state.meta.delete_dataset(&name).await?;
    }
    Ok(axum::http::StatusCode::NO_CONTENT)
}

pub async fn bitmap(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Result<impl IntoResponse> {
    let bytes = bitmap::build(&state.meta, &name).await?;
    Ok(([(axum::http::header::CONTENT_TYPE, "application/octet-stream")], bytes))
}

#[derive(Debug, Deserialize)]
pub struct ImportRequest {
    pub bucket: String,
}

#[derive(Debug, Serialize)]
pub struct ImportResponse {
    pub datasets_created: usize,
    pub dataranges_created: usize,
}

pub async fn import(State(state): State<Arc<AppState>>, Json(req): Json<ImportRequest>) -> Result<impl IntoResponse> {
    let s3 = state.s3_for_bucket_config(&req.bucket).await?;
    let summary = import::import_bucket(&state.meta, &s3, &req.bucket).await?;
    Ok(Json(ImportResponse { datasets_created: summary.datasets_created, dataranges_created: summary.dataranges_created }))
}
