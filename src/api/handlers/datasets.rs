use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::api::handlers::AppState;
use crate::api::middleware::AppError;
use crate::models::{ListParams, UploadParams};
use crate::services::RoutedIngestion;

const DEFAULT_PAGE_SIZE: usize = 100;
const DEFAULT_PREVIEW_ROWS: usize = 10;

#[derive(Debug, Deserialize)]
pub struct PreviewParams {
    pub limit: Option<usize>,
}

/// Upload a CSV; the storage router picks the columnar or relational path
pub async fn upload_dataset(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> Result<(StatusCode, Json<RoutedIngestion>), AppError> {
    let name = params.name.trim();
    if name.is_empty() {
        return Err(AppError::Validation("Dataset name cannot be empty".to_string()));
    }
    if body.is_empty() {
        return Err(AppError::MalformedInput("Uploaded file is empty".to_string()));
    }

    tracing::info!("Uploading dataset '{}' ({} bytes)", name, body.len());

    let routed = state
        .router
        .route(
            body.to_vec(),
            name,
            params.description.as_deref().filter(|d| !d.trim().is_empty()),
            params.catalog_link.as_deref(),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(routed)))
}

/// List datasets, newest first
pub async fn list_datasets(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let offset = params.offset.unwrap_or(0);
    let limit = params.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    let datasets = state
        .service
        .list(offset, limit, params.search.as_deref())
        .await?;

    Ok(Json(serde_json::json!({
        "datasets": datasets,
        "offset": offset,
        "limit": limit,
    })))
}

pub async fn get_dataset(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let detail = state.service.get(&id).await?;
    Ok(Json(serde_json::json!(detail)))
}

/// Delete a dataset with its file and index entries
pub async fn delete_dataset(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    tracing::info!("Deleting dataset: {}", id);
    state.service.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn preview_dataset(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<PreviewParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let limit = params.limit.unwrap_or(DEFAULT_PREVIEW_ROWS);
    let preview = state.service.preview(&id, limit).await?;
    Ok(Json(serde_json::json!(preview)))
}

/// Check that every column of a dataset made it into the catalog
pub async fn reconcile_dataset(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let report = state.service.reconcile(&id).await?;
    Ok(Json(serde_json::json!(report)))
}

/// Report whether a dataset is stored wide or narrow
pub async fn probe_storage(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let probe = state.router.probe(&id).await?;
    Ok(Json(serde_json::json!(probe)))
}
