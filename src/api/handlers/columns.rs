use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

use crate::api::handlers::AppState;
use crate::api::middleware::AppError;
use crate::models::UpdateColumnDescriptionRequest;

const DEFAULT_COLUMN_PAGE: usize = 100;

#[derive(Debug, Deserialize)]
pub struct ColumnPageParams {
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

/// Page through a dataset's columns
pub async fn list_columns(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<ColumnPageParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let offset = params.offset.unwrap_or(0);
    let limit = params.limit.unwrap_or(DEFAULT_COLUMN_PAGE);
    let columns = state.service.list_columns(&id, offset, limit).await?;

    Ok(Json(serde_json::json!({
        "dataset_id": id,
        "columns": columns,
        "offset": offset,
        "limit": limit,
    })))
}

pub async fn update_column_description(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
    Json(payload): Json<UpdateColumnDescriptionRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    tracing::info!("Updating description of {}.{}", id, name);
    let column = state
        .service
        .update_column_description(&id, &name, payload.description.trim())
        .await?;
    Ok(Json(serde_json::json!(column)))
}

pub async fn get_column_group(
    State(state): State<AppState>,
    Path(group_id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    let group = state.service.get_column_group(group_id).await?;
    Ok(Json(serde_json::json!(group)))
}
