use axum::{
    extract::{Path, State},
    Json,
};

use crate::api::handlers::AppState;
use crate::api::middleware::AppError;
use crate::models::{QueryRequest, QueryResponse, RecommendRequest};

const DEFAULT_RESULT_ROWS: usize = 100;
const DEFAULT_RECOMMENDATIONS: usize = 10;

/// Run SQL or a natural-language question against one dataset
pub async fn query_dataset(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    tracing::info!("Querying dataset: {}", id);

    let query_text = payload.query_text.trim();
    if query_text.is_empty() {
        return Err(AppError::Validation("Query cannot be empty".to_string()));
    }

    let limit = payload.limit.unwrap_or(DEFAULT_RESULT_ROWS).max(1);
    let response = state.service.query(&id, query_text, limit).await?;
    Ok(Json(response))
}

/// Columns across all datasets that best match a question
pub async fn recommend_columns(
    State(state): State<AppState>,
    Json(payload): Json<RecommendRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let query_text = payload.query_text.trim();
    if query_text.is_empty() {
        return Err(AppError::Validation("Query cannot be empty".to_string()));
    }

    let limit = payload.limit.unwrap_or(DEFAULT_RECOMMENDATIONS);
    let columns = state.service.recommend_columns(query_text, limit).await?;

    Ok(Json(serde_json::json!({
        "query": query_text,
        "columns": columns,
    })))
}
