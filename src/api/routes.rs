use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::handlers::{columns, datasets, query, AppState};

/// Create router with application state
pub fn create_router_with_state(state: AppState) -> Router {
    let upload_limit = state.config.max_upload_bytes();

    Router::new()
        .route("/health", get(health_check))
        .route("/api/datasets", get(datasets::list_datasets))
        .route(
            "/api/datasets/upload",
            post(datasets::upload_dataset).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route(
            "/api/datasets/{id}",
            get(datasets::get_dataset).delete(datasets::delete_dataset),
        )
        .route("/api/datasets/{id}/preview", get(datasets::preview_dataset))
        .route("/api/datasets/{id}/reconcile", get(datasets::reconcile_dataset))
        .route("/api/datasets/{id}/storage", get(datasets::probe_storage))
        .route("/api/datasets/{id}/columns", get(columns::list_columns))
        .route(
            "/api/datasets/{id}/columns/{name}/description",
            put(columns::update_column_description),
        )
        .route("/api/datasets/{id}/query", post(query::query_dataset))
        .route("/api/columns/recommend", post(query::recommend_columns))
        .route("/api/column-groups/{id}", get(columns::get_column_group))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}
