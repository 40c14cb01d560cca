//! Column index backed by a separately run Qdrant service.
//!
//! Vectors come from the in-process embedding model; the collection is created
//! on first use with cosine distance. Points carry `dataset_id` in their payload
//! for filtered search and delete, and their ids derive from dataset and column
//! name so re-indexing a column overwrites its point.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use url::Url;

use super::embedding::Embedder;
use super::remote::{self, RemoteError};
use super::{column_metadata, column_point_id, column_text, match_from_metadata, ColumnIndex};
use crate::api::middleware::AppError;
use crate::config::IndexConfig;
use crate::models::{Column, ColumnMatch};

pub struct QdrantColumnIndex {
    client: reqwest::Client,
    base: Url,
    collection: String,
    embedder: Arc<dyn Embedder>,
    upsert_batch_size: usize,
    max_retries: u32,
    deadline: Duration,
    collection_ready: OnceCell<()>,
}

impl QdrantColumnIndex {
    pub fn from_config(config: &IndexConfig, embedder: Arc<dyn Embedder>) -> Result<Self, AppError> {
        let mut base = Url::parse(&config.qdrant_url).map_err(|e| {
            AppError::Validation(format!("Invalid QDRANT_URL '{}': {}", config.qdrant_url, e))
        })?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let timeout = Duration::from_secs(config.timeout_secs);
        Ok(Self {
            client: remote::build_client(timeout)?,
            base,
            collection: config.qdrant_collection.clone(),
            embedder,
            upsert_batch_size: config.upsert_batch_size.max(1),
            max_retries: config.max_retries,
            deadline: timeout,
            collection_ready: OnceCell::new(),
        })
    }

    fn url(&self, path: &str) -> Result<Url, AppError> {
        self.base
            .join(&format!("collections/{}{}", self.collection, path))
            .map_err(|e| AppError::Internal(format!("Invalid Qdrant URL: {}", e)))
    }

    async fn send(&self, method: reqwest::Method, url: Url, body: Option<&Value>) -> Result<Value, RemoteError> {
        remote::send_json(
            || {
                let request = self.client.request(method.clone(), url.clone());
                match body {
                    Some(body) => request.json(body),
                    None => request,
                }
            },
            self.max_retries,
            self.deadline,
        )
        .await
    }

    /// Create the collection unless it already exists
    async fn ensure_collection(&self) -> Result<(), AppError> {
        self.collection_ready
            .get_or_try_init(|| async {
                match self.send(reqwest::Method::GET, self.url("")?, None).await {
                    Ok(_) => return Ok(()),
                    Err(RemoteError::Status(status, _)) if status == reqwest::StatusCode::NOT_FOUND => {}
                    Err(e) => return Err(e.into_app_error("Qdrant")),
                }

                let body = json!({
                    "vectors": { "size": self.embedder.dims(), "distance": "Cosine" }
                });
                self.send(reqwest::Method::PUT, self.url("")?, Some(&body))
                    .await
                    .map_err(|e| e.into_app_error("Qdrant create collection"))?;

                tracing::info!("Created Qdrant collection {}", self.collection);
                Ok(())
            })
            .await
            .map(|_| ())
    }

    async fn search(&self, query_text: &str, limit: usize, filter: Option<Value>) -> Result<Vec<ColumnMatch>, AppError> {
        self.ensure_collection().await?;
        let vector = self.embedder.embed_query(query_text).await?;
        let body = search_body(vector, limit, filter);

        let response = self
            .send(reqwest::Method::POST, self.url("/points/search")?, Some(&body))
            .await
            .map_err(|e| e.into_app_error("Qdrant search"))?;

        Ok(parse_search_hits(&response))
    }
}

fn dataset_filter(dataset_id: &str) -> Value {
    json!({
        "must": [ { "key": "dataset_id", "match": { "value": dataset_id } } ]
    })
}

fn search_body(vector: Vec<f32>, limit: usize, filter: Option<Value>) -> Value {
    let mut body = json!({
        "vector": vector,
        "limit": limit,
        "with_payload": true,
    });
    if let Some(filter) = filter {
        body["filter"] = filter;
    }
    body
}

/// Points for a batch of columns and their vectors, in column order
fn build_points(dataset_id: &str, columns: &[Column], vectors: Vec<Vec<f32>>) -> Vec<Value> {
    columns
        .iter()
        .zip(vectors)
        .map(|(column, vector)| {
            let text = column_text(column);
            json!({
                "id": column_point_id(dataset_id, &column.name).to_string(),
                "vector": vector,
                "payload": column_metadata(dataset_id, column, &text),
            })
        })
        .collect()
}

fn parse_search_hits(response: &Value) -> Vec<ColumnMatch> {
    response
        .get("result")
        .and_then(Value::as_array)
        .map(|hits| {
            hits.iter()
                .filter_map(|hit| {
                    let score = hit.get("score").and_then(Value::as_f64).unwrap_or(0.0) as f32;
                    match_from_metadata(hit.get("payload")?, score)
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl ColumnIndex for QdrantColumnIndex {
    fn backend_name(&self) -> &'static str {
        "qdrant"
    }

    async fn index_columns(&self, dataset_id: &str, columns: &[Column]) -> Result<usize, AppError> {
        self.ensure_collection().await?;
        let url = self.url("/points?wait=true")?;

        let mut indexed = 0;
        for batch in columns.chunks(self.upsert_batch_size) {
            let texts: Vec<String> = batch.iter().map(column_text).collect();
            let vectors = self.embedder.embed(&texts).await?;
            let points = build_points(dataset_id, batch, vectors);

            self.send(reqwest::Method::PUT, url.clone(), Some(&json!({ "points": points })))
                .await
                .map_err(|e| e.into_app_error("Qdrant upsert"))?;

            indexed += batch.len();
            tracing::debug!("Upserted {}/{} points for dataset {}", indexed, columns.len(), dataset_id);
        }

        tracing::info!("Indexed {} columns for dataset {} in Qdrant", indexed, dataset_id);
        Ok(indexed)
    }

    async fn search_columns(&self, query_text: &str, limit: usize) -> Result<Vec<ColumnMatch>, AppError> {
        self.search(query_text, limit, None).await
    }

    async fn search_dataset_columns(
        &self,
        dataset_id: &str,
        query_text: &str,
        limit: usize,
    ) -> Result<Vec<ColumnMatch>, AppError> {
        self.search(query_text, limit, Some(dataset_filter(dataset_id))).await
    }

    async fn delete_dataset(&self, dataset_id: &str) -> Result<bool, AppError> {
        self.ensure_collection().await?;
        let body = json!({ "filter": dataset_filter(dataset_id) });
        self.send(reqwest::Method::POST, self.url("/points/delete?wait=true")?, Some(&body))
            .await
            .map_err(|e| e.into_app_error("Qdrant delete"))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::ColumnType;
    use crate::services::semantic::embedding::HashingEmbedder;

    fn embedder() -> Arc<dyn Embedder> {
        Arc::new(HashingEmbedder::new(8))
    }

    fn index() -> QdrantColumnIndex {
        let dir = tempfile::tempdir().unwrap();
        QdrantColumnIndex::from_config(&Config::for_tests(dir.path()).index, embedder()).unwrap()
    }

    #[test]
    fn test_collection_urls() {
        let index = index();
        assert_eq!(
            index.url("/points/search").unwrap().as_str(),
            "http://localhost:6333/collections/column_metadata/points/search"
        );
        assert_eq!(
            index.url("/points?wait=true").unwrap().as_str(),
            "http://localhost:6333/collections/column_metadata/points?wait=true"
        );
    }

    #[test]
    fn test_search_body_and_filter() {
        let body = search_body(vec![1.0], 5, Some(dataset_filter("ds-9")));
        assert_eq!(body["limit"], 5);
        assert_eq!(body["with_payload"], true);
        assert_eq!(body["filter"]["must"][0]["match"]["value"], "ds-9");
    }

    #[test]
    fn test_parse_search_hits() {
        let response = json!({
            "result": [
                {"id": "p1", "score": 0.8, "payload": {
                    "dataset_id": "ds-1", "column_name": "bmi", "column_type": "float", "description": "Body mass index"
                }}
            ],
            "status": "ok"
        });
        let hits = parse_search_hits(&response);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].description, "Body mass index");
        assert!(parse_search_hits(&json!({"status": "ok"})).is_empty());
    }

    #[test]
    fn test_reindexed_column_keeps_point_id() {
        let column = Column::new("glucose_level", ColumnType::Float);
        let first = build_points("ds-1", std::slice::from_ref(&column), vec![vec![0.1; 8]]);

        let mut described = column.clone();
        described.description = Some("Fasting blood sugar".to_string());
        let second = build_points("ds-1", &[described], vec![vec![0.2; 8]]);

        assert_eq!(first[0]["id"], second[0]["id"]);
        assert_eq!(second[0]["payload"]["description"], "Fasting blood sugar");
        assert!(uuid::Uuid::parse_str(first[0]["id"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_tests(dir.path()).index;
        config.qdrant_url = "not a url".to_string();
        assert!(matches!(
            QdrantColumnIndex::from_config(&config, embedder()),
            Err(AppError::Validation(_))
        ));
    }
}
