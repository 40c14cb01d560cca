//! Hosted column index: OpenAI embeddings stored in a Pinecone index.
//!
//! Talks to the index data plane over REST (`/vectors/upsert`, `/query`,
//! `/vectors/delete`). Every vector carries `dataset_id` metadata so searches
//! and deletes can filter on it.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;

use super::embedding::{Embedder, OpenAiEmbedder};
use super::remote::{self, RemoteError};
use super::upsert::{upsert_with_halving, BatchSink, UpsertFailure};
use super::{column_metadata, column_point_id, column_text, match_from_metadata, ColumnIndex};
use crate::api::middleware::AppError;
use crate::config::IndexConfig;
use crate::models::{Column, ColumnMatch};

const MAX_ID_PART_LEN: usize = 30;

pub struct PineconeColumnIndex {
    client: reqwest::Client,
    host: Url,
    api_key: String,
    namespace: String,
    embedder: Box<dyn Embedder>,
    upsert_batch_size: usize,
    max_retries: u32,
    deadline: Duration,
}

impl PineconeColumnIndex {
    pub fn from_config(config: &IndexConfig) -> Result<Self, AppError> {
        let api_key = config
            .pinecone_api_key
            .clone()
            .ok_or_else(|| AppError::Validation("PINECONE_API_KEY is required for the pinecone backend".to_string()))?;
        let host = config
            .pinecone_host
            .as_deref()
            .ok_or_else(|| AppError::Validation("PINECONE_HOST is required for the pinecone backend".to_string()))?;
        let openai_key = config
            .openai_api_key
            .clone()
            .ok_or_else(|| AppError::Validation("OPENAI_API_KEY is required for the pinecone backend".to_string()))?;

        let timeout = Duration::from_secs(config.timeout_secs);
        let embedder = OpenAiEmbedder::new(openai_key, &config.embedding_model, timeout, config.max_retries)?;

        Ok(Self {
            client: remote::build_client(timeout)?,
            host: parse_host(host)?,
            api_key,
            namespace: config.pinecone_namespace.clone(),
            embedder: Box::new(embedder),
            upsert_batch_size: config.upsert_batch_size,
            max_retries: config.max_retries,
            deadline: timeout,
        })
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, RemoteError> {
        let url = self
            .host
            .join(path)
            .map_err(|e| RemoteError::Transport(format!("invalid Pinecone URL: {}", e)))?;

        remote::send_json(
            || {
                self.client
                    .post(url.clone())
                    .header("Api-Key", &self.api_key)
                    .json(body)
            },
            self.max_retries,
            self.deadline,
        )
        .await
    }

    async fn query(&self, query_text: &str, limit: usize, filter: Option<Value>) -> Result<Vec<ColumnMatch>, AppError> {
        let vector = self.embedder.embed_query(query_text).await?;
        let body = query_body(&self.namespace, vector, limit, filter);

        let response = self
            .post("query", &body)
            .await
            .map_err(|e| e.into_app_error("Pinecone query"))?;

        Ok(parse_query_matches(&response))
    }
}

fn parse_host(host: &str) -> Result<Url, AppError> {
    let with_scheme = if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{}", host)
    };
    let mut url = Url::parse(&with_scheme)
        .map_err(|e| AppError::Validation(format!("Invalid PINECONE_HOST '{}': {}", host, e)))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// ASCII-only id fragment: `[A-Za-z0-9_]`, at most 30 chars, never empty
fn sanitize_id_part(text: &str) -> String {
    let sanitized: String = text
        .chars()
        .filter(|c| c.is_ascii() && !c.is_ascii_control())
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .take(MAX_ID_PART_LEN)
        .collect();

    if sanitized.is_empty() {
        "column".to_string()
    } else {
        sanitized
    }
}

/// Sanitized parts plus a hash of the unsanitized pair, so names that
/// sanitize alike stay distinct and re-indexing overwrites the same vector
fn vector_id(dataset_id: &str, column_name: &str) -> String {
    let suffix = column_point_id(dataset_id, column_name).simple().to_string();
    format!(
        "{}_{}_{}",
        sanitize_id_part(dataset_id),
        sanitize_id_part(column_name),
        &suffix[..8]
    )
}

fn dataset_filter(dataset_id: &str) -> Value {
    json!({ "dataset_id": { "$eq": dataset_id } })
}

fn query_body(namespace: &str, vector: Vec<f32>, limit: usize, filter: Option<Value>) -> Value {
    let mut body = json!({
        "vector": vector,
        "topK": limit,
        "includeMetadata": true,
        "namespace": namespace,
    });
    if let Some(filter) = filter {
        body["filter"] = filter;
    }
    body
}

fn parse_query_matches(response: &Value) -> Vec<ColumnMatch> {
    response
        .get("matches")
        .and_then(Value::as_array)
        .map(|matches| {
            matches
                .iter()
                .filter_map(|m| {
                    let score = m.get("score").and_then(Value::as_f64).unwrap_or(0.0) as f32;
                    match_from_metadata(m.get("metadata")?, score)
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl BatchSink<Value> for PineconeColumnIndex {
    async fn send_batch(&self, batch: &[Value]) -> Result<(), UpsertFailure> {
        let body = json!({ "vectors": batch, "namespace": self.namespace });
        match self.post("vectors/upsert", &body).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_oversized() => Err(UpsertFailure::Oversized(format!("{:?}", e))),
            Err(e) => Err(UpsertFailure::Failed(e.into_app_error("Pinecone upsert"))),
        }
    }
}

#[async_trait]
impl ColumnIndex for PineconeColumnIndex {
    fn backend_name(&self) -> &'static str {
        "pinecone"
    }

    async fn index_columns(&self, dataset_id: &str, columns: &[Column]) -> Result<usize, AppError> {
        let texts: Vec<String> = columns.iter().map(column_text).collect();
        let embeddings = self.embedder.embed(&texts).await?;

        let vectors: Vec<Value> = columns
            .iter()
            .zip(texts.iter())
            .zip(embeddings)
            .map(|((column, text), values)| {
                json!({
                    "id": vector_id(dataset_id, &column.name),
                    "values": values,
                    "metadata": column_metadata(dataset_id, column, text),
                })
            })
            .collect();

        let report = upsert_with_halving(self, &vectors, self.upsert_batch_size).await?;
        if report.skipped > 0 {
            tracing::warn!(
                "Skipped {} oversized vectors for dataset {}",
                report.skipped,
                dataset_id
            );
        }

        tracing::info!("Indexed {} columns for dataset {} in Pinecone", report.upserted, dataset_id);
        Ok(report.upserted)
    }

    async fn search_columns(&self, query_text: &str, limit: usize) -> Result<Vec<ColumnMatch>, AppError> {
        self.query(query_text, limit, None).await
    }

    async fn search_dataset_columns(
        &self,
        dataset_id: &str,
        query_text: &str,
        limit: usize,
    ) -> Result<Vec<ColumnMatch>, AppError> {
        self.query(query_text, limit, Some(dataset_filter(dataset_id))).await
    }

    async fn delete_dataset(&self, dataset_id: &str) -> Result<bool, AppError> {
        let body = json!({
            "filter": dataset_filter(dataset_id),
            "namespace": self.namespace,
        });
        self.post("vectors/delete", &body)
            .await
            .map_err(|e| e.into_app_error("Pinecone delete"))?;

        tracing::info!("Deleted vectors for dataset {} from Pinecone", dataset_id);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ColumnType;

    #[test]
    fn test_sanitize_id_part() {
        assert_eq!(sanitize_id_part("patient age"), "patient_age");
        assert_eq!(sanitize_id_part("température"), "temprature");
        assert_eq!(sanitize_id_part("日本"), "column");
        assert_eq!(sanitize_id_part(&"x".repeat(50)).len(), MAX_ID_PART_LEN);
    }

    #[test]
    fn test_vector_id_shape() {
        let id = vector_id("3f2a-uuid", "Blood Pressure");
        assert!(id.starts_with("3f2a_uuid_Blood_Pressure_"));
        assert!(id.is_ascii());
    }

    #[test]
    fn test_vector_id_is_stable_and_distinct() {
        assert_eq!(vector_id("ds-1", "Blood Pressure"), vector_id("ds-1", "Blood Pressure"));
        // both sanitize to "Blood_Pressure"
        assert_ne!(vector_id("ds-1", "Blood Pressure"), vector_id("ds-1", "Blood-Pressure"));
        assert_ne!(vector_id("ds-1", "age"), vector_id("ds-2", "age"));
    }

    #[test]
    fn test_parse_host_adds_scheme_and_slash() {
        let url = parse_host("my-index-abc.svc.pinecone.io").unwrap();
        assert_eq!(url.as_str(), "https://my-index-abc.svc.pinecone.io/");
        assert_eq!(
            url.join("vectors/upsert").unwrap().as_str(),
            "https://my-index-abc.svc.pinecone.io/vectors/upsert"
        );
    }

    #[test]
    fn test_query_body_with_filter() {
        let body = query_body("default", vec![0.5, 0.5], 5, Some(dataset_filter("ds-1")));
        assert_eq!(body["topK"], 5);
        assert_eq!(body["filter"]["dataset_id"]["$eq"], "ds-1");

        let unfiltered = query_body("default", vec![0.5], 3, None);
        assert!(unfiltered.get("filter").is_none());
    }

    #[test]
    fn test_parse_query_matches() {
        let response = json!({
            "matches": [
                {"id": "a", "score": 0.91, "metadata": {
                    "dataset_id": "ds-1", "column_name": "age", "column_type": "integer", "description": ""
                }},
                {"id": "b", "score": 0.5}
            ]
        });
        let matches = parse_query_matches(&response);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].column_name, "age");
        assert_eq!(matches[0].column_type, ColumnType::Integer);
        assert!((matches[0].score - 0.91).abs() < 1e-6);
    }

    #[test]
    fn test_from_config_requires_host() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = crate::config::Config::for_tests(dir.path()).index;
        config.pinecone_api_key = Some("key".to_string());
        config.openai_api_key = Some("key".to_string());
        assert!(matches!(
            PineconeColumnIndex::from_config(&config),
            Err(AppError::Validation(_))
        ));

        config.pinecone_host = Some("idx.svc.pinecone.io".to_string());
        assert!(PineconeColumnIndex::from_config(&config).is_ok());
    }
}
