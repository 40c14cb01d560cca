//! Semantic column index.
//!
//! Columns are embedded from a short descriptive text and searched by vector
//! similarity. Three backends share the [`ColumnIndex`] trait:
//! - **local**: in-process embedding model, cosine scan, one JSON file per dataset
//! - **pinecone**: OpenAI embeddings with a hosted Pinecone index
//! - **qdrant**: in-process embedding model with a separately run Qdrant collection
//!
//! The backend is picked once at startup by [`create_column_index`].

pub mod embedding;
pub mod local;
pub mod pinecone;
pub mod qdrant;
pub mod remote;
pub mod upsert;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::api::middleware::AppError;
use crate::config::Config;
use crate::models::{Column, ColumnMatch, ColumnType};

pub use embedding::{create_local_embedder, Embedder, HashingEmbedder, OpenAiEmbedder};
pub use local::LocalColumnIndex;
pub use pinecone::PineconeColumnIndex;
pub use qdrant::QdrantColumnIndex;

/// How many global hits to fetch per requested hit when a backend has no
/// native dataset filter
const DATASET_OVERFETCH: usize = 20;

#[async_trait]
pub trait ColumnIndex: Send + Sync {
    /// Backend identifier, as configured
    fn backend_name(&self) -> &'static str;

    /// Embed and store every column of a dataset; returns how many were indexed
    async fn index_columns(&self, dataset_id: &str, columns: &[Column]) -> Result<usize, AppError>;

    /// Best matches across all datasets, highest score first
    async fn search_columns(&self, query_text: &str, limit: usize) -> Result<Vec<ColumnMatch>, AppError>;

    /// Best matches within one dataset, highest score first
    async fn search_dataset_columns(
        &self,
        dataset_id: &str,
        query_text: &str,
        limit: usize,
    ) -> Result<Vec<ColumnMatch>, AppError> {
        let fetched = self
            .search_columns(query_text, limit.saturating_mul(DATASET_OVERFETCH))
            .await?;
        Ok(fetched
            .into_iter()
            .filter(|m| m.dataset_id == dataset_id)
            .take(limit)
            .collect())
    }

    /// Drop every record of a dataset
    async fn delete_dataset(&self, dataset_id: &str) -> Result<bool, AppError>;
}

/// Text embedded for a column: `Column <name>[: <detail>] (Type: <type>)`.
///
/// The detail is the column description, or the name split into words when
/// it has more than one.
pub fn column_text(column: &Column) -> String {
    let mut text = format!("Column {}", column.name);

    match column.description.as_deref().filter(|d| !d.is_empty()) {
        Some(description) => {
            text.push_str(": ");
            text.push_str(description);
        }
        None => {
            let words: Vec<&str> = column
                .name
                .split(|c: char| c == '_' || c == '-' || c.is_whitespace())
                .filter(|w| !w.is_empty())
                .collect();
            if words.len() > 1 {
                text.push_str(": ");
                text.push_str(&words.join(" "));
            }
        }
    }

    text.push_str(&format!(" (Type: {})", column.column_type));
    text
}

/// Stable point id of one column, so re-indexing overwrites instead of duplicating
pub fn column_point_id(dataset_id: &str, column_name: &str) -> uuid::Uuid {
    let key = format!("{}/{}", dataset_id, column_name);
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, key.as_bytes())
}

/// Metadata stored next to every vector
pub(crate) fn column_metadata(dataset_id: &str, column: &Column, text: &str) -> Value {
    serde_json::json!({
        "dataset_id": dataset_id,
        "column_name": column.name,
        "column_type": column.column_type.as_str(),
        "description": column.description.clone().unwrap_or_default(),
        "text": text,
    })
}

/// Rebuild a match from stored metadata; records missing required keys are skipped
pub(crate) fn match_from_metadata(metadata: &Value, score: f32) -> Option<ColumnMatch> {
    let dataset_id = metadata.get("dataset_id")?.as_str()?;
    let column_name = metadata.get("column_name")?.as_str()?;
    let column_type = metadata
        .get("column_type")
        .and_then(Value::as_str)
        .and_then(ColumnType::parse)
        .unwrap_or(ColumnType::Text);
    let description = metadata
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or_default();

    Some(ColumnMatch {
        dataset_id: dataset_id.to_string(),
        column_name: column_name.to_string(),
        column_type,
        description: description.to_string(),
        score,
    })
}

/// Sort matches by descending score and keep the top `limit`
pub(crate) fn rank(mut matches: Vec<ColumnMatch>, limit: usize) -> Vec<ColumnMatch> {
    matches.sort_by(|a, b| b.score.total_cmp(&a.score));
    matches.truncate(limit);
    matches
}

/// Build the configured backend
pub async fn create_column_index(config: &Config) -> Result<Arc<dyn ColumnIndex>, AppError> {
    let index = &config.index;
    match index.backend.as_str() {
        "local" => {
            let embedder = create_local_embedder(index, &config.model_cache_path()).await?;
            let dir = config.storage.root.join("vector_store");
            let local = LocalColumnIndex::open(dir, embedder).await?;
            Ok(Arc::new(local))
        }
        "pinecone" => Ok(Arc::new(PineconeColumnIndex::from_config(index)?)),
        "qdrant" => {
            let embedder = create_local_embedder(index, &config.model_cache_path()).await?;
            Ok(Arc::new(QdrantColumnIndex::from_config(index, embedder)?))
        }
        other => Err(AppError::Validation(format!(
            "Unknown vector store type '{}'; expected local, pinecone or qdrant",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_column_text_with_description() {
        let mut column = Column::new("age", ColumnType::Integer);
        column.description = Some("Patient age in years".to_string());
        assert_eq!(column_text(&column), "Column age: Patient age in years (Type: integer)");
    }

    #[test]
    fn test_column_text_splits_multi_word_names() {
        let column = Column::new("blood_pressure_sys", ColumnType::Float);
        assert_eq!(
            column_text(&column),
            "Column blood_pressure_sys: blood pressure sys (Type: float)"
        );

        let single = Column::new("height", ColumnType::Float);
        assert_eq!(column_text(&single), "Column height (Type: float)");
    }

    #[test]
    fn test_match_from_metadata() {
        let column = Column::new("weight_kg", ColumnType::Float);
        let metadata = column_metadata("ds-1", &column, &column_text(&column));
        let m = match_from_metadata(&metadata, 0.75).unwrap();
        assert_eq!(m.dataset_id, "ds-1");
        assert_eq!(m.column_type, ColumnType::Float);
        assert_eq!(m.description, "");

        assert!(match_from_metadata(&serde_json::json!({"column_name": "x"}), 0.1).is_none());
    }

    #[test]
    fn test_rank_orders_descending() {
        let make = |score| ColumnMatch {
            dataset_id: "d".to_string(),
            column_name: format!("c{}", score),
            column_type: ColumnType::Text,
            description: String::new(),
            score,
        };
        let ranked = rank(vec![make(0.2), make(0.9), make(0.5)], 2);
        let scores: Vec<f32> = ranked.iter().map(|m| m.score).collect();
        assert_eq!(scores, vec![0.9, 0.5]);
    }

    #[test]
    fn test_column_point_id_is_stable() {
        assert_eq!(column_point_id("ds-1", "age"), column_point_id("ds-1", "age"));
        assert_ne!(column_point_id("ds-1", "age"), column_point_id("ds-2", "age"));
        assert_ne!(column_point_id("ds-1", "age"), column_point_id("ds-1", "age_2"));
    }

    #[tokio::test]
    async fn test_create_local_backend() {
        let dir = tempdir().unwrap();
        let config = Config::for_tests(dir.path());
        let index = create_column_index(&config).await.unwrap();
        assert_eq!(index.backend_name(), "local");
    }

    #[tokio::test]
    async fn test_unknown_backend_is_rejected() {
        let dir = tempdir().unwrap();
        let mut config = Config::for_tests(dir.path());
        config.index.backend = "faiss".to_string();
        assert!(matches!(
            create_column_index(&config).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_pinecone_requires_credentials() {
        let dir = tempdir().unwrap();
        let mut config = Config::for_tests(dir.path());
        config.index.backend = "pinecone".to_string();
        assert!(matches!(
            create_column_index(&config).await,
            Err(AppError::Validation(_))
        ));
    }
}
