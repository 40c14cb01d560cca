//! In-process column index.
//!
//! Vectors live in memory and are replicated to one JSON file per dataset under
//! the index directory. Existing files are loaded when the index is opened.
//! Search is a brute-force cosine scan.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::embedding::{cosine_similarity, Embedder};
use super::{column_point_id, column_text, rank, ColumnIndex};
use crate::api::middleware::AppError;
use crate::models::{Column, ColumnMatch, ColumnType};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexedColumn {
    id: String,
    column_name: String,
    column_type: ColumnType,
    description: String,
    text: String,
    vector: Vec<f32>,
}

/// On-disk replica of one dataset's vectors
#[derive(Debug, Serialize, Deserialize)]
struct DatasetIndexFile {
    dataset_id: String,
    model: String,
    columns: Vec<IndexedColumn>,
}

pub struct LocalColumnIndex {
    embedder: Arc<dyn Embedder>,
    dir: PathBuf,
    datasets: RwLock<HashMap<String, Vec<IndexedColumn>>>,
}

impl LocalColumnIndex {
    /// Open the index rooted at `dir`, loading every dataset file found there
    pub async fn open(dir: impl Into<PathBuf>, embedder: Arc<dyn Embedder>) -> Result<Self, AppError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to create {}: {}", dir.display(), e)))?;

        let mut datasets = HashMap::new();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to read {}: {}", dir.display(), e)))?;

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().map(|ext| ext != "json").unwrap_or(true) {
                continue;
            }
            match load_file(&path, embedder.dims()).await {
                Ok(file) => {
                    datasets.insert(file.dataset_id, file.columns);
                }
                Err(e) => tracing::warn!("Skipping index file {}: {}", path.display(), e),
            }
        }

        tracing::info!(
            "Local column index loaded {} datasets from {}",
            datasets.len(),
            dir.display()
        );

        Ok(Self {
            embedder,
            dir,
            datasets: RwLock::new(datasets),
        })
    }

    fn file_path(&self, dataset_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", dataset_id))
    }

    async fn persist(&self, dataset_id: &str, columns: &[IndexedColumn]) -> Result<(), AppError> {
        let file = DatasetIndexFile {
            dataset_id: dataset_id.to_string(),
            model: self.embedder.model_name().to_string(),
            columns: columns.to_vec(),
        };
        let bytes = serde_json::to_vec(&file)
            .map_err(|e| AppError::Internal(format!("Failed to serialize index: {}", e)))?;
        tokio::fs::write(self.file_path(dataset_id), bytes)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to write index file: {}", e)))
    }

    fn score(&self, query: &[f32], dataset_id: &str, columns: &[IndexedColumn]) -> Vec<ColumnMatch> {
        columns
            .iter()
            .map(|c| ColumnMatch {
                dataset_id: dataset_id.to_string(),
                column_name: c.column_name.clone(),
                column_type: c.column_type,
                description: c.description.clone(),
                score: cosine_similarity(query, &c.vector),
            })
            .collect()
    }
}

async fn load_file(path: &Path, dims: usize) -> anyhow::Result<DatasetIndexFile> {
    let bytes = tokio::fs::read(path).await?;
    let file: DatasetIndexFile = serde_json::from_slice(&bytes)?;
    if let Some(bad) = file.columns.iter().find(|c| c.vector.len() != dims) {
        anyhow::bail!(
            "vector for {} has {} dims, expected {}",
            bad.column_name,
            bad.vector.len(),
            dims
        );
    }
    Ok(file)
}

#[async_trait]
impl ColumnIndex for LocalColumnIndex {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    async fn index_columns(&self, dataset_id: &str, columns: &[Column]) -> Result<usize, AppError> {
        let texts: Vec<String> = columns.iter().map(column_text).collect();
        let vectors = self.embedder.embed(&texts).await?;

        let indexed: Vec<IndexedColumn> = columns
            .iter()
            .zip(texts)
            .zip(vectors)
            .map(|((column, text), vector)| IndexedColumn {
                id: column_point_id(dataset_id, &column.name).to_string(),
                column_name: column.name.clone(),
                column_type: column.column_type,
                description: column.description.clone().unwrap_or_default(),
                text,
                vector,
            })
            .collect();

        let mut datasets = self.datasets.write().await;
        // Re-indexing a column replaces its previous vector
        let mut entry: Vec<IndexedColumn> = datasets
            .get(dataset_id)
            .map(|existing| {
                existing
                    .iter()
                    .filter(|c| !indexed.iter().any(|new| new.column_name == c.column_name))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        entry.extend(indexed);

        // The in-memory view only changes once the file is written
        self.persist(dataset_id, &entry).await?;
        datasets.insert(dataset_id.to_string(), entry);

        tracing::info!("Indexed {} columns for dataset {}", columns.len(), dataset_id);
        Ok(columns.len())
    }

    async fn search_columns(&self, query_text: &str, limit: usize) -> Result<Vec<ColumnMatch>, AppError> {
        let query = self.embedder.embed_query(query_text).await?;
        let datasets = self.datasets.read().await;

        let matches = datasets
            .iter()
            .flat_map(|(dataset_id, columns)| self.score(&query, dataset_id, columns))
            .collect();
        Ok(rank(matches, limit))
    }

    async fn search_dataset_columns(
        &self,
        dataset_id: &str,
        query_text: &str,
        limit: usize,
    ) -> Result<Vec<ColumnMatch>, AppError> {
        let query = self.embedder.embed_query(query_text).await?;
        let datasets = self.datasets.read().await;

        let matches = datasets
            .get(dataset_id)
            .map(|columns| self.score(&query, dataset_id, columns))
            .unwrap_or_default();
        Ok(rank(matches, limit))
    }

    async fn delete_dataset(&self, dataset_id: &str) -> Result<bool, AppError> {
        let removed = self.datasets.write().await.remove(dataset_id).is_some();

        match tokio::fs::remove_file(self.file_path(dataset_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(AppError::Internal(format!(
                    "Failed to remove index file for {}: {}",
                    dataset_id, e
                )))
            }
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::semantic::embedding::HashingEmbedder;
    use tempfile::tempdir;

    fn hashing(dims: usize) -> Arc<dyn Embedder> {
        Arc::new(HashingEmbedder::new(dims))
    }

    fn columns() -> Vec<Column> {
        vec![
            Column::new("patient_age", ColumnType::Integer),
            Column::new("glucose_level", ColumnType::Float),
            Column::new("diagnosis_code", ColumnType::Text),
        ]
    }

    #[tokio::test]
    async fn test_search_ranks_relevant_column_first() {
        let dir = tempdir().unwrap();
        let index = LocalColumnIndex::open(dir.path(), hashing(384)).await.unwrap();
        assert_eq!(index.index_columns("ds-1", &columns()).await.unwrap(), 3);

        let matches = index.search_columns("average glucose level", 3).await.unwrap();
        assert_eq!(matches.len(), 3);
        assert_eq!(matches[0].column_name, "glucose_level");
        assert!(matches.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn test_dataset_scoped_search() {
        let dir = tempdir().unwrap();
        let index = LocalColumnIndex::open(dir.path(), hashing(384)).await.unwrap();
        index.index_columns("ds-1", &columns()).await.unwrap();
        index
            .index_columns("ds-2", &[Column::new("glucose_level", ColumnType::Float)])
            .await
            .unwrap();

        let matches = index
            .search_dataset_columns("ds-2", "glucose", 5)
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].dataset_id, "ds-2");
    }

    #[tokio::test]
    async fn test_reopen_loads_persisted_files() {
        let dir = tempdir().unwrap();
        {
            let index = LocalColumnIndex::open(dir.path(), hashing(64)).await.unwrap();
            index.index_columns("ds-1", &columns()).await.unwrap();
        }
        assert!(dir.path().join("ds-1.json").exists());

        let reopened = LocalColumnIndex::open(dir.path(), hashing(64)).await.unwrap();
        let matches = reopened.search_columns("age", 1).await.unwrap();
        assert_eq!(matches[0].column_name, "patient_age");
    }

    #[tokio::test]
    async fn test_mismatched_dims_file_is_skipped() {
        let dir = tempdir().unwrap();
        {
            let index = LocalColumnIndex::open(dir.path(), hashing(64)).await.unwrap();
            index.index_columns("ds-1", &columns()).await.unwrap();
        }

        let reopened = LocalColumnIndex::open(dir.path(), hashing(128)).await.unwrap();
        assert!(reopened.search_columns("age", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_matches_and_file() {
        let dir = tempdir().unwrap();
        let index = LocalColumnIndex::open(dir.path(), hashing(384)).await.unwrap();
        index.index_columns("ds-1", &columns()).await.unwrap();

        assert!(index.delete_dataset("ds-1").await.unwrap());
        assert!(!dir.path().join("ds-1.json").exists());
        assert!(index.search_columns("glucose", 10).await.unwrap().is_empty());
        assert!(!index.delete_dataset("ds-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_index_unchanged() {
        let dir = tempdir().unwrap();
        let store = dir.path().join("vector_store");
        let index = LocalColumnIndex::open(&store, hashing(64)).await.unwrap();
        std::fs::remove_dir_all(&store).unwrap();

        assert!(index.index_columns("ds-1", &columns()).await.is_err());
        assert!(index.search_columns("glucose level", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_point_ids_are_stable_across_reindex() {
        let dir = tempdir().unwrap();
        let index = LocalColumnIndex::open(dir.path(), hashing(64)).await.unwrap();
        index.index_columns("ds-1", &columns()).await.unwrap();
        index.index_columns("ds-1", &columns()).await.unwrap();

        let datasets = index.datasets.read().await;
        let ids: Vec<&str> = datasets["ds-1"].iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.contains(&column_point_id("ds-1", "glucose_level").to_string().as_str()));
    }

    #[tokio::test]
    async fn test_reindex_replaces_column_vectors() {
        let dir = tempdir().unwrap();
        let index = LocalColumnIndex::open(dir.path(), hashing(384)).await.unwrap();
        index.index_columns("ds-1", &columns()).await.unwrap();

        let mut described = Column::new("patient_age", ColumnType::Integer);
        described.description = Some("Age at admission".to_string());
        index.index_columns("ds-1", &[described]).await.unwrap();

        let matches = index.search_dataset_columns("ds-1", "admission", 10).await.unwrap();
        assert_eq!(matches.len(), 3);
        assert_eq!(matches[0].column_name, "patient_age");
        assert_eq!(matches[0].description, "Age at admission");
    }
}
