//! Storage routing between the relational (narrow) and columnar (wide) paths.
//!
//! Only the header row is read to decide. CSVs wider than `max_columns` go to
//! the columnar path; everything else, including files whose header cannot be
//! read, goes to the narrow path.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

use crate::api::middleware::AppError;
use crate::models::{Dataset, IngestionResult, StorageProbe, StorageType};
use crate::storage::SqliteCatalog;

/// Result of an ingestion through the relational path
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NarrowIngestion {
    pub id: String,
    pub name: String,
    pub table_name: String,
    pub column_count: usize,
    pub row_count: usize,
}

/// What the relational path knows about a stored table
#[derive(Debug, Clone, PartialEq)]
pub struct NarrowTableInfo {
    pub table_name: String,
    pub row_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "storage_type", rename_all = "lowercase")]
pub enum RoutedIngestion {
    Wide(IngestionResult),
    Narrow(NarrowIngestion),
}

impl RoutedIngestion {
    pub fn backing_name(&self) -> &str {
        match self {
            RoutedIngestion::Wide(result) => &result.backing_name,
            RoutedIngestion::Narrow(result) => &result.table_name,
        }
    }
}

/// Relational row-store ingestion, owned by another service
#[async_trait]
pub trait NarrowPath: Send + Sync {
    async fn ingest(
        &self,
        content: &[u8],
        name: &str,
        description: Option<&str>,
    ) -> Result<NarrowIngestion, AppError>;

    async fn describe(&self, dataset_id: &str) -> Result<Option<NarrowTableInfo>, AppError>;
}

/// Columnar ingestion and lookup
#[async_trait]
pub trait WidePath: Send + Sync {
    async fn ingest(
        &self,
        content: Vec<u8>,
        name: &str,
        description: Option<&str>,
    ) -> Result<IngestionResult, AppError>;

    async fn describe(&self, dataset_id: &str) -> Result<Option<Dataset>, AppError>;
}

/// External catalog entries an upload can be linked to
#[async_trait]
pub trait CatalogLinks: Send + Sync {
    async fn set_backing_name(&self, link_id: &str, backing_name: &str) -> Result<(), AppError>;
}

#[async_trait]
impl CatalogLinks for SqliteCatalog {
    async fn set_backing_name(&self, link_id: &str, backing_name: &str) -> Result<(), AppError> {
        self.set_link_backing_name(link_id, backing_name)
            .await
            .map_err(AppError::from)
    }
}

/// Narrow path used when no relational backend is wired in
pub struct UnconfiguredNarrowPath;

#[async_trait]
impl NarrowPath for UnconfiguredNarrowPath {
    async fn ingest(
        &self,
        _content: &[u8],
        name: &str,
        _description: Option<&str>,
    ) -> Result<NarrowIngestion, AppError> {
        Err(AppError::NotImplemented(format!(
            "Dataset '{}' is narrow enough for relational storage, which is not configured",
            name
        )))
    }

    async fn describe(&self, _dataset_id: &str) -> Result<Option<NarrowTableInfo>, AppError> {
        Ok(None)
    }
}

/// Count the fields of the header row
pub fn count_header_columns(content: &[u8]) -> Result<usize, AppError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(content);
    let headers = reader
        .headers()
        .map_err(|e| AppError::MalformedInput(format!("Failed to read CSV header: {}", e)))?;
    if headers.is_empty() {
        return Err(AppError::MalformedInput("CSV header is empty".to_string()));
    }
    Ok(headers.len())
}

pub struct StorageRouter {
    max_columns: usize,
    wide: Arc<dyn WidePath>,
    narrow: Arc<dyn NarrowPath>,
    links: Arc<dyn CatalogLinks>,
}

impl StorageRouter {
    pub fn new(
        max_columns: usize,
        wide: Arc<dyn WidePath>,
        narrow: Arc<dyn NarrowPath>,
        links: Arc<dyn CatalogLinks>,
    ) -> Self {
        Self {
            max_columns,
            wide,
            narrow,
            links,
        }
    }

    /// Ingest an upload through the path its width calls for
    pub async fn route(
        &self,
        content: Vec<u8>,
        name: &str,
        description: Option<&str>,
        catalog_link: Option<&str>,
    ) -> Result<RoutedIngestion, AppError> {
        let routed = match count_header_columns(&content) {
            Ok(num_columns) if num_columns > self.max_columns => {
                tracing::info!(
                    "Routing '{}' ({} columns) to columnar storage",
                    name,
                    num_columns
                );
                RoutedIngestion::Wide(self.wide.ingest(content, name, description).await?)
            }
            Ok(num_columns) => {
                tracing::info!(
                    "Routing '{}' ({} columns) to relational storage",
                    name,
                    num_columns
                );
                RoutedIngestion::Narrow(self.narrow.ingest(&content, name, description).await?)
            }
            Err(e) => {
                tracing::warn!("Could not read header of '{}' ({}), using relational storage", name, e);
                RoutedIngestion::Narrow(self.narrow.ingest(&content, name, description).await?)
            }
        };

        if let Some(link_id) = catalog_link {
            // The data is already stored; a failed write-back only loses the link
            if let Err(e) = self.links.set_backing_name(link_id, routed.backing_name()).await {
                tracing::error!(
                    "Failed to record backing name {} on catalog link {}: {}",
                    routed.backing_name(),
                    link_id,
                    e
                );
            }
        }

        Ok(routed)
    }

    /// Where a dataset lives: columnar catalog first, then the relational path.
    ///
    /// A failing backend counts as "not there".
    pub async fn probe(&self, dataset_id: &str) -> Result<StorageProbe, AppError> {
        match self.wide.describe(dataset_id).await {
            Ok(Some(dataset)) => {
                return Ok(StorageProbe {
                    storage_type: StorageType::Wide,
                    backing_name: dataset.backing_name,
                    column_count: Some(dataset.column_count),
                    row_count: Some(dataset.row_count),
                })
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Columnar lookup for {} failed: {}", dataset_id, e),
        }

        match self.narrow.describe(dataset_id).await {
            Ok(Some(info)) => {
                return Ok(StorageProbe {
                    storage_type: StorageType::Narrow,
                    backing_name: info.table_name,
                    column_count: None,
                    row_count: Some(info.row_count),
                })
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Relational lookup for {} failed: {}", dataset_id, e),
        }

        Err(AppError::NotFound(format!("Dataset {} not found", dataset_id)))
    }
}
