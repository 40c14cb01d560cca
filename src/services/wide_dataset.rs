use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::api::middleware::AppError;
use crate::models::{
    Column, ColumnGroup, ColumnMatch, ColumnReconciliation, Dataset, DatasetColumns, DatasetDetail,
    DatasetPreview, IngestionResult, QueryResponse,
};
use crate::services::columnar::ColumnarEngine;
use crate::services::ingestion::ChunkedIngestionEngine;
use crate::services::router::WidePath;
use crate::services::semantic::ColumnIndex;
use crate::services::translator::QueryTranslator;
use crate::storage::{NewDataset, SqliteCatalog};

/// Everything the service does with wide datasets: ingest, describe, query, delete
pub struct WideDatasetService {
    catalog: Arc<SqliteCatalog>,
    engine: Arc<ColumnarEngine>,
    ingestion: ChunkedIngestionEngine,
    index: Arc<dyn ColumnIndex>,
    translator: QueryTranslator,
}

impl WideDatasetService {
    pub fn new(
        catalog: Arc<SqliteCatalog>,
        engine: Arc<ColumnarEngine>,
        index: Arc<dyn ColumnIndex>,
        row_batch_size: usize,
    ) -> Self {
        Self {
            ingestion: ChunkedIngestionEngine::new(engine.clone(), row_batch_size),
            translator: QueryTranslator::new(catalog.clone(), index.clone(), engine.clone()),
            catalog,
            engine,
            index,
        }
    }

    /// Register the Parquet file of every cataloged dataset with the engine
    pub async fn register_existing(&self) -> Result<usize, AppError> {
        let backing_names = self.catalog.list_backing_names().await?;
        let mut registered = 0;
        for backing_name in backing_names {
            match self.engine.ensure_registered(&backing_name).await {
                Ok(()) => registered += 1,
                Err(e) => tracing::warn!("Could not register {}: {}", backing_name, e),
            }
        }
        tracing::info!("Registered {} existing datasets", registered);
        Ok(registered)
    }

    /// File write, then catalog write, then index write.
    ///
    /// A failed index write removes the catalog record, any vectors already
    /// written and the file again. `file_size` is the size of the uploaded CSV.
    pub async fn ingest(
        &self,
        content: Vec<u8>,
        name: &str,
        description: Option<&str>,
    ) -> Result<IngestionResult, AppError> {
        let upload_size = content.len() as u64;
        let description = match description.map(str::trim) {
            Some(text) if !text.is_empty() => text.to_string(),
            _ => default_description(Utc::now()),
        };
        let table = self.ingestion.ingest(content, name).await?;
        let dataset_id = uuid::Uuid::new_v4().to_string();

        let stored = self
            .catalog
            .store_dataset(&NewDataset {
                id: &dataset_id,
                name,
                description: Some(&description),
                backing_name: &table.backing_name,
                columns: &table.columns,
                row_count: table.row_count,
                file_size: upload_size,
                tags: &[],
            })
            .await;

        if let Err(e) = stored {
            tracing::error!("Failed to catalog dataset {}: {}", dataset_id, e);
            // Per-batch commits may have left part of the record behind
            self.discard(&dataset_id, &table.backing_name).await;
            return Err(e.into());
        }

        if let Err(e) = self.index.index_columns(&dataset_id, &table.columns).await {
            tracing::error!(
                "Failed to index columns of dataset {} in {}: {}",
                dataset_id,
                self.index.backend_name(),
                e
            );
            self.discard(&dataset_id, &table.backing_name).await;
            return Err(e);
        }

        Ok(IngestionResult {
            id: dataset_id,
            name: name.to_string(),
            description: Some(description),
            backing_name: table.backing_name,
            column_count: table.columns.len(),
            row_count: table.row_count,
            file_size: upload_size,
        })
    }

    async fn discard(&self, dataset_id: &str, backing_name: &str) {
        if let Err(e) = self.catalog.delete_dataset(dataset_id).await {
            tracing::warn!("Cleanup of catalog record {} failed: {}", dataset_id, e);
        }
        // A batched index write can fail after earlier batches landed
        if let Err(e) = self.index.delete_dataset(dataset_id).await {
            tracing::warn!("Cleanup of index entries for {} failed: {}", dataset_id, e);
        }
        if let Err(e) = self.ingestion.drop_table(backing_name).await {
            tracing::warn!("Cleanup of {} failed: {}", backing_name, e);
        }
    }

    pub async fn query(&self, dataset_id: &str, query_text: &str, limit: usize) -> Result<QueryResponse, AppError> {
        self.translator.query(dataset_id, query_text, limit).await
    }

    /// Columns across every dataset that best match `query_text`
    pub async fn recommend_columns(&self, query_text: &str, limit: usize) -> Result<Vec<ColumnMatch>, AppError> {
        self.index.search_columns(query_text, limit).await
    }

    pub async fn get(&self, dataset_id: &str) -> Result<DatasetDetail, AppError> {
        self.catalog
            .get_dataset(dataset_id)
            .await?
            .ok_or_else(|| not_found(dataset_id))
    }

    /// First `limit` rows; wide datasets name only their sampled columns
    pub async fn preview(&self, dataset_id: &str, limit: usize) -> Result<DatasetPreview, AppError> {
        let detail = self.get(dataset_id).await?;
        let backing_name = &detail.dataset.backing_name;
        self.engine.ensure_registered(backing_name).await?;

        let data = self
            .engine
            .query(&format!("SELECT * FROM {} LIMIT {}", backing_name, limit), limit)
            .await?;

        let (columns, columns_truncated) = match &detail.columns {
            DatasetColumns::Full { columns } => (columns, false),
            DatasetColumns::Grouped { columns_sample, .. } => (columns_sample, true),
        };

        Ok(DatasetPreview {
            columns: columns.iter().map(|c| c.name.clone()).collect(),
            data,
            total_rows: detail.dataset.row_count,
            column_count: detail.dataset.column_count,
            columns_truncated,
        })
    }

    pub async fn list(&self, offset: usize, limit: usize, search: Option<&str>) -> Result<Vec<Dataset>, AppError> {
        Ok(self.catalog.list_datasets(offset, limit, search).await?)
    }

    pub async fn list_columns(&self, dataset_id: &str, offset: usize, limit: usize) -> Result<Vec<Column>, AppError> {
        self.require(dataset_id).await?;
        Ok(self.catalog.list_columns(dataset_id, offset, limit).await?)
    }

    pub async fn get_column_group(&self, group_id: i64) -> Result<ColumnGroup, AppError> {
        self.catalog
            .get_column_group(group_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Column group {} not found", group_id)))
    }

    /// Store a column description and refresh that column's vector
    pub async fn update_column_description(
        &self,
        dataset_id: &str,
        column_name: &str,
        description: &str,
    ) -> Result<Column, AppError> {
        let updated = self
            .catalog
            .update_column_description(dataset_id, column_name, description)
            .await?;
        if !updated {
            return Err(AppError::NotFound(format!(
                "Column {} not found in dataset {}",
                column_name, dataset_id
            )));
        }

        let column = self
            .catalog
            .list_columns(dataset_id, 0, usize::MAX)
            .await?
            .into_iter()
            .find(|c| c.name == column_name)
            .ok_or_else(|| AppError::NotFound(format!("Column {} not found", column_name)))?;

        // The catalog is authoritative; a stale vector only degrades search
        if let Err(e) = self.index.index_columns(dataset_id, std::slice::from_ref(&column)).await {
            tracing::warn!("Re-indexing {}.{} failed: {}", dataset_id, column_name, e);
        }

        Ok(column)
    }

    pub async fn reconcile(&self, dataset_id: &str) -> Result<ColumnReconciliation, AppError> {
        let report = self
            .catalog
            .reconcile(dataset_id)
            .await?
            .ok_or_else(|| not_found(dataset_id))?;
        if !report.is_complete {
            tracing::warn!(
                "Dataset {} has {} of {} column records",
                dataset_id,
                report.stored,
                report.expected
            );
        }
        Ok(report)
    }

    /// Remove the catalog record, the index entries and the Parquet file
    pub async fn delete(&self, dataset_id: &str) -> Result<(), AppError> {
        let dataset = self.require(dataset_id).await?;

        self.catalog.delete_dataset(dataset_id).await?;
        if let Err(e) = self.index.delete_dataset(dataset_id).await {
            tracing::warn!("Failed to delete index entries for {}: {}", dataset_id, e);
        }
        self.ingestion.drop_table(&dataset.backing_name).await?;

        tracing::info!("Deleted dataset {} ({})", dataset_id, dataset.backing_name);
        Ok(())
    }

    async fn require(&self, dataset_id: &str) -> Result<Dataset, AppError> {
        self.catalog
            .find_dataset(dataset_id)
            .await?
            .ok_or_else(|| not_found(dataset_id))
    }
}

fn default_description(uploaded_at: DateTime<Utc>) -> String {
    format!("Dataset uploaded on {}", uploaded_at.format("%Y-%m-%d %H:%M:%S"))
}

fn not_found(dataset_id: &str) -> AppError {
    AppError::NotFound(format!("Dataset {} not found", dataset_id))
}

#[async_trait]
impl WidePath for WideDatasetService {
    async fn ingest(
        &self,
        content: Vec<u8>,
        name: &str,
        description: Option<&str>,
    ) -> Result<IngestionResult, AppError> {
        WideDatasetService::ingest(self, content, name, description).await
    }

    async fn describe(&self, dataset_id: &str) -> Result<Option<Dataset>, AppError> {
        Ok(self.catalog.find_dataset(dataset_id).await?)
    }
}
