// Columnar Engine
//
// Registers ingested Parquet files as DataFusion tables and runs read-only
// queries against them with a row cap and a deadline.

use datafusion::arrow::record_batch::RecordBatch;
use datafusion::execution::context::SQLOptions;
use datafusion::prelude::{ParquetReadOptions, SessionContext};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::converter::ResultConverter;
use super::session::SessionSettings;
use crate::api::middleware::AppError;
use crate::models::ResultRow;

/// Parquet file extension used for every backing file
pub const PARQUET_EXTENSION: &str = "parquet";

/// Shared DataFusion session over the Parquet files in the storage root.
///
/// Registrations are serialized behind a mutex; queries run concurrently
/// against the shared `SessionContext`.
pub struct ColumnarEngine {
    ctx: SessionContext,
    storage_root: PathBuf,
    registrations: Mutex<()>,
    query_timeout: Duration,
}

impl ColumnarEngine {
    /// Create an engine rooted at `storage_root`
    ///
    /// # Arguments
    /// * `storage_root` - Directory holding `<backing_name>.parquet` files
    /// * `query_timeout` - Deadline applied to every query
    pub fn new(storage_root: impl Into<PathBuf>, query_timeout: Duration, settings: SessionSettings) -> Self {
        Self {
            ctx: settings.create_session(),
            storage_root: storage_root.into(),
            registrations: Mutex::new(()),
            query_timeout,
        }
    }

    /// Location of the Parquet file for a backing name
    pub fn parquet_path(&self, backing_name: &str) -> PathBuf {
        self.storage_root
            .join(format!("{}.{}", backing_name, PARQUET_EXTENSION))
    }

    /// Register (or re-register) a Parquet file under `backing_name`
    pub async fn register(&self, backing_name: &str, path: &Path) -> Result<(), AppError> {
        let _guard = self.registrations.lock().await;
        self.register_locked(backing_name, path).await
    }

    async fn register_locked(&self, backing_name: &str, path: &Path) -> Result<(), AppError> {
        let path_str = path
            .to_str()
            .ok_or_else(|| AppError::Internal(format!("Non UTF-8 path: {}", path.display())))?;

        if self.ctx.table_exist(backing_name).unwrap_or(false) {
            self.ctx.deregister_table(backing_name).map_err(|e| {
                AppError::BackendUnavailable(format!("Failed to replace table {}: {}", backing_name, e))
            })?;
        }

        self.ctx
            .register_parquet(backing_name, path_str, ParquetReadOptions::default())
            .await
            .map_err(|e| {
                AppError::BackendUnavailable(format!("Failed to register {}: {}", backing_name, e))
            })?;

        tracing::debug!("Registered columnar table {} from {}", backing_name, path.display());
        Ok(())
    }

    /// Make sure a table is queryable, registering its file if needed.
    ///
    /// Datasets stored by an earlier process exist on disk but not in this
    /// session until first use.
    pub async fn ensure_registered(&self, backing_name: &str) -> Result<(), AppError> {
        if self.is_registered(backing_name) {
            return Ok(());
        }

        let _guard = self.registrations.lock().await;
        // Another caller may have registered it while we waited
        if self.is_registered(backing_name) {
            return Ok(());
        }

        let path = self.parquet_path(backing_name);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(AppError::NotFound(format!(
                "Backing file for {} not found",
                backing_name
            )));
        }

        self.register_locked(backing_name, &path).await
    }

    pub fn is_registered(&self, backing_name: &str) -> bool {
        self.ctx.table_exist(backing_name).unwrap_or(false)
    }

    /// Drop a table from the session; returns whether it was registered
    pub async fn deregister(&self, backing_name: &str) -> Result<bool, AppError> {
        let _guard = self.registrations.lock().await;
        let removed = self
            .ctx
            .deregister_table(backing_name)
            .map_err(|e| AppError::BackendUnavailable(format!("Failed to deregister {}: {}", backing_name, e)))?;
        Ok(removed.is_some())
    }

    /// Execute a read-only query, returning at most `limit` rows
    ///
    /// # Arguments
    /// * `sql` - A single SELECT statement
    /// * `limit` - Row cap applied on top of the statement
    ///
    /// # Errors
    /// `InvalidSql` when the statement cannot be planned or is not read-only,
    /// `BackendUnavailable` on execution failure or timeout
    pub async fn query(&self, sql: &str, limit: usize) -> Result<Vec<ResultRow>, AppError> {
        let start_time = std::time::Instant::now();

        let batches = timeout(self.query_timeout, self.collect_limited(sql, limit))
            .await
            .map_err(|_| {
                AppError::BackendUnavailable(format!(
                    "Query execution timeout after {:?}",
                    self.query_timeout
                ))
            })??;

        let rows = ResultConverter::to_rows(&batches)
            .map_err(|e| AppError::Internal(format!("Failed to convert results: {}", e)))?;

        tracing::debug!(
            "Columnar query returned {} rows in {}ms",
            rows.len(),
            start_time.elapsed().as_millis()
        );

        Ok(rows)
    }

    async fn collect_limited(&self, sql: &str, limit: usize) -> Result<Vec<RecordBatch>, AppError> {
        let options = SQLOptions::new()
            .with_allow_ddl(false)
            .with_allow_dml(false)
            .with_allow_statements(false);

        let df = self
            .ctx
            .sql_with_options(sql, options)
            .await
            .map_err(|e| AppError::InvalidSql(e.to_string()))?
            .limit(0, Some(limit))
            .map_err(|e| AppError::InvalidSql(e.to_string()))?;

        let mut stream = df
            .execute_stream()
            .await
            .map_err(|e| AppError::BackendUnavailable(format!("Failed to execute query: {}", e)))?;

        let mut batches = Vec::new();
        while let Some(batch) = stream.next().await {
            let batch = batch
                .map_err(|e| AppError::BackendUnavailable(format!("Query execution failed: {}", e)))?;
            batches.push(batch);
        }

        Ok(batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::array::{Int64Array, StringArray};
    use datafusion::arrow::datatypes::{DataType, Field, Schema};
    use datafusion::parquet::arrow::ArrowWriter;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn engine(root: &Path) -> ColumnarEngine {
        ColumnarEngine::new(root, Duration::from_secs(30), SessionSettings::default())
    }

    fn write_parquet(path: &Path) {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, true),
            Field::new("label", DataType::Utf8, true),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![1, 2, 3, 4])),
                Arc::new(StringArray::from(vec!["a", "b", "c", "d"])),
            ],
        )
        .unwrap();

        let file = std::fs::File::create(path).unwrap();
        let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
    }

    #[tokio::test]
    async fn test_register_and_query_with_limit() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        let path = engine.parquet_path("dataset_t_00000001");
        write_parquet(&path);

        engine.register("dataset_t_00000001", &path).await.unwrap();
        let rows = engine
            .query("SELECT * FROM dataset_t_00000001", 2)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], serde_json::json!(1));

        let rows = engine
            .query("SELECT COUNT(*) AS count FROM dataset_t_00000001", 10)
            .await
            .unwrap();
        assert_eq!(rows[0]["count"], serde_json::json!(4));
    }

    #[tokio::test]
    async fn test_ensure_registered_picks_up_existing_file() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        write_parquet(&engine.parquet_path("dataset_old_00000002"));

        assert!(!engine.is_registered("dataset_old_00000002"));
        engine.ensure_registered("dataset_old_00000002").await.unwrap();
        assert!(engine.is_registered("dataset_old_00000002"));

        let err = engine.ensure_registered("dataset_gone_00000003").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_mutating_statements_are_rejected() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        let path = engine.parquet_path("dataset_ro_00000004");
        write_parquet(&path);
        engine.register("dataset_ro_00000004", &path).await.unwrap();

        let result = engine.query("DROP TABLE dataset_ro_00000004", 10).await;
        assert!(matches!(result, Err(AppError::InvalidSql(_))));
        assert!(engine.is_registered("dataset_ro_00000004"));
    }

    #[tokio::test]
    async fn test_unknown_table_is_invalid_sql() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        let result = engine.query("SELECT * FROM nowhere", 10).await;
        assert!(matches!(result, Err(AppError::InvalidSql(_))));
    }

    #[tokio::test]
    async fn test_deregister() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        let path = engine.parquet_path("dataset_d_00000005");
        write_parquet(&path);
        engine.register("dataset_d_00000005", &path).await.unwrap();

        assert!(engine.deregister("dataset_d_00000005").await.unwrap());
        assert!(!engine.deregister("dataset_d_00000005").await.unwrap());
    }
}
