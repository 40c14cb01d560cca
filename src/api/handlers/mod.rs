pub mod columns;
pub mod datasets;
pub mod query;

use std::sync::Arc;
use std::time::Duration;

use crate::api::middleware::AppError;
use crate::config::Config;
use crate::services::columnar::SessionSettings;
use crate::services::{
    create_column_index, ColumnarEngine, StorageRouter, UnconfiguredNarrowPath, WideDatasetService,
};
use crate::storage::SqliteCatalog;

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<WideDatasetService>,
    pub router: Arc<StorageRouter>,
    pub config: Config,
}

impl AppState {
    /// Open the catalog, engine and column index under the configured storage root
    pub async fn from_config(config: Config) -> Result<Self, AppError> {
        let root = &config.storage.root;
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to create {}: {}", root.display(), e)))?;

        let catalog = Arc::new(
            SqliteCatalog::new(config.catalog_path(), config.storage.column_batch_size).await?,
        );
        let engine = Arc::new(ColumnarEngine::new(
            root.clone(),
            Duration::from_secs(config.columnar.query_timeout_secs),
            SessionSettings::default(),
        ));
        let index = create_column_index(&config).await?;
        tracing::info!("Using {} column index", index.backend_name());

        let service = Arc::new(WideDatasetService::new(
            catalog.clone(),
            engine,
            index,
            config.storage.row_batch_size,
        ));
        service.register_existing().await?;

        let router = Arc::new(StorageRouter::new(
            config.router.max_columns,
            service.clone(),
            Arc::new(UnconfiguredNarrowPath),
            catalog,
        ));

        Ok(Self {
            service,
            router,
            config,
        })
    }
}
