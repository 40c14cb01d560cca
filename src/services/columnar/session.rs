// Columnar Session
//
// Builds the single DataFusion SessionContext shared by every wide-dataset query.

use datafusion::prelude::{SessionConfig, SessionContext};

/// Configuration for the shared DataFusion session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Batch size for query execution
    pub batch_size: usize,
    /// Number of partitions for parallel execution
    pub target_partitions: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            batch_size: 8192,
            target_partitions: num_cpus::get(),
        }
    }
}

impl SessionSettings {
    /// Create a configured SessionContext.
    ///
    /// Identifier normalization stays on, so the lower-case backing names and
    /// cleaned column names resolve unquoted.
    ///
    /// # Returns
    /// A `SessionContext` ready for Parquet registration
    pub fn create_session(&self) -> SessionContext {
        let config = SessionConfig::new()
            .with_batch_size(self.batch_size)
            .with_target_partitions(self.target_partitions.max(1))
            .with_information_schema(false);

        SessionContext::new_with_config(config)
    }
}
