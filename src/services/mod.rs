pub mod columnar; // DataFusion session, Parquet registration and result conversion
pub mod ingestion;
pub mod router;
pub mod semantic; // Column index backends
pub mod translator;
pub mod wide_dataset;

pub use columnar::ColumnarEngine;
pub use ingestion::ChunkedIngestionEngine;
pub use router::{RoutedIngestion, StorageRouter, UnconfiguredNarrowPath};
pub use semantic::{create_column_index, ColumnIndex};
pub use translator::QueryTranslator;
pub use wide_dataset::WideDatasetService;
