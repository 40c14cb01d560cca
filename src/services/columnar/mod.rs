// Columnar Engine Module
//
// DataFusion over Parquet: one file per wide dataset, registered under its
// backing name and queried read-only.

pub mod converter;
pub mod engine;
pub mod session;

pub use converter::ResultConverter;
pub use engine::ColumnarEngine;
pub use session::SessionSettings;
