pub mod catalog;
pub mod column_groups;

pub use catalog::{NewDataset, SqliteCatalog};
