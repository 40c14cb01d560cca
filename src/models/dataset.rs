use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Storage format tag recorded for every wide dataset
pub const STORAGE_FORMAT_PARQUET: &str = "parquet";

/// Inferred type of an ingested column. Every type is nullable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Float,
    Text,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Text => "text",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "integer" => Some(ColumnType::Integer),
            "float" => Some(ColumnType::Float),
            "text" => Some(ColumnType::Text),
            _ => None,
        }
    }

    /// Next type that can hold every value of `self`
    pub fn widen(&self) -> Option<Self> {
        match self {
            ColumnType::Integer => Some(ColumnType::Float),
            ColumnType::Float => Some(ColumnType::Text),
            ColumnType::Text => None,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Column descriptor owned by a dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub embedding_id: Option<String>,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            description: None,
            embedding_id: None,
        }
    }
}

/// Catalog record of one ingested wide dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub backing_name: String,
    pub created_at: DateTime<Utc>,
    pub column_count: usize,
    pub row_count: usize,
    pub file_size: u64,
    pub tags: Vec<String>,
    pub storage_format: String,
}

/// Group listing entry returned with wide dataset details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnGroupSummary {
    pub id: i64,
    pub name: String,
    pub description: String,
}

/// Stored column group with its member names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnGroup {
    pub id: i64,
    pub dataset_id: String,
    pub name: String,
    pub description: String,
    pub columns: Vec<String>,
}

/// Column portion of a dataset read.
///
/// Datasets at or below the grouping threshold carry every column; wider ones
/// carry their groups and a short sample instead.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum DatasetColumns {
    Full {
        columns: Vec<Column>,
    },
    Grouped {
        column_groups: Vec<ColumnGroupSummary>,
        columns_truncated: bool,
        columns_sample: Vec<Column>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetDetail {
    #[serde(flatten)]
    pub dataset: Dataset,
    #[serde(flatten)]
    pub columns: DatasetColumns,
}

/// Summary returned to callers once a wide ingestion completes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionResult {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub backing_name: String,
    pub column_count: usize,
    pub row_count: usize,
    pub file_size: u64,
}

/// Outcome of comparing a dataset's recorded width with its stored column rows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnReconciliation {
    pub dataset_id: String,
    pub expected: usize,
    pub stored: usize,
    pub is_complete: bool,
}

#[derive(Debug, Deserialize)]
pub struct UploadParams {
    pub name: String,
    pub description: Option<String>,
    pub catalog_link: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub offset: Option<usize>,
    pub limit: Option<usize>,
    pub search: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateColumnDescriptionRequest {
    pub description: String,
}
