use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::dataset::ColumnType;

/// Rows returned from the columnar engine, one JSON object per row
pub type ResultRow = Map<String, Value>;

/// Which translation path produced a query response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    SqlQuery,
    NlQuery,
    Sample,
}

/// A column ranked by semantic similarity to a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMatch {
    pub dataset_id: String,
    pub column_name: String,
    pub column_type: ColumnType,
    pub description: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    #[serde(rename = "type")]
    pub kind: QueryKind,
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql_query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relevant_columns: Option<Vec<ColumnMatch>>,
    pub results: Vec<ResultRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Wide,
    Narrow,
}

/// Answer to "where does this dataset live", consumed by the tool-calling layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageProbe {
    pub storage_type: StorageType,
    pub backing_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
}

/// First rows of a dataset, with the column names shown alongside them
#[derive(Debug, Clone, Serialize)]
pub struct DatasetPreview {
    pub columns: Vec<String>,
    pub data: Vec<ResultRow>,
    pub total_rows: usize,
    pub column_count: usize,
    pub columns_truncated: bool,
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub query_text: String,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct RecommendRequest {
    pub query_text: String,
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_response_omits_absent_fields() {
        let response = QueryResponse {
            kind: QueryKind::SqlQuery,
            query: "SELECT 1".to_string(),
            sql_query: None,
            relevant_columns: None,
            results: vec![],
            message: None,
        };

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["type"], "sql_query");
        assert!(value.get("sql_query").is_none());
        assert!(value.get("message").is_none());
    }

    #[test]
    fn test_storage_probe_serialization() {
        let probe = StorageProbe {
            storage_type: StorageType::Wide,
            backing_name: "dataset_x_1234abcd".to_string(),
            column_count: Some(2000),
            row_count: Some(3),
        };
        let value = serde_json::to_value(&probe).unwrap();
        assert_eq!(value["storage_type"], "wide");
        assert_eq!(value["column_count"], 2000);
    }
}
