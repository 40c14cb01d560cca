//! Query translation for wide datasets.
//!
//! Text starting with `SELECT` runs verbatim (read-only, row-capped). Anything
//! else is treated as natural language: the dataset's most relevant column is
//! looked up in the semantic index and dropped into a keyword-selected
//! template. With no relevant column, a small sample of the data is returned.

use std::sync::Arc;

use crate::api::middleware::AppError;
use crate::models::{ColumnMatch, Dataset, QueryKind, QueryResponse};
use crate::services::columnar::ColumnarEngine;
use crate::services::semantic::ColumnIndex;
use crate::storage::SqliteCatalog;
use crate::validation::SqlValidator;

/// Columns requested from the index for a natural-language query
pub const RELEVANT_COLUMN_LIMIT: usize = 5;

/// Rows returned when no relevant column is found
pub const SAMPLE_ROWS: usize = 5;

pub const SAMPLE_MESSAGE: &str =
    "Could not determine relevant columns for your query. Here's a sample of the data:";

/// Build the SQL for a natural-language query against `table` using `column`.
///
/// Keywords are matched case-insensitively as substrings, in this order:
/// count / how many, average / mean, maximum / max, minimum / min.
pub fn build_nl_sql(query_text: &str, table: &str, column: &str, limit: usize) -> String {
    let lowered = query_text.to_lowercase();
    let mentions = |words: &[&str]| words.iter().any(|w| lowered.contains(w));

    if mentions(&["count", "how many"]) {
        format!("SELECT COUNT(*) AS count FROM {}", table)
    } else if mentions(&["average", "mean"]) {
        format!("SELECT AVG({}) AS average FROM {}", column, table)
    } else if mentions(&["maximum", "max"]) {
        format!("SELECT MAX({}) AS maximum FROM {}", column, table)
    } else if mentions(&["minimum", "min"]) {
        format!("SELECT MIN({}) AS minimum FROM {}", column, table)
    } else {
        format!("SELECT {} FROM {} LIMIT {}", column, table, limit)
    }
}

pub fn is_literal_sql(query_text: &str) -> bool {
    query_text.trim().to_uppercase().starts_with("SELECT")
}

pub struct QueryTranslator {
    catalog: Arc<SqliteCatalog>,
    index: Arc<dyn ColumnIndex>,
    engine: Arc<ColumnarEngine>,
}

impl QueryTranslator {
    pub fn new(catalog: Arc<SqliteCatalog>, index: Arc<dyn ColumnIndex>, engine: Arc<ColumnarEngine>) -> Self {
        Self {
            catalog,
            index,
            engine,
        }
    }

    /// Answer `query_text` against one dataset, returning at most `limit` rows
    pub async fn query(&self, dataset_id: &str, query_text: &str, limit: usize) -> Result<QueryResponse, AppError> {
        let dataset = self
            .catalog
            .find_dataset(dataset_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Dataset {} not found", dataset_id)))?;

        self.engine.ensure_registered(&dataset.backing_name).await?;

        if is_literal_sql(query_text) {
            return self.run_literal(query_text, limit).await;
        }

        let relevant = self.relevant_columns(&dataset, query_text).await;
        match relevant.first() {
            Some(top) => {
                let sql = build_nl_sql(query_text, &dataset.backing_name, &top.column_name, limit);
                tracing::info!("Translated '{}' to: {}", query_text, sql);
                let results = self.engine.query(&sql, limit).await?;

                Ok(QueryResponse {
                    kind: QueryKind::NlQuery,
                    query: query_text.to_string(),
                    sql_query: Some(sql),
                    relevant_columns: Some(relevant),
                    results,
                    message: None,
                })
            }
            None => {
                let sql = format!("SELECT * FROM {} LIMIT {}", dataset.backing_name, SAMPLE_ROWS);
                let results = self.engine.query(&sql, SAMPLE_ROWS).await?;

                Ok(QueryResponse {
                    kind: QueryKind::Sample,
                    query: query_text.to_string(),
                    sql_query: Some(sql),
                    relevant_columns: None,
                    results,
                    message: Some(SAMPLE_MESSAGE.to_string()),
                })
            }
        }
    }

    async fn run_literal(&self, query_text: &str, limit: usize) -> Result<QueryResponse, AppError> {
        let sql = SqlValidator::validate_select_only(query_text.trim())?;
        let results = self.engine.query(&sql, limit).await?;

        Ok(QueryResponse {
            kind: QueryKind::SqlQuery,
            query: query_text.to_string(),
            sql_query: None,
            relevant_columns: None,
            results,
            message: None,
        })
    }

    /// Index lookup scoped to the dataset; an unavailable index means no columns
    async fn relevant_columns(&self, dataset: &Dataset, query_text: &str) -> Vec<ColumnMatch> {
        match self
            .index
            .search_dataset_columns(&dataset.id, query_text, RELEVANT_COLUMN_LIMIT)
            .await
        {
            Ok(matches) => matches,
            Err(e) => {
                tracing::warn!("Column search for dataset {} failed: {}", dataset.id, e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_template() {
        assert_eq!(
            build_nl_sql("how many rows", "t1", "age", 100),
            "SELECT COUNT(*) AS count FROM t1"
        );
    }

    #[test]
    fn test_keyword_order_is_first_hit() {
        // count wins over average even when both appear
        assert_eq!(
            build_nl_sql("Count the average", "t", "c", 10),
            "SELECT COUNT(*) AS count FROM t"
        );
        assert_eq!(build_nl_sql("mean glucose", "t", "glucose", 10), "SELECT AVG(glucose) AS average FROM t");
        assert_eq!(build_nl_sql("MAX and min of bmi", "t", "bmi", 10), "SELECT MAX(bmi) AS maximum FROM t");
        assert_eq!(build_nl_sql("lowest? minimum bmi", "t", "bmi", 10), "SELECT MIN(bmi) AS minimum FROM t");
    }

    #[test]
    fn test_default_projection_uses_limit() {
        assert_eq!(build_nl_sql("show me bmi", "t", "bmi", 25), "SELECT bmi FROM t LIMIT 25");
    }

    #[test]
    fn test_literal_sql_detection() {
        assert!(is_literal_sql("  select count(*) from t"));
        assert!(is_literal_sql("SELECT avg(x) FROM t -- how many"));
        assert!(!is_literal_sql("how many rows are selected"));
    }
}
