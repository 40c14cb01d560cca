// Columnar ResultConverter
//
// Converts DataFusion RecordBatch results to JSON objects keyed by column name.

use anyhow::{anyhow, Result};
use datafusion::arrow::array::*;
use datafusion::arrow::datatypes::DataType;
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::arrow::util::display::{ArrayFormatter, FormatOptions};
use serde_json::{json, Map, Value as JsonValue};

use crate::models::ResultRow;

/// Converts query results to JSON rows
pub struct ResultConverter;

impl ResultConverter {
    /// Convert record batches to one JSON object per row
    ///
    /// # Arguments
    /// * `batches` - Record batches containing query results
    ///
    /// # Returns
    /// Rows keyed by column name, in result order
    pub fn to_rows(batches: &[RecordBatch]) -> Result<Vec<ResultRow>> {
        let total: usize = batches.iter().map(|b| b.num_rows()).sum();
        let mut rows = Vec::with_capacity(total);

        for batch in batches {
            let schema = batch.schema();
            for row_idx in 0..batch.num_rows() {
                let mut row = Map::with_capacity(batch.num_columns());
                for (col_idx, field) in schema.fields().iter().enumerate() {
                    let value = Self::array_value_to_json(batch.column(col_idx), row_idx)?;
                    row.insert(field.name().clone(), value);
                }
                rows.push(row);
            }
        }

        Ok(rows)
    }

    /// Convert a single array value to JSON
    ///
    /// Types written by ingestion and produced by the aggregate templates map to
    /// native JSON values; anything else falls back to Arrow's display form.
    fn array_value_to_json(array: &ArrayRef, row_idx: usize) -> Result<JsonValue> {
        // Handle NULL values
        if array.is_null(row_idx) {
            return Ok(JsonValue::Null);
        }

        let value = match array.data_type() {
            DataType::Boolean => json!(downcast::<BooleanArray>(array)?.value(row_idx)),

            // Integer types
            DataType::Int8 => json!(downcast::<Int8Array>(array)?.value(row_idx)),
            DataType::Int16 => json!(downcast::<Int16Array>(array)?.value(row_idx)),
            DataType::Int32 => json!(downcast::<Int32Array>(array)?.value(row_idx)),
            DataType::Int64 => json!(downcast::<Int64Array>(array)?.value(row_idx)),
            DataType::UInt8 => json!(downcast::<UInt8Array>(array)?.value(row_idx)),
            DataType::UInt16 => json!(downcast::<UInt16Array>(array)?.value(row_idx)),
            DataType::UInt32 => json!(downcast::<UInt32Array>(array)?.value(row_idx)),
            DataType::UInt64 => json!(downcast::<UInt64Array>(array)?.value(row_idx)),

            // Floating point types; non-finite values become null
            DataType::Float32 => json!(downcast::<Float32Array>(array)?.value(row_idx)),
            DataType::Float64 => json!(downcast::<Float64Array>(array)?.value(row_idx)),

            DataType::Decimal128(_, scale) => {
                let value = downcast::<Decimal128Array>(array)?.value(row_idx);
                let divisor = 10_f64.powi(*scale as i32);
                json!(value as f64 / divisor)
            }

            // String types; Parquet scans produce view arrays by default
            DataType::Utf8 => json!(downcast::<StringArray>(array)?.value(row_idx)),
            DataType::LargeUtf8 => json!(downcast::<LargeStringArray>(array)?.value(row_idx)),
            DataType::Utf8View => json!(downcast::<StringViewArray>(array)?.value(row_idx)),

            other => {
                tracing::debug!("Formatting Arrow type {:?} as text", other);
                let formatter = ArrayFormatter::try_new(array.as_ref(), &FormatOptions::default())
                    .map_err(|e| anyhow!("Failed to format {:?} value: {}", other, e))?;
                json!(formatter.value(row_idx).to_string())
            }
        };

        Ok(value)
    }
}

fn downcast<T: 'static>(array: &ArrayRef) -> Result<&T> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| anyhow!("Failed to downcast {:?} array", array.data_type()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::datatypes::{Field, Schema};
    use std::sync::Arc;

    #[test]
    fn test_convert_simple_batch() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ]));

        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1, 2, 3])),
                Arc::new(StringArray::from(vec![Some("Alice"), Some("Bob"), None])),
            ],
        )
        .unwrap();

        let rows = ResultConverter::to_rows(&[batch]).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["id"], json!(1));
        assert_eq!(rows[0]["name"], json!("Alice"));
        assert_eq!(rows[2]["name"], JsonValue::Null);
    }

    #[test]
    fn test_convert_numeric_and_view_types() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("average", DataType::Float64, true),
            Field::new("flag", DataType::Boolean, false),
            Field::new("label", DataType::Utf8View, true),
        ]));

        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Float64Array::from(vec![2.5])),
                Arc::new(BooleanArray::from(vec![true])),
                Arc::new(StringViewArray::from(vec![Some("x")])),
            ],
        )
        .unwrap();

        let rows = ResultConverter::to_rows(&[batch]).unwrap();
        assert_eq!(rows[0]["average"], json!(2.5));
        assert_eq!(rows[0]["flag"], json!(true));
        assert_eq!(rows[0]["label"], json!("x"));
    }

    #[test]
    fn test_unlisted_type_falls_back_to_display() {
        let schema = Arc::new(Schema::new(vec![Field::new("day", DataType::Date32, false)]));
        let batch =
            RecordBatch::try_new(schema, vec![Arc::new(Date32Array::from(vec![0]))]).unwrap();

        let rows = ResultConverter::to_rows(&[batch]).unwrap();
        assert_eq!(rows[0]["day"], json!("1970-01-01"));
    }

    #[test]
    fn test_empty_result() {
        let rows = ResultConverter::to_rows(&[]).unwrap();
        assert!(rows.is_empty());
    }
}
