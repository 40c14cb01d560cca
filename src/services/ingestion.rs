//! Chunked CSV ingestion into Parquet.
//!
//! The CSV body is parsed in fixed-size row batches on the blocking pool. The
//! first batch decides each column's type; the remaining batches are held as
//! text and cast once at the end, widening a column when a later value does not
//! fit. The result is written as a single Parquet file and registered with the
//! columnar engine under its backing name.

use datafusion::arrow::array::{ArrayRef, Float64Array, Int64Array, StringArray};
use datafusion::arrow::datatypes::{DataType, Field, Schema};
use datafusion::arrow::record_batch::{RecordBatch, RecordBatchOptions};
use datafusion::parquet::arrow::ArrowWriter;
use datafusion::parquet::file::properties::WriterProperties;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::api::middleware::AppError;
use crate::models::{Column, ColumnType};
use crate::services::columnar::ColumnarEngine;

/// Outcome of a successful ingestion
#[derive(Debug, Clone)]
pub struct IngestedTable {
    pub backing_name: String,
    pub row_count: usize,
    pub columns: Vec<Column>,
    pub file_path: PathBuf,
    pub file_size: u64,
}

/// Streams wide CSV uploads into Parquet files under the storage root
pub struct ChunkedIngestionEngine {
    engine: Arc<ColumnarEngine>,
    row_batch_size: usize,
}

impl ChunkedIngestionEngine {
    pub fn new(engine: Arc<ColumnarEngine>, row_batch_size: usize) -> Self {
        Self {
            engine,
            row_batch_size: row_batch_size.max(1),
        }
    }

    /// Parse `content`, write `<backing_name>.parquet` and register it.
    ///
    /// On any failure the partial file is removed and nothing stays registered.
    pub async fn ingest(&self, content: Vec<u8>, dataset_name: &str) -> Result<IngestedTable, AppError> {
        let backing_name = backing_name_for(dataset_name);
        let path = self.engine.parquet_path(&backing_name);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::Internal(format!("Failed to create storage directory: {}", e)))?;
        }

        tracing::info!("Ingesting dataset '{}' as {}", dataset_name, backing_name);

        let row_batch_size = self.row_batch_size;
        let write_path = path.clone();
        let written = tokio::task::spawn_blocking(move || {
            let table = parse_csv(&content, row_batch_size)?;
            let file_size = write_parquet(&table.batch, &write_path)?;
            Ok::<_, AppError>((table, file_size))
        })
        .await
        .map_err(|e| AppError::Internal(format!("Ingestion task failed: {}", e)));

        let (table, file_size) = match written.and_then(|inner| inner) {
            Ok(written) => written,
            Err(e) => {
                remove_file_quietly(&path).await;
                return Err(e);
            }
        };

        if let Err(e) = self.engine.register(&backing_name, &path).await {
            remove_file_quietly(&path).await;
            return Err(e);
        }

        tracing::info!(
            "Ingested {} rows x {} columns into {} ({} bytes)",
            table.row_count,
            table.columns.len(),
            backing_name,
            file_size
        );

        Ok(IngestedTable {
            backing_name,
            row_count: table.row_count,
            columns: table.columns,
            file_path: path,
            file_size,
        })
    }

    /// Deregister a backing table and delete its file
    pub async fn drop_table(&self, backing_name: &str) -> Result<(), AppError> {
        self.engine.deregister(backing_name).await?;
        let path = self.engine.parquet_path(backing_name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Internal(format!(
                "Failed to remove {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

async fn remove_file_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove partial file {}: {}", path.display(), e);
        }
    }
}

/// Normalize a header into a SQL-friendly column name.
///
/// Lower-cases, replaces every character other than ASCII letters, digits and
/// `_` with `_`, prefixes a leading digit with `col_`, and maps an empty result
/// to `column`. Applying it twice gives the same result as applying it once.
pub fn clean_column_name(raw: &str) -> String {
    let mut cleaned: String = raw
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();

    if cleaned.is_empty() {
        return "column".to_string();
    }

    if cleaned.starts_with(|c: char| c.is_ascii_digit()) {
        cleaned.insert_str(0, "col_");
    }

    cleaned
}

/// Clean every header and disambiguate duplicates with `_2`, `_3`, ... in order
pub fn dedup_column_names<'a>(headers: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut used = HashSet::new();
    let mut names = Vec::new();

    for header in headers {
        let base = clean_column_name(header);
        let mut candidate = base.clone();
        let mut suffix = 2;
        while used.contains(&candidate) {
            candidate = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        used.insert(candidate.clone());
        names.push(candidate);
    }

    names
}

/// `dataset_<slug>_<8 hex chars>`, unique per call
pub fn backing_name_for(dataset_name: &str) -> String {
    let slug: String = dataset_name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("dataset_{}_{}", slug, &suffix[..8])
}

#[derive(Default, Clone)]
struct NumericStats {
    numeric: usize,
    non_numeric: usize,
    needs_float: bool,
}

impl NumericStats {
    fn observe(&mut self, value: &str) {
        if value.is_empty() {
            return;
        }
        if value.parse::<i64>().is_ok() {
            self.numeric += 1;
        } else if value.parse::<f64>().map(f64::is_finite).unwrap_or(false) {
            self.numeric += 1;
            self.needs_float = true;
        } else {
            self.non_numeric += 1;
        }
    }

    /// An all-empty column has no evidence either way and stays text
    fn column_type(&self) -> ColumnType {
        if self.numeric == 0 || self.non_numeric > 0 {
            ColumnType::Text
        } else if self.needs_float {
            ColumnType::Float
        } else {
            ColumnType::Integer
        }
    }
}

/// Infer the type of one column from its first-batch values
pub fn infer_column_type<'a>(values: impl IntoIterator<Item = Option<&'a str>>) -> ColumnType {
    let mut stats = NumericStats::default();
    for value in values.into_iter().flatten() {
        stats.observe(value);
    }
    stats.column_type()
}

struct ParsedTable {
    batch: RecordBatch,
    columns: Vec<Column>,
    row_count: usize,
}

/// Column-major text buffers for one batch of rows
struct TextBatch {
    columns: Vec<StringArray>,
}

fn flush(buffers: &mut [Vec<Option<String>>]) -> TextBatch {
    TextBatch {
        columns: buffers
            .iter_mut()
            .map(|buf| StringArray::from(std::mem::take(buf)))
            .collect(),
    }
}

fn parse_csv(content: &[u8], row_batch_size: usize) -> Result<ParsedTable, AppError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(content);

    let headers = reader
        .headers()
        .map_err(|e| AppError::MalformedInput(format!("Failed to read CSV header: {}", e)))?
        .clone();

    if headers.is_empty() {
        return Err(AppError::MalformedInput("CSV header is empty".to_string()));
    }

    let names = dedup_column_names(headers.iter());
    let width = names.len();

    let mut buffers: Vec<Vec<Option<String>>> = vec![Vec::with_capacity(row_batch_size); width];
    let mut batches: Vec<TextBatch> = Vec::new();
    let mut buffered = 0usize;
    let mut row_count = 0usize;

    for record in reader.records() {
        let record = record
            .map_err(|e| AppError::MalformedInput(format!("Failed to parse CSV row: {}", e)))?;

        for (buf, field) in buffers.iter_mut().zip(record.iter()) {
            buf.push(if field.is_empty() { None } else { Some(field.to_string()) });
        }
        buffered += 1;
        row_count += 1;

        if buffered == row_batch_size {
            batches.push(flush(&mut buffers));
            buffered = 0;
            tracing::debug!("Parsed {} rows", row_count);
        }
    }

    if buffered > 0 {
        batches.push(flush(&mut buffers));
    }

    if row_count == 0 {
        return Err(AppError::MalformedInput(
            "CSV has a header but no data rows".to_string(),
        ));
    }

    let first = &batches[0];
    let mut columns = Vec::with_capacity(width);
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(width);

    for (idx, name) in names.into_iter().enumerate() {
        let inferred = infer_column_type(first.columns[idx].iter());
        let parts: Vec<&StringArray> = batches.iter().map(|b| &b.columns[idx]).collect();
        let (column_type, array) = cast_with_widening(&parts, inferred);

        if column_type != inferred {
            tracing::info!(
                "Column {} widened from {} to {} by a later batch",
                name,
                inferred,
                column_type
            );
        }

        columns.push(Column::new(name, column_type));
        arrays.push(array);
    }

    let schema = Arc::new(Schema::new(
        columns
            .iter()
            .map(|c| Field::new(&c.name, arrow_type(c.column_type), true))
            .collect::<Vec<_>>(),
    ));

    let batch = RecordBatch::try_new_with_options(
        schema,
        arrays,
        &RecordBatchOptions::new().with_row_count(Some(row_count)),
    )
    .map_err(|e| AppError::Internal(format!("Failed to assemble record batch: {}", e)))?;

    Ok(ParsedTable {
        batch,
        columns,
        row_count,
    })
}

fn arrow_type(column_type: ColumnType) -> DataType {
    match column_type {
        ColumnType::Integer => DataType::Int64,
        ColumnType::Float => DataType::Float64,
        ColumnType::Text => DataType::Utf8,
    }
}

/// Cast every batch of one column to `inferred`, widening until all values fit
fn cast_with_widening(parts: &[&StringArray], inferred: ColumnType) -> (ColumnType, ArrayRef) {
    let mut column_type = inferred;
    loop {
        if let Some(array) = try_cast(parts, column_type) {
            return (column_type, array);
        }
        match column_type.widen() {
            Some(wider) => column_type = wider,
            None => return (ColumnType::Text, text_array(parts)),
        }
    }
}

fn text_array(parts: &[&StringArray]) -> ArrayRef {
    Arc::new(parts.iter().flat_map(|part| part.iter()).collect::<StringArray>())
}

fn try_cast(parts: &[&StringArray], column_type: ColumnType) -> Option<ArrayRef> {
    let values = parts.iter().flat_map(|part| part.iter());
    match column_type {
        ColumnType::Integer => {
            let parsed: Option<Vec<Option<i64>>> = values
                .map(|v| match v {
                    None => Some(None),
                    Some(s) => s.parse::<i64>().ok().map(Some),
                })
                .collect();
            parsed.map(|v| Arc::new(Int64Array::from(v)) as ArrayRef)
        }
        ColumnType::Float => {
            let parsed: Option<Vec<Option<f64>>> = values
                .map(|v| match v {
                    None => Some(None),
                    Some(s) => s.parse::<f64>().ok().filter(|f| f.is_finite()).map(Some),
                })
                .collect();
            parsed.map(|v| Arc::new(Float64Array::from(v)) as ArrayRef)
        }
        ColumnType::Text => Some(text_array(parts)),
    }
}

fn write_parquet(batch: &RecordBatch, path: &Path) -> Result<u64, AppError> {
    let file = std::fs::File::create(path)
        .map_err(|e| AppError::Internal(format!("Failed to create {}: {}", path.display(), e)))?;

    let props = WriterProperties::builder().build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))
        .map_err(|e| AppError::Internal(format!("Failed to open Parquet writer: {}", e)))?;
    writer
        .write(batch)
        .map_err(|e| AppError::Internal(format!("Failed to write Parquet data: {}", e)))?;
    writer
        .close()
        .map_err(|e| AppError::Internal(format!("Failed to finalize Parquet file: {}", e)))?;

    let metadata = std::fs::metadata(path)
        .map_err(|e| AppError::Internal(format!("Failed to stat {}: {}", path.display(), e)))?;
    Ok(metadata.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::columnar::SessionSettings;
    use std::time::Duration;
    use tempfile::tempdir;

    fn ingestion(root: &Path, row_batch_size: usize) -> (Arc<ColumnarEngine>, ChunkedIngestionEngine) {
        let engine = Arc::new(ColumnarEngine::new(
            root,
            Duration::from_secs(30),
            SessionSettings::default(),
        ));
        let ingestion = ChunkedIngestionEngine::new(engine.clone(), row_batch_size);
        (engine, ingestion)
    }

    #[test]
    fn test_clean_column_name_rules() {
        assert_eq!(clean_column_name("Patient Age"), "patient_age");
        assert_eq!(clean_column_name("2nd-dose (mg)"), "col_2nd_dose__mg_");
        assert_eq!(clean_column_name(""), "column");
        assert_eq!(clean_column_name("Gène"), "g_ne");
        assert_eq!(clean_column_name("already_clean"), "already_clean");
    }

    #[test]
    fn test_clean_column_name_is_idempotent() {
        for raw in ["Patient Age", "2nd-dose (mg)", "", "__x__", "9", "ÄÖÜ", "a.b.c"] {
            let once = clean_column_name(raw);
            assert_eq!(clean_column_name(&once), once, "input {:?}", raw);
        }
    }

    #[test]
    fn test_dedup_column_names() {
        let names = dedup_column_names(["A", "a", "A ", "a_2"]);
        assert_eq!(names, vec!["a", "a_2", "a_", "a_2_2"]);
    }

    #[test]
    fn test_backing_name_shape() {
        let name = backing_name_for("Sales Q1-2024");
        assert!(name.starts_with("dataset_sales_q1_2024_"));
        let suffix = name.rsplit('_').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(name, backing_name_for("Sales Q1-2024"));
    }

    #[test]
    fn test_type_inference() {
        assert_eq!(infer_column_type([Some("1"), Some("-2"), None]), ColumnType::Integer);
        assert_eq!(infer_column_type([Some("1"), Some("2.5")]), ColumnType::Float);
        assert_eq!(infer_column_type([Some("1"), Some("x")]), ColumnType::Text);
        assert_eq!(infer_column_type([None, None]), ColumnType::Text);
    }

    #[test]
    fn test_later_batch_widens_column() {
        let csv = "a,b\n1,1\n2,2\n3.5,x\n";
        let table = parse_csv(csv.as_bytes(), 2).unwrap();
        assert_eq!(table.columns[0].column_type, ColumnType::Float);
        assert_eq!(table.columns[1].column_type, ColumnType::Text);
        assert_eq!(table.row_count, 3);
    }

    #[test]
    fn test_header_only_is_malformed() {
        let result = parse_csv(b"a,b,c\n", 10);
        assert!(matches!(result, Err(AppError::MalformedInput(_))));

        let result = parse_csv(b"", 10);
        assert!(matches!(result, Err(AppError::MalformedInput(_))));
    }

    #[test]
    fn test_ragged_row_is_malformed() {
        let result = parse_csv(b"a,b\n1,2\n3\n", 10);
        assert!(matches!(result, Err(AppError::MalformedInput(_))));
    }

    #[tokio::test]
    async fn test_ingest_round_trip() {
        let dir = tempdir().unwrap();
        let (engine, ingestion) = ingestion(dir.path(), 2);

        let csv = "Id,Score,Label\n1,0.5,alpha\n2,1.5,\n3,,gamma\n4,2.0,delta\n5,3.25,eps\n";
        let table = ingestion.ingest(csv.as_bytes().to_vec(), "Round Trip").await.unwrap();

        assert_eq!(table.row_count, 5);
        assert!(table.file_path.exists());
        assert!(table.file_size > 0);
        let types: Vec<_> = table.columns.iter().map(|c| c.column_type).collect();
        assert_eq!(types, vec![ColumnType::Integer, ColumnType::Float, ColumnType::Text]);

        let rows = engine
            .query(&format!("SELECT * FROM {}", table.backing_name), 3)
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        let keys: Vec<_> = rows[0].keys().cloned().collect();
        assert_eq!(keys.len(), 3);
        assert!(rows[0].contains_key("label"));
        assert_eq!(rows[1]["label"], serde_json::Value::Null);

        let rows = engine
            .query(&format!("SELECT * FROM {}", table.backing_name), 100)
            .await
            .unwrap();
        assert_eq!(rows.len(), 5);
    }

    #[tokio::test]
    async fn test_failed_ingest_leaves_no_file() {
        let dir = tempdir().unwrap();
        let (_engine, ingestion) = ingestion(dir.path(), 10);

        let result = ingestion.ingest(b"a,b\n1,2\n3\n".to_vec(), "broken").await;
        assert!(matches!(result, Err(AppError::MalformedInput(_))));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "parquet").unwrap_or(false))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_drop_table_removes_file() {
        let dir = tempdir().unwrap();
        let (engine, ingestion) = ingestion(dir.path(), 10);

        let table = ingestion.ingest(b"x\n1\n".to_vec(), "drop me").await.unwrap();
        ingestion.drop_table(&table.backing_name).await.unwrap();

        assert!(!table.file_path.exists());
        assert!(!engine.is_registered(&table.backing_name));
    }
}
