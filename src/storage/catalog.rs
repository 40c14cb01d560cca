use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::functions::FunctionFlags;
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::models::{
    Column, ColumnGroup, ColumnGroupSummary, ColumnReconciliation, ColumnType, Dataset,
    DatasetColumns, DatasetDetail, STORAGE_FORMAT_PARQUET,
};
use crate::storage::column_groups::{self, GROUPING_THRESHOLD};

/// Number of columns returned in place of the full list for grouped datasets
pub const COLUMN_SAMPLE_SIZE: usize = 10;

/// Everything the catalog records about a freshly ingested dataset
#[derive(Debug, Clone)]
pub struct NewDataset<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub description: Option<&'a str>,
    pub backing_name: &'a str,
    pub columns: &'a [Column],
    pub row_count: usize,
    pub file_size: u64,
    pub tags: &'a [String],
}

/// SQLite metadata catalog for wide datasets, their columns and column groups.
/// Uses tokio::Mutex for async-friendly locking
pub struct SqliteCatalog {
    conn: Arc<Mutex<Connection>>,
    column_batch_size: usize,
}

impl SqliteCatalog {
    /// Open (or create) the catalog database at `db_path`
    pub async fn new<P: AsRef<Path>>(db_path: P, column_batch_size: usize) -> SqliteResult<Self> {
        // Handle SQLite URL format (sqlite:./path or sqlite://path)
        let path_str = db_path.as_ref().to_string_lossy();
        let clean_path: &str = if path_str.starts_with("sqlite:") {
            let mut cleaned = path_str.trim_start_matches("sqlite:");
            cleaned = cleaned.trim_start_matches("//");
            cleaned
        } else {
            path_str.as_ref()
        };

        let conn = Connection::open(clean_path)?;
        register_functions(&conn)?;
        let catalog = Self {
            conn: Arc::new(Mutex::new(conn)),
            column_batch_size: column_batch_size.max(1),
        };
        catalog.init_schema().await?;
        Ok(catalog)
    }

    /// In-memory catalog, used by tests and throwaway sessions
    pub async fn in_memory(column_batch_size: usize) -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        register_functions(&conn)?;
        let catalog = Self {
            conn: Arc::new(Mutex::new(conn)),
            column_batch_size: column_batch_size.max(1),
        };
        catalog.init_schema().await?;
        Ok(catalog)
    }

    async fn init_schema(&self) -> SqliteResult<()> {
        let conn = self.conn.lock().await;

        // Enable foreign key constraints so columns and groups follow their dataset
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS datasets (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                backing_name TEXT NOT NULL,
                created_at TEXT NOT NULL,
                column_count INTEGER NOT NULL,
                row_count INTEGER NOT NULL,
                file_size INTEGER NOT NULL,
                storage_format TEXT NOT NULL DEFAULT 'parquet',
                tags TEXT
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS columns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                dataset_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                name TEXT NOT NULL,
                type TEXT NOT NULL,
                description TEXT,
                embedding_id TEXT,
                FOREIGN KEY (dataset_id) REFERENCES datasets(id) ON DELETE CASCADE,
                UNIQUE(dataset_id, name)
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS column_groups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                dataset_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                columns TEXT NOT NULL,
                FOREIGN KEY (dataset_id) REFERENCES datasets(id) ON DELETE CASCADE
            )
            "#,
            [],
        )?;

        // Mirror of the external database_info record a CSV upload may be linked to
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS catalog_links (
                id TEXT PRIMARY KEY,
                backing_name TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_columns_dataset_position ON columns(dataset_id, position)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_column_groups_dataset ON column_groups(dataset_id)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_datasets_created ON datasets(created_at DESC)",
            [],
        )?;

        Ok(())
    }

    /// Record a dataset and its columns.
    ///
    /// The dataset row is written first, then columns in batches of
    /// `column_batch_size`, each batch committed on its own. A crash part-way
    /// leaves a dataset with fewer stored columns than `column_count`, which
    /// [`reconcile`](Self::reconcile) reports. Groups are derived for datasets
    /// wider than the grouping threshold.
    pub async fn store_dataset(&self, dataset: &NewDataset<'_>) -> SqliteResult<String> {
        let mut conn = self.conn.lock().await;

        let tags_json = if dataset.tags.is_empty() {
            None
        } else {
            serde_json::to_string(dataset.tags).ok()
        };

        conn.execute(
            r#"
            INSERT INTO datasets
            (id, name, description, backing_name, created_at, column_count, row_count, file_size, storage_format, tags)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                dataset.id,
                dataset.name,
                dataset.description,
                dataset.backing_name,
                format_timestamp(&Utc::now()),
                dataset.columns.len() as i64,
                dataset.row_count as i64,
                dataset.file_size as i64,
                STORAGE_FORMAT_PARQUET,
                tags_json,
            ],
        )?;

        let total = dataset.columns.len();
        for (batch_idx, batch) in dataset.columns.chunks(self.column_batch_size).enumerate() {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO columns (dataset_id, position, name, type, description, embedding_id) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for (offset, column) in batch.iter().enumerate() {
                    let position = batch_idx * self.column_batch_size + offset;
                    stmt.execute(params![
                        dataset.id,
                        position as i64,
                        column.name,
                        column.column_type.as_str(),
                        column.description,
                        column.embedding_id,
                    ])?;
                }
            }
            tx.commit()?;

            tracing::debug!(
                "Stored metadata for {}/{} columns of dataset {}",
                (batch_idx * self.column_batch_size + batch.len()).min(total),
                total,
                dataset.id
            );
        }

        if column_groups::needs_groups(total) {
            let groups = column_groups::derive_groups(dataset.columns);
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO column_groups (dataset_id, name, description, columns) VALUES (?1, ?2, ?3, ?4)",
                )?;
                for group in &groups {
                    let members = serde_json::to_string(&group.columns)
                        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                    stmt.execute(params![dataset.id, group.name, group.description, members])?;
                }
            }
            tx.commit()?;
            tracing::info!("Created {} column groups for dataset {}", groups.len(), dataset.id);
        }

        Ok(dataset.id.to_string())
    }

    /// Get a dataset with its columns, or with groups and a column sample when wide
    pub async fn get_dataset(&self, id: &str) -> SqliteResult<Option<DatasetDetail>> {
        let conn = self.conn.lock().await;

        let dataset = match query_dataset(&conn, id)? {
            Some(dataset) => dataset,
            None => return Ok(None),
        };

        let columns = if dataset.column_count > GROUPING_THRESHOLD {
            let mut stmt = conn.prepare(
                "SELECT id, name, description FROM column_groups WHERE dataset_id = ?1 ORDER BY id",
            )?;
            let column_groups = stmt
                .query_map(params![id], |row| {
                    Ok(ColumnGroupSummary {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        description: row.get(2)?,
                    })
                })?
                .collect::<SqliteResult<Vec<_>>>()?;

            DatasetColumns::Grouped {
                column_groups,
                columns_truncated: true,
                columns_sample: query_columns(&conn, id, 0, COLUMN_SAMPLE_SIZE)?,
            }
        } else {
            DatasetColumns::Full {
                columns: query_columns(&conn, id, 0, usize::MAX)?,
            }
        };

        Ok(Some(DatasetDetail { dataset, columns }))
    }

    /// Dataset record without its columns
    pub async fn find_dataset(&self, id: &str) -> SqliteResult<Option<Dataset>> {
        let conn = self.conn.lock().await;
        query_dataset(&conn, id)
    }

    /// List datasets newest first, optionally filtered by name or description
    pub async fn list_datasets(
        &self,
        offset: usize,
        limit: usize,
        search: Option<&str>,
    ) -> SqliteResult<Vec<Dataset>> {
        let conn = self.conn.lock().await;
        let limit = clamp_i64(limit);
        let offset = clamp_i64(offset);

        let datasets = match search.map(str::trim).filter(|s| !s.is_empty()) {
            Some(term) => {
                let pattern = format!("%{}%", escape_like(&term.to_lowercase()));
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM datasets WHERE unicode_lower(name) LIKE ?1 ESCAPE '\\' OR unicode_lower(description) LIKE ?1 ESCAPE '\\' ORDER BY created_at DESC, rowid DESC LIMIT ?2 OFFSET ?3",
                    DATASET_COLUMNS
                ))?;
                let rows = stmt.query_map(params![pattern, limit, offset], dataset_from_row)?;
                rows.collect::<SqliteResult<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM datasets ORDER BY created_at DESC, rowid DESC LIMIT ?1 OFFSET ?2",
                    DATASET_COLUMNS
                ))?;
                let rows = stmt.query_map(params![limit, offset], dataset_from_row)?;
                rows.collect::<SqliteResult<Vec<_>>>()?
            }
        };

        Ok(datasets)
    }

    /// Page through a dataset's columns in ingestion order
    pub async fn list_columns(
        &self,
        dataset_id: &str,
        offset: usize,
        limit: usize,
    ) -> SqliteResult<Vec<Column>> {
        let conn = self.conn.lock().await;
        query_columns(&conn, dataset_id, offset, limit)
    }

    /// Get a column group with its member names
    pub async fn get_column_group(&self, group_id: i64) -> SqliteResult<Option<ColumnGroup>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, dataset_id, name, description, columns FROM column_groups WHERE id = ?1",
            params![group_id],
            |row| {
                let members: String = row.get(4)?;
                let columns = serde_json::from_str(&members).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
                })?;
                Ok(ColumnGroup {
                    id: row.get(0)?,
                    dataset_id: row.get(1)?,
                    name: row.get(2)?,
                    description: row.get(3)?,
                    columns,
                })
            },
        )
        .optional()
    }

    /// Set the human description of one column
    pub async fn update_column_description(
        &self,
        dataset_id: &str,
        column_name: &str,
        description: &str,
    ) -> SqliteResult<bool> {
        let conn = self.conn.lock().await;
        let rows_affected = conn.execute(
            "UPDATE columns SET description = ?1 WHERE dataset_id = ?2 AND name = ?3",
            params![description, dataset_id, column_name],
        )?;
        Ok(rows_affected > 0)
    }

    /// Compare the recorded column count with the column rows actually stored
    pub async fn reconcile(&self, dataset_id: &str) -> SqliteResult<Option<ColumnReconciliation>> {
        let conn = self.conn.lock().await;
        let expected: Option<i64> = conn
            .query_row(
                "SELECT column_count FROM datasets WHERE id = ?1",
                params![dataset_id],
                |row| row.get(0),
            )
            .optional()?;

        let expected = match expected {
            Some(expected) => expected as usize,
            None => return Ok(None),
        };

        let stored: i64 = conn.query_row(
            "SELECT COUNT(*) FROM columns WHERE dataset_id = ?1",
            params![dataset_id],
            |row| row.get(0),
        )?;
        let stored = stored as usize;

        Ok(Some(ColumnReconciliation {
            dataset_id: dataset_id.to_string(),
            expected,
            stored,
            is_complete: expected == stored,
        }))
    }

    /// Delete a dataset; its columns and groups go with it
    pub async fn delete_dataset(&self, id: &str) -> SqliteResult<bool> {
        let conn = self.conn.lock().await;
        let rows_affected = conn.execute("DELETE FROM datasets WHERE id = ?1", params![id])?;
        Ok(rows_affected > 0)
    }

    /// Record the backing table/file name on a catalog link
    pub async fn set_link_backing_name(&self, link_id: &str, backing_name: &str) -> SqliteResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO catalog_links (id, backing_name, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET backing_name = excluded.backing_name, updated_at = excluded.updated_at
            "#,
            params![link_id, backing_name, format_timestamp(&Utc::now())],
        )?;
        Ok(())
    }

    /// Backing name currently recorded on a catalog link
    pub async fn get_link_backing_name(&self, link_id: &str) -> SqliteResult<Option<String>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT backing_name FROM catalog_links WHERE id = ?1",
            params![link_id],
            |row| row.get(0),
        )
        .optional()
    }

    /// Backing names of every stored dataset, used to re-register files at startup
    pub async fn list_backing_names(&self) -> SqliteResult<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT backing_name FROM datasets")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect()
    }

    #[cfg(test)]
    async fn delete_columns_for_test(&self, dataset_id: &str, keep: usize) -> SqliteResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM columns WHERE dataset_id = ?1 AND position >= ?2",
            params![dataset_id, keep as i64],
        )?;
        Ok(())
    }
}

const DATASET_COLUMNS: &str =
    "id, name, description, backing_name, created_at, column_count, row_count, file_size, storage_format, tags";

fn query_dataset(conn: &Connection, id: &str) -> SqliteResult<Option<Dataset>> {
    conn.query_row(
        &format!("SELECT {} FROM datasets WHERE id = ?1", DATASET_COLUMNS),
        params![id],
        dataset_from_row,
    )
    .optional()
}

fn query_columns(
    conn: &Connection,
    dataset_id: &str,
    offset: usize,
    limit: usize,
) -> SqliteResult<Vec<Column>> {
    let mut stmt = conn.prepare_cached(
        "SELECT name, type, description, embedding_id FROM columns WHERE dataset_id = ?1 ORDER BY position LIMIT ?2 OFFSET ?3",
    )?;
    let rows = stmt.query_map(params![dataset_id, clamp_i64(limit), clamp_i64(offset)], |row| {
        let type_tag: String = row.get(1)?;
        Ok(Column {
            name: row.get(0)?,
            column_type: ColumnType::parse(&type_tag).unwrap_or(ColumnType::Text),
            description: row.get(2)?,
            embedding_id: row.get(3)?,
        })
    })?;
    rows.collect()
}

fn dataset_from_row(row: &rusqlite::Row<'_>) -> SqliteResult<Dataset> {
    let created_at: String = row.get(4)?;
    let tags: Option<String> = row.get(9)?;
    Ok(Dataset {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        backing_name: row.get(3)?,
        created_at: parse_timestamp(&created_at, 4)?,
        column_count: row.get::<_, i64>(5)? as usize,
        row_count: row.get::<_, i64>(6)? as usize,
        file_size: row.get::<_, i64>(7)? as u64,
        storage_format: row.get(8)?,
        tags: tags
            .and_then(|t| serde_json::from_str(&t).ok())
            .unwrap_or_default(),
    })
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str, idx: usize) -> SqliteResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

/// `lower()` that folds non-ASCII letters too; SQLite's own only folds ASCII
fn register_functions(conn: &Connection) -> SqliteResult<()> {
    conn.create_scalar_function(
        "unicode_lower",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let text: Option<String> = ctx.get(0)?;
            Ok(text.map(|t| t.to_lowercase()))
        },
    )
}

fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn clamp_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
