use serde::Deserialize;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub router: RouterConfig,
    pub columnar: ColumnarConfig,
    pub index: IndexConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Largest accepted upload body
    pub max_upload_mb: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding Parquet files, the catalog database and local index files
    pub root: PathBuf,
    /// Rows parsed per CSV batch during ingestion
    pub row_batch_size: usize,
    /// Column records committed per catalog transaction
    pub column_batch_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    /// Column-count ceiling of the relational path; wider CSVs go columnar
    pub max_columns: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColumnarConfig {
    pub query_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexConfig {
    /// One of `local`, `pinecone`, `qdrant`
    pub backend: String,
    /// Embedding model of the local and qdrant backends: a fastembed model name
    /// such as `all-minilm-l6-v2`, or `feature-hashing`
    pub local_model: String,
    /// Dimensionality of the `feature-hashing` embedder
    pub dims: usize,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub upsert_batch_size: usize,
    pub embedding_model: String,
    pub openai_api_key: Option<String>,
    pub pinecone_host: Option<String>,
    pub pinecone_api_key: Option<String>,
    pub pinecone_namespace: String,
    pub qdrant_url: String,
    pub qdrant_collection: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub style: String,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Pick up .env before reading overrides so it behaves like real env vars
        let _ = dotenv::dotenv();

        let mut builder = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3000)?
            .set_default("server.max_upload_mb", 1024)?
            .set_default("storage.root", "./data")?
            .set_default("storage.row_batch_size", 1000)?
            .set_default("storage.column_batch_size", 500)?
            .set_default("router.max_columns", 1600)?
            .set_default("columnar.query_timeout_secs", 30)?
            .set_default("index.backend", "local")?
            .set_default("index.local_model", "all-minilm-l6-v2")?
            .set_default("index.dims", 384)?
            .set_default("index.timeout_secs", 30)?
            .set_default("index.max_retries", 5)?
            .set_default("index.upsert_batch_size", 50)?
            .set_default("index.embedding_model", "text-embedding-3-small")?
            .set_default("index.pinecone_namespace", "default")?
            .set_default("index.qdrant_url", "http://localhost:6333")?
            .set_default("index.qdrant_collection", "column_metadata")?
            .set_default("logging.level", "info")?
            .set_default("logging.style", "auto")?;

        if let Ok(host) = env::var("HOST") {
            builder = builder.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            builder = builder.set_override("server.port", port.parse::<u16>().unwrap_or(3000))?;
        }

        if let Ok(max_upload) = env::var("MAX_UPLOAD_MB") {
            builder = builder.set_override("server.max_upload_mb", max_upload.parse::<u64>().unwrap_or(1024))?;
        }

        if let Ok(root) = env::var("STORAGE_PATH") {
            builder = builder.set_override("storage.root", root)?;
        }

        if let Ok(rows) = env::var("ROW_BATCH_SIZE") {
            builder = builder.set_override("storage.row_batch_size", rows.parse::<u64>().unwrap_or(1000))?;
        }

        if let Ok(cols) = env::var("COLUMN_BATCH_SIZE") {
            builder = builder.set_override("storage.column_batch_size", cols.parse::<u64>().unwrap_or(500))?;
        }

        if let Ok(max_columns) = env::var("MAX_COLUMNS") {
            builder = builder.set_override("router.max_columns", max_columns.parse::<u64>().unwrap_or(1600))?;
        }

        if let Ok(timeout) = env::var("QUERY_TIMEOUT_SECS") {
            builder = builder.set_override("columnar.query_timeout_secs", timeout.parse::<u64>().unwrap_or(30))?;
        }

        if let Ok(backend) = env::var("VECTOR_STORE_TYPE") {
            builder = builder.set_override("index.backend", backend.to_lowercase())?;
        }

        if let Ok(model) = env::var("LOCAL_EMBEDDING_MODEL") {
            builder = builder.set_override("index.local_model", model.to_lowercase())?;
        }

        if let Ok(model) = env::var("EMBEDDING_MODEL") {
            builder = builder.set_override("index.embedding_model", model)?;
        }

        if let Ok(api_key) = env::var("OPENAI_API_KEY") {
            builder = builder.set_override("index.openai_api_key", Some(api_key))?;
        }

        if let Ok(host) = env::var("PINECONE_HOST") {
            builder = builder.set_override("index.pinecone_host", Some(host))?;
        }

        if let Ok(api_key) = env::var("PINECONE_API_KEY") {
            builder = builder.set_override("index.pinecone_api_key", Some(api_key))?;
        }

        if let Ok(namespace) = env::var("PINECONE_NAMESPACE") {
            builder = builder.set_override("index.pinecone_namespace", namespace)?;
        }

        if let Ok(qdrant_url) = env::var("QDRANT_URL") {
            builder = builder.set_override("index.qdrant_url", qdrant_url)?;
        }

        if let Ok(log_level) = env::var("RUST_LOG") {
            builder = builder.set_override("logging.level", log_level)?;
        }

        if let Ok(log_style) = env::var("RUST_LOG_STYLE") {
            builder = builder.set_override("logging.style", log_style)?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.server.max_upload_mb.saturating_mul(1024 * 1024)
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Location of the SQLite metadata catalog
    pub fn catalog_path(&self) -> PathBuf {
        self.storage.root.join("metadata.sqlite")
    }

    /// Cache directory for downloaded embedding models
    pub fn model_cache_path(&self) -> PathBuf {
        self.storage.root.join("models")
    }
}

#[cfg(test)]
impl Config {
    /// Defaults rooted at `root`, without touching the process environment
    pub fn for_tests(root: &std::path::Path) -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                max_upload_mb: 16,
            },
            storage: StorageConfig {
                root: root.to_path_buf(),
                row_batch_size: 1000,
                column_batch_size: 500,
            },
            router: RouterConfig { max_columns: 1600 },
            columnar: ColumnarConfig { query_timeout_secs: 30 },
            index: IndexConfig {
                backend: "local".to_string(),
                local_model: "feature-hashing".to_string(),
                dims: 384,
                timeout_secs: 5,
                max_retries: 0,
                upsert_batch_size: 50,
                embedding_model: "text-embedding-3-small".to_string(),
                openai_api_key: None,
                pinecone_host: None,
                pinecone_api_key: None,
                pinecone_namespace: "default".to_string(),
                qdrant_url: "http://localhost:6333".to_string(),
                qdrant_collection: "column_metadata".to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                style: "auto".to_string(),
            },
        }
    }
}
