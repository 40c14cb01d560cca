//! Embedding providers.
//!
//! - [`FastEmbedder`]: sentence-embedding model run in-process through
//!   fastembed (default `all-minilm-l6-v2`), used by the local and Qdrant
//!   backends. Needs the `local-embeddings-fastembed` feature; the model is
//!   downloaded once and cached.
//! - [`HashingEmbedder`]: deterministic feature hashing with no model files,
//!   selected with `LOCAL_EMBEDDING_MODEL=feature-hashing` and used by tests.
//! - [`OpenAiEmbedder`]: calls the OpenAI embeddings API in batches with retry
//!   and backoff; used by the Pinecone backend.

use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::remote::{self, RemoteError};
use crate::api::middleware::AppError;
use crate::config::IndexConfig;

const OPENAI_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";

/// Texts sent per embeddings request
const OPENAI_BATCH_SIZE: usize = 100;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier recorded next to stored vectors
    fn model_name(&self) -> &str;

    /// Vector dimensionality
    fn dims(&self) -> usize;

    /// Embed a batch of texts, one vector per text in input order
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError>;

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, AppError> {
        self.embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::BackendUnavailable("Empty embedding response".to_string()))
    }
}

/// `local_model` value selecting [`HashingEmbedder`]
pub const HASHING_MODEL: &str = "feature-hashing";

/// Build the embedder of the local and Qdrant backends
pub async fn create_local_embedder(config: &IndexConfig, cache_dir: &Path) -> Result<Arc<dyn Embedder>, AppError> {
    if config.local_model == HASHING_MODEL {
        return Ok(Arc::new(HashingEmbedder::new(config.dims)));
    }
    load_local_model(&config.local_model, cache_dir).await
}

#[cfg(feature = "local-embeddings-fastembed")]
async fn load_local_model(model_name: &str, cache_dir: &Path) -> Result<Arc<dyn Embedder>, AppError> {
    Ok(Arc::new(FastEmbedder::load(model_name, cache_dir).await?))
}

#[cfg(not(feature = "local-embeddings-fastembed"))]
async fn load_local_model(model_name: &str, _cache_dir: &Path) -> Result<Arc<dyn Embedder>, AppError> {
    Err(AppError::Validation(format!(
        "Local embedding model '{}' requires --features local-embeddings-fastembed (or LOCAL_EMBEDDING_MODEL={})",
        model_name, HASHING_MODEL
    )))
}

// ============ Local Model (fastembed) ============

/// Texts per inference batch
#[cfg(feature = "local-embeddings-fastembed")]
const LOCAL_BATCH_SIZE: usize = 64;

#[cfg(feature = "local-embeddings-fastembed")]
fn fastembed_model(name: &str) -> Result<(fastembed::EmbeddingModel, usize), AppError> {
    match name {
        "all-minilm-l6-v2" => Ok((fastembed::EmbeddingModel::AllMiniLML6V2, 384)),
        "bge-small-en-v1.5" => Ok((fastembed::EmbeddingModel::BGESmallENV15, 384)),
        "bge-base-en-v1.5" => Ok((fastembed::EmbeddingModel::BGEBaseENV15, 768)),
        "multilingual-e5-small" => Ok((fastembed::EmbeddingModel::MultilingualE5Small, 384)),
        other => Err(AppError::Validation(format!(
            "Unknown local embedding model: '{}'. Supported models: all-minilm-l6-v2, \
             bge-small-en-v1.5, bge-base-en-v1.5, multilingual-e5-small, {}",
            other, HASHING_MODEL
        ))),
    }
}

/// Sentence-embedding model loaded once and run on the blocking pool
#[cfg(feature = "local-embeddings-fastembed")]
pub struct FastEmbedder {
    model: Arc<std::sync::Mutex<fastembed::TextEmbedding>>,
    model_name: String,
    dims: usize,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl FastEmbedder {
    /// Load `model_name`, downloading it into `cache_dir` on first use
    pub async fn load(model_name: &str, cache_dir: &Path) -> Result<Self, AppError> {
        let (model, dims) = fastembed_model(model_name)?;
        let cache_dir = cache_dir.to_path_buf();

        let loaded = tokio::task::spawn_blocking(move || {
            fastembed::TextEmbedding::try_new(
                fastembed::InitOptions::new(model)
                    .with_cache_dir(cache_dir)
                    .with_show_download_progress(false),
            )
            .map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| AppError::Internal(format!("Embedding model task failed: {}", e)))?
        .map_err(|e| {
            AppError::BackendUnavailable(format!(
                "Failed to initialize local embedding model {}: {}",
                model_name, e
            ))
        })?;

        tracing::info!("Loaded local embedding model {} ({} dims)", model_name, dims);
        Ok(Self {
            model: Arc::new(std::sync::Mutex::new(loaded)),
            model_name: model_name.to_string(),
            dims,
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl Embedder for FastEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let model = self.model.clone();
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| AppError::Internal("Embedding model lock poisoned".to_string()))?;
            model
                .embed(texts, Some(LOCAL_BATCH_SIZE))
                .map_err(|e| AppError::BackendUnavailable(format!("Local embedding failed: {}", e)))
        })
        .await
        .map_err(|e| AppError::Internal(format!("Embedding task failed: {}", e)))?
    }
}

// ============ Hashing Embedder ============

/// Feature-hashing embedder over word tokens and character trigrams.
///
/// Each feature is hashed (FNV-1a) into one of `dims` buckets with a hash
/// derived sign, and the result is L2-normalized, so cosine similarity
/// reflects shared words and word fragments.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dims: usize,
    model_name: String,
}

const WORD_WEIGHT: f32 = 1.0;
const TRIGRAM_WEIGHT: f32 = 0.5;

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        let dims = dims.max(1);
        Self {
            dims,
            model_name: format!("feature-hashing-{}", dims),
        }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];

        for token in tokenize(text) {
            self.add_feature(&mut vector, token.as_bytes(), WORD_WEIGHT);

            let padded: Vec<char> = format!("#{}#", token).chars().collect();
            for gram in padded.windows(3) {
                let gram: String = gram.iter().collect();
                self.add_feature(&mut vector, gram.as_bytes(), TRIGRAM_WEIGHT);
            }
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in vector.iter_mut() {
                *x /= norm;
            }
        }
        vector
    }

    fn add_feature(&self, vector: &mut [f32], feature: &[u8], weight: f32) {
        let hash = fnv1a(feature);
        let bucket = (hash % self.dims as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Lower-cased alphanumeric runs; `_`, `-` and punctuation separate words
fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a < f32::EPSILON || mag_b < f32::EPSILON {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

// ============ OpenAI Embedder ============

/// Embedding provider using the OpenAI API (`POST /v1/embeddings`)
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dims: usize,
    max_retries: u32,
    deadline: Duration,
}

impl OpenAiEmbedder {
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self, AppError> {
        let model = model.into();
        Ok(Self {
            client: remote::build_client(timeout)?,
            api_key: api_key.into(),
            dims: known_dims(&model),
            model,
            max_retries,
            deadline: timeout,
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let json = remote::send_json(
            || {
                self.client
                    .post(OPENAI_EMBEDDINGS_URL)
                    .bearer_auth(&self.api_key)
                    .json(&body)
            },
            self.max_retries,
            self.deadline,
        )
        .await
        .map_err(|e: RemoteError| e.into_app_error("OpenAI embeddings"))?;

        let embeddings = parse_openai_response(&json)?;
        if embeddings.len() != texts.len() {
            return Err(AppError::BackendUnavailable(format!(
                "OpenAI returned {} embeddings for {} inputs",
                embeddings.len(),
                texts.len()
            )));
        }
        Ok(embeddings)
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for (idx, chunk) in texts.chunks(OPENAI_BATCH_SIZE).enumerate() {
            vectors.extend(self.embed_batch(chunk).await?);
            tracing::debug!(
                "Embedded {}/{} texts with {}",
                (idx * OPENAI_BATCH_SIZE + chunk.len()).min(texts.len()),
                texts.len(),
                self.model
            );
        }
        Ok(vectors)
    }
}

fn known_dims(model: &str) -> usize {
    match model {
        "text-embedding-3-large" => 3072,
        _ => 1536,
    }
}

/// Extract `data[].embedding` in input order, using `index` when present
fn parse_openai_response(json: &Value) -> Result<Vec<Vec<f32>>, AppError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| {
            AppError::BackendUnavailable("Invalid OpenAI response: missing data array".to_string())
        })?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| {
                AppError::BackendUnavailable("Invalid OpenAI response: missing embedding".to_string())
            })?;

        let vector: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        let index = item
            .get("index")
            .and_then(Value::as_u64)
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, vector));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashing_embedder_is_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(384);
        let a = embedder.embed_one("Column patient_age (Type: integer)");
        let b = embedder.embed_one("Column patient_age (Type: integer)");
        assert_eq!(a, b);
        assert_eq!(a.len(), 384);

        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_shared_words_score_higher() {
        let embedder = HashingEmbedder::new(384);
        let query = embedder.embed_one("average age");
        let age = embedder.embed_one("Column patient_age: patient age (Type: integer)");
        let glucose = embedder.embed_one("Column glucose_level: glucose level (Type: float)");

        assert!(cosine_similarity(&query, &age) > cosine_similarity(&query, &glucose));
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let embedder = HashingEmbedder::new(16);
        let v = embedder.embed_one("  ");
        assert!(v.iter().all(|x| *x == 0.0));
        assert_eq!(cosine_similarity(&v, &v), 0.0);
    }

    #[test]
    fn test_parse_openai_response_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);

        assert!(parse_openai_response(&serde_json::json!({})).is_err());
    }

    #[tokio::test]
    async fn test_hashing_model_needs_no_download() {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::config::Config::for_tests(dir.path()).index;
        let embedder = create_local_embedder(&config, dir.path()).await.unwrap();
        assert_eq!(embedder.dims(), 384);
        assert_eq!(embedder.model_name(), "feature-hashing-384");
        assert!(!dir.path().join("models").exists());
    }

    #[cfg(feature = "local-embeddings-fastembed")]
    #[test]
    fn test_fastembed_model_names() {
        assert_eq!(fastembed_model("all-minilm-l6-v2").unwrap().1, 384);
        assert_eq!(fastembed_model("bge-base-en-v1.5").unwrap().1, 768);
        assert!(matches!(fastembed_model("word2vec"), Err(AppError::Validation(_))));
    }

    /// Downloads all-minilm-l6-v2 on first run
    #[cfg(feature = "local-embeddings-fastembed")]
    #[tokio::test]
    #[ignore]
    async fn test_local_model_matches_synonyms() {
        let dir = tempfile::tempdir().unwrap();
        let embedder = FastEmbedder::load("all-minilm-l6-v2", dir.path()).await.unwrap();
        let texts: Vec<String> = [
            "Column glucose_level: glucose level (Type: float)",
            "Column patient_age: patient age (Type: integer)",
            "Column systolic_bp: systolic bp (Type: float)",
        ]
        .iter()
        .map(|t| t.to_string())
        .collect();
        let vectors = embedder.embed(&texts).await.unwrap();
        assert_eq!(vectors[0].len(), 384);

        let query = embedder.embed_query("blood sugar").await.unwrap();
        let scores: Vec<f32> = vectors.iter().map(|v| cosine_similarity(&query, v)).collect();
        assert!(scores[0] > scores[1]);
        assert!(scores[0] > scores[2]);
    }

    #[tokio::test]
    async fn test_embed_query_uses_batch_path() {
        let embedder = HashingEmbedder::new(32);
        let v = embedder.embed_query("blood pressure").await.unwrap();
        assert_eq!(v, embedder.embed_one("blood pressure"));
    }
}
