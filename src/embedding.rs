//! Embedding capability and implementations.
//!
//! Defines the [`Embedder`] trait and concrete backends:
//! - **[`DisabledEmbedder`]**: returns errors; used when embeddings are not configured.
//! - **[`OllamaEmbedder`]**: calls a local Ollama instance's `/api/embed` endpoint.
//! - **[`OpenAIEmbedder`]**: calls an OpenAI-compatible `/v1/embeddings` endpoint.
//!
//! [`embed_chunks`] drives an embedder over a whole run: chunks are split into
//! batches, batches run concurrently under a semaphore, and vectors are
//! reattached by batch position so the output stays in `chunk_id` order.
//!
//! # Provider Selection
//!
//! ```rust
//! # use docpack::config::EmbeddingConfig;
//! # use docpack::embedding::create_embedder;
//! let config = EmbeddingConfig {
//!     provider: "disabled".to_string(),
//!     ..EmbeddingConfig::default()
//! };
//! let embedder = create_embedder(&config).unwrap();
//! assert_eq!(embedder.model_name(), "disabled");
//! ```

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::EmbeddingConfig;
use crate::error::DocpackError;
use crate::http::{build_client, endpoint, post_json_with_retry};
use crate::models::{Chunk, PendingChunk};
use crate::progress::{ProgressEvent, ProgressReporter, Stage};

const OLLAMA_URL: &str = "http://localhost:11434";
const OPENAI_URL: &str = "https://api.openai.com";

/// Turns text into fixed-length vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"nomic-embed-text"`).
    fn model_name(&self) -> &str;

    /// Embed a batch of texts. Returns one vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

// ============ Disabled ============

pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("Embedding provider is disabled")
    }
}

// ============ Ollama ============

/// Calls `POST {url}/api/embed`. Requires Ollama to be running with the model
/// pulled (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaEmbedder {
    model: String,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self {
            model: config.model_name(),
            url: config.url.clone().unwrap_or_else(|| OLLAMA_URL.to_string()),
            max_retries: config.max_retries,
            client: build_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = post_json_with_retry(
            &self.client,
            &endpoint(&self.url, "/api/embed"),
            None,
            &body,
            self.max_retries,
            "Ollama",
        )
        .await?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;

    let mut result = Vec::with_capacity(embeddings.len());

    for embedding in embeddings {
        let vec = embedding
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: embedding is not an array"))?;
        result.push(parse_vector(vec)?);
    }

    Ok(result)
}

// ============ OpenAI ============

/// Calls `POST {url}/v1/embeddings`. Reads the key from `OPENAI_API_KEY`.
pub struct OpenAIEmbedder {
    model: String,
    url: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            model: config.model_name(),
            url: config.url.clone().unwrap_or_else(|| OPENAI_URL.to_string()),
            api_key,
            max_retries: config.max_retries,
            client: build_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = post_json_with_retry(
            &self.client,
            &endpoint(&self.url, "/v1/embeddings"),
            Some(&self.api_key),
            &body,
            self.max_retries,
            "OpenAI",
        )
        .await?;
        parse_openai_response(&json)
    }
}

/// Extracts `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());

    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, parse_vector(embedding)?));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn parse_vector(values: &[serde_json::Value]) -> Result<Vec<f32>> {
    values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| anyhow::anyhow!("embedding contains a non-numeric value"))
        })
        .collect()
}

/// Create the [`Embedder`] named by `config.provider`.
///
/// | Config Value | Embedder |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
/// | `"openai"` | [`OpenAIEmbedder`] |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Batch driver ============

fn batch_unit(batch: &[PendingChunk]) -> String {
    match (batch.first(), batch.last()) {
        (Some(first), Some(last)) => format!("chunks {}..={}", first.chunk_id, last.chunk_id),
        _ => "empty batch".to_string(),
    }
}

/// Embed every pending chunk and attach its vector.
///
/// Fails with [`DocpackError::Embedding`] naming the batch or chunk when a
/// call fails, returns the wrong number of vectors, or returns a vector whose
/// length differs from `expected_dims` (or from the first vector when no
/// dimensionality is configured).
pub async fn embed_chunks(
    embedder: Arc<dyn Embedder>,
    pending: Vec<PendingChunk>,
    batch_size: usize,
    concurrency: usize,
    expected_dims: Option<usize>,
    progress: &dyn ProgressReporter,
) -> crate::error::Result<Vec<Chunk>> {
    if pending.is_empty() {
        return Ok(Vec::new());
    }

    let batches: Vec<Vec<PendingChunk>> = pending
        .chunks(batch_size.max(1))
        .map(|batch| batch.to_vec())
        .collect();
    let total = pending.len() as u64;

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for (index, batch) in batches.iter().enumerate() {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let embedder = Arc::clone(&embedder);
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let result = match semaphore.acquire_owned().await {
                Ok(_permit) => embedder.embed_batch(&texts).await,
                Err(e) => Err(anyhow::anyhow!("embedding scheduler closed: {}", e)),
            };
            (index, result)
        });
    }

    let mut vectors: Vec<Option<Vec<Vec<f32>>>> = vec![None; batches.len()];
    let mut done = 0u64;

    while let Some(joined) = tasks.join_next().await {
        let (index, result) = joined.map_err(|e| DocpackError::Embedding {
            unit: "batch".to_string(),
            message: format!("embedding task failed: {}", e),
        })?;
        let batch = &batches[index];
        let batch_vectors = result.map_err(|e| DocpackError::Embedding {
            unit: batch_unit(batch),
            message: format!("{:#}", e),
        })?;
        if batch_vectors.len() != batch.len() {
            return Err(DocpackError::Embedding {
                unit: batch_unit(batch),
                message: format!(
                    "expected {} vectors, got {}",
                    batch.len(),
                    batch_vectors.len()
                ),
            });
        }
        done += batch.len() as u64;
        progress.report(ProgressEvent::Advanced {
            stage: Stage::Embedding,
            n: done,
            total,
        });
        vectors[index] = Some(batch_vectors);
    }

    let mut dims = expected_dims;
    let mut chunks = Vec::with_capacity(pending.len());
    for (batch, batch_vectors) in batches.into_iter().zip(vectors) {
        let batch_vectors = batch_vectors.ok_or_else(|| DocpackError::Embedding {
            unit: batch_unit(&batch),
            message: "batch produced no result".to_string(),
        })?;
        for (chunk, vector) in batch.into_iter().zip(batch_vectors) {
            let expected = *dims.get_or_insert(vector.len());
            if vector.is_empty() || vector.len() != expected {
                return Err(DocpackError::Embedding {
                    unit: format!("chunk {}", chunk.chunk_id),
                    message: format!(
                        "embedding has {} dimensions, expected {}",
                        vector.len(),
                        expected
                    ),
                });
            }
            chunks.push(chunk.into_chunk(vector));
        }
    }

    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use std::time::Duration;

    fn pending(n: u64) -> Vec<PendingChunk> {
        (0..n)
            .map(|id| PendingChunk {
                chunk_id: id,
                file_path: "a.rs".to_string(),
                start_line: id as usize + 1,
                end_line: id as usize + 1,
                tokens: 1,
                text: format!("text {}", id),
            })
            .collect()
    }

    /// Encodes the chunk number into the vector. Early batches sleep longer so
    /// they complete last.
    struct SlowEarlyEmbedder;

    #[async_trait]
    impl Embedder for SlowEarlyEmbedder {
        fn model_name(&self) -> &str {
            "fake"
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let ids: Vec<f32> = texts
                .iter()
                .map(|t| t.trim_start_matches("text ").parse::<f32>().unwrap())
                .collect();
            let delay = 40u64.saturating_sub(ids[0] as u64 * 4);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(ids.into_iter().map(|id| vec![id, 1.0]).collect())
        }
    }

    struct ShortEmbedder;

    #[async_trait]
    impl Embedder for ShortEmbedder {
        fn model_name(&self) -> &str {
            "short"
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().skip(1).map(|_| vec![0.0]).collect())
        }
    }

    struct RaggedEmbedder;

    #[async_trait]
    impl Embedder for RaggedEmbedder {
        fn model_name(&self) -> &str {
            "ragged"
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| vec![0.0; t.len() % 3 + 1]).collect())
        }
    }

    #[tokio::test]
    async fn test_results_reattached_in_order() {
        let chunks = embed_chunks(Arc::new(SlowEarlyEmbedder), pending(10), 3, 4, None, &NoProgress)
            .await
            .unwrap();
        assert_eq!(chunks.len(), 10);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_id, i as u64);
            assert_eq!(chunk.embedding, vec![i as f32, 1.0]);
            assert_eq!(chunk.cluster_id(), None);
        }
    }

    #[tokio::test]
    async fn test_expected_dims_enforced() {
        let err = embed_chunks(Arc::new(SlowEarlyEmbedder), pending(2), 8, 1, Some(3), &NoProgress)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "EmbeddingError");
        assert!(err.to_string().contains("chunk 0"));
    }

    #[tokio::test]
    async fn test_ragged_vectors_rejected() {
        let err = embed_chunks(Arc::new(RaggedEmbedder), pending(12), 4, 2, None, &NoProgress)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "EmbeddingError");
    }

    #[tokio::test]
    async fn test_vector_count_mismatch() {
        let err = embed_chunks(Arc::new(ShortEmbedder), pending(4), 4, 1, None, &NoProgress)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("chunks 0..=3"));
        assert!(err.to_string().contains("expected 4 vectors, got 3"));
    }

    #[tokio::test]
    async fn test_disabled_embedder_fails() {
        let err = embed_chunks(Arc::new(DisabledEmbedder), pending(1), 4, 1, None, &NoProgress)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }

    #[tokio::test]
    async fn test_empty_input_makes_no_calls() {
        let chunks = embed_chunks(Arc::new(DisabledEmbedder), Vec::new(), 4, 1, None, &NoProgress)
            .await
            .unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_parse_ollama_response() {
        let json = serde_json::json!({"embeddings": [[0.5, -1.0], [2.0, 0.0]]});
        let vectors = parse_ollama_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![0.5, -1.0], vec![2.0, 0.0]]);
        assert!(parse_ollama_response(&serde_json::json!({})).is_err());
        assert!(parse_ollama_response(&serde_json::json!({"embeddings": [["x"]]})).is_err());
    }

    #[test]
    fn test_parse_openai_response_orders_by_index() {
        let json = serde_json::json!({"data": [
            {"index": 1, "embedding": [1.0]},
            {"index": 0, "embedding": [0.0]},
        ]});
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![0.0], vec![1.0]]);
    }

    #[test]
    fn test_create_embedder_unknown() {
        let config = EmbeddingConfig {
            provider: "local".to_string(),
            ..EmbeddingConfig::default()
        };
        assert!(create_embedder(&config).is_err());
    }
}
