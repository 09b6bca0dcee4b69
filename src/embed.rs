//! Embedding: the external provider interface and the batching client.

use crate::chunker::count_tokens;
use crate::config::EmbeddingConfig;
use crate::error::{EngineError, EngineResult};
use crate::metrics::Metrics;
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::warn;

const EMBED_ATTEMPTS: u32 = 3;
const EMBED_BACKOFF_MS: u64 = 100;

/// The opaque `text → vector` service. Implementations MUST be
/// deterministic for a given input and MUST preserve input order and length
/// in the output.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>>;
    fn dimension(&self) -> usize;
}

/// Batching front-end over an [`EmbeddingProvider`].
///
/// Inputs are grouped until a batch reaches the configured token budget or
/// item count, whichever comes first; batches run concurrently up to the
/// in-flight cap. Output order always matches input order.
pub struct EmbeddingClient {
    provider: Arc<dyn EmbeddingProvider>,
    dim: usize,
    batch_tokens: usize,
    batch_items: usize,
    inflight: Arc<Semaphore>,
    metrics: Arc<Metrics>,
}

impl EmbeddingClient {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        config: &EmbeddingConfig,
        metrics: Arc<Metrics>,
    ) -> EngineResult<Self> {
        if provider.dimension() != config.dim {
            return Err(EngineError::InvariantViolation(format!(
                "embedding dimension mismatch: provider {} vs configured {}",
                provider.dimension(),
                config.dim
            )));
        }
        Ok(Self {
            provider,
            dim: config.dim,
            batch_tokens: config.batch_tokens.max(1),
            batch_items: config.batch_items.max(1),
            inflight: Arc::new(Semaphore::new(config.max_inflight.max(1))),
            metrics,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    /// Embed texts in order. Transient provider failures are retried with
    /// backoff; a length or dimension mismatch is an invariant violation and
    /// fails the whole call.
    pub async fn embed_batch(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut batches: Vec<Vec<String>> = Vec::new();
        let mut current: Vec<String> = Vec::new();
        let mut current_tokens = 0usize;
        for text in texts {
            let tokens = count_tokens(text);
            let closes = !current.is_empty()
                && (current_tokens + tokens > self.batch_tokens
                    || current.len() >= self.batch_items);
            if closes {
                batches.push(std::mem::take(&mut current));
                current_tokens = 0;
            }
            current.push(text.clone());
            current_tokens += tokens;
        }
        if !current.is_empty() {
            batches.push(current);
        }

        let futures = batches.into_iter().map(|batch| self.run_batch(batch));
        let results = futures_util::future::try_join_all(futures).await?;
        Ok(results.into_iter().flatten().collect())
    }

    pub async fn embed_one(&self, text: &str) -> EngineResult<Vec<f32>> {
        let mut vectors = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        vectors.pop().ok_or_else(|| {
            EngineError::InvariantViolation("provider returned no vector for single input".into())
        })
    }

    async fn run_batch(&self, batch: Vec<String>) -> EngineResult<Vec<Vec<f32>>> {
        let _permit = self
            .inflight
            .acquire()
            .await
            .map_err(|_| EngineError::Cancelled)?;
        let start = std::time::Instant::now();
        let mut attempt = 0u32;
        loop {
            match self.provider.embed(&batch).await {
                Ok(vectors) => {
                    if vectors.len() != batch.len() {
                        return Err(EngineError::InvariantViolation(format!(
                            "provider returned {} vectors for {} inputs",
                            vectors.len(),
                            batch.len()
                        )));
                    }
                    if let Some(bad) = vectors.iter().find(|v| v.len() != self.dim) {
                        return Err(EngineError::InvariantViolation(format!(
                            "provider returned dimension {} vectors, expected {}",
                            bad.len(),
                            self.dim
                        )));
                    }
                    self.metrics.counter("embed.batches", 1);
                    self.metrics.counter("embed.texts", batch.len() as u64);
                    self.metrics
                        .histogram("embed.batch_latency_ms", start.elapsed().as_millis() as u64);
                    return Ok(vectors);
                }
                Err(e) if e.is_retryable() && attempt + 1 < EMBED_ATTEMPTS => {
                    attempt += 1;
                    warn!(attempt, error = %e, "embedding batch failed, retrying");
                    self.metrics.counter("embed.retries", 1);
                    let backoff = EMBED_BACKOFF_MS * 2u64.pow(attempt - 1);
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Deterministic offline provider: a feature-hashed bag of tokens projected
/// onto the unit sphere. Serves as the dependency-free default and as the
/// stand-in model in tests; any real model plugs in through the same trait.
pub struct HashingEmbedder {
    dim: usize,
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dim];
        for raw in text.split_whitespace() {
            let token: String = raw
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase();
            if token.is_empty() {
                continue;
            }
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let h = hasher.finish();
            let bucket = (h % self.dim as u64) as usize;
            let sign = if (h >> 32) & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dim
    }
}
