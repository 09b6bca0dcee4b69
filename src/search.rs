//! Hybrid search: semantic similarity, deterministic predicates, optional
//! cross-encoder re-ranking, and cached query embeddings.

use crate::cache::{CacheStats, TtlCache};
use crate::chunker::ChunkMetadata;
use crate::config::{CacheConfig, SearchConfig};
use crate::embed::EmbeddingClient;
use crate::error::{EngineError, EngineResult};
use crate::metrics::Metrics;
use crate::store::{MetadataFilter, VectorStore};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Optional cross-encoder re-ranker. Raw scores are unbounded; the service
/// maps them through a sigmoid before combining.
#[async_trait]
pub trait CrossEncoder: Send + Sync {
    async fn score(&self, query: &str, documents: &[String]) -> EngineResult<Vec<f32>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpansionStrategy {
    Rule,
    Model,
    Hybrid,
}

#[derive(Debug, Clone)]
pub struct Expansion {
    pub text: String,
    pub confidence: f32,
    pub strategy: ExpansionStrategy,
}

/// Optional query expander. Must be non-blocking and never fail: on any
/// internal trouble, return the original text with confidence 0.
#[async_trait]
pub trait QueryExpander: Send + Sync {
    async fn expand(&self, query: &str) -> Expansion;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: String,
    pub top_k: usize,
    pub keyword_filter: Option<String>,
    pub metadata_filter: Option<MetadataFilter>,
    pub use_cache: bool,
    pub use_rerank: bool,
    pub use_expansion: bool,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            top_k: 10,
            keyword_filter: None,
            metadata_filter: None,
            use_cache: true,
            use_rerank: false,
            // Off by default: measured cost outweighs recall gains.
            use_expansion: false,
        }
    }

    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn keyword(mut self, keyword: impl Into<String>) -> Self {
        self.keyword_filter = Some(keyword.into());
        self
    }

    pub fn filter(mut self, filter: MetadataFilter) -> Self {
        self.metadata_filter = Some(filter);
        self
    }

    pub fn with_cache(mut self, on: bool) -> Self {
        self.use_cache = on;
        self
    }

    pub fn with_rerank(mut self, on: bool) -> Self {
        self.use_rerank = on;
        self
    }

    pub fn with_expansion(mut self, on: bool) -> Self {
        self.use_expansion = on;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub chunk_key: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    /// Normalized score in [0, 1] regardless of which scorers ran.
    pub score: f32,
    pub vector_score: f32,
    pub rerank_score: Option<f32>,
    pub keyword_density: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    /// True when the re-rank pass was cut short and vector-only scores were
    /// returned.
    pub degraded: bool,
    pub cache_hit: bool,
    pub query_time_ms: u64,
}

pub struct SearchService {
    embedder: Arc<EmbeddingClient>,
    store: Arc<dyn VectorStore>,
    reranker: Option<Arc<dyn CrossEncoder>>,
    expander: Option<Arc<dyn QueryExpander>>,
    query_cache: TtlCache<Vec<f32>>,
    result_cache: TtlCache<Arc<SearchResponse>>,
    metrics: Arc<Metrics>,
    config: SearchConfig,
}

impl SearchService {
    pub fn new(
        embedder: Arc<EmbeddingClient>,
        store: Arc<dyn VectorStore>,
        reranker: Option<Arc<dyn CrossEncoder>>,
        expander: Option<Arc<dyn QueryExpander>>,
        config: SearchConfig,
        cache_config: &CacheConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            embedder,
            store,
            reranker,
            expander,
            query_cache: TtlCache::new(
                "query_embedding",
                Some(Duration::from_secs(cache_config.qembed_ttl_s)),
                cache_config.qembed_capacity,
            ),
            result_cache: TtlCache::new(
                "search_result",
                Some(Duration::from_secs(cache_config.result_ttl_s)),
                cache_config.result_capacity,
            ),
            metrics,
            config,
        }
    }

    /// Execute one hybrid query. An empty result is a valid outcome; the
    /// only error the deadline produces mid-re-rank is a degraded (flagged)
    /// response rather than a failure.
    pub async fn search(&self, query: &SearchQuery) -> EngineResult<SearchResponse> {
        let start = Instant::now();
        let deadline = start + Duration::from_millis(self.config.timeout_ms.max(1));
        self.metrics.counter("search.queries", 1);

        let fingerprint = result_fingerprint(query);
        if query.use_cache {
            if let Some(cached) = self.result_cache.get(&fingerprint) {
                self.metrics.counter("search.cache_hit_search", 1);
                let mut response = (*cached).clone();
                response.cache_hit = true;
                response.query_time_ms = start.elapsed().as_millis() as u64;
                return Ok(response);
            }
        }

        let mut search_text = query.text.clone();
        if query.use_expansion {
            if let Some(expander) = &self.expander {
                let expansion = expander.expand(&query.text).await;
                if expansion.confidence > 0.0 && !expansion.text.trim().is_empty() {
                    debug!(
                        strategy = ?expansion.strategy,
                        confidence = expansion.confidence,
                        "query expanded"
                    );
                    self.metrics.counter("search.expansions", 1);
                    search_text = expansion.text;
                }
            }
        }

        // Query embedding through the single-flight cache; the expanded
        // text is what gets embedded and cached.
        let normalized = normalize_query(&search_text);
        let vector = {
            let embedder = self.embedder.clone();
            let text = search_text.clone();
            self.query_cache
                .get_or_compute(&normalized, || async move { embedder.embed_one(&text).await })
                .await?
        };

        let rerank_active = query.use_rerank && self.reranker.is_some();
        let fanout = if rerank_active {
            self.config.rerank_fanout.max(query.top_k)
        } else {
            query.top_k
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        let raw_hits = tokio::time::timeout(
            remaining,
            self.store.query(
                &vector,
                fanout,
                query.metadata_filter.as_ref(),
                query.keyword_filter.as_deref(),
            ),
        )
        .await
        .map_err(|_| EngineError::DeadlineExceeded {
            elapsed_ms: start.elapsed().as_millis() as u64,
        })??;

        let mut hits: Vec<SearchHit> = raw_hits
            .into_iter()
            .map(|hit| {
                let vector_score = (1.0 - hit.distance / 2.0).clamp(0.0, 1.0);
                let keyword_density = query.keyword_filter.as_deref().map(|needle| {
                    hit.text.matches(needle).count() as f32 / hit.metadata.word_count.max(1) as f32
                });
                SearchHit {
                    chunk_key: hit.key,
                    text: hit.text,
                    metadata: hit.metadata,
                    score: vector_score,
                    vector_score,
                    rerank_score: None,
                    keyword_density,
                }
            })
            .collect();

        let mut degraded = false;
        let reranker = self.reranker.as_ref().filter(|_| rerank_active);
        if let Some(reranker) = reranker.filter(|_| !hits.is_empty()) {
            let documents: Vec<String> = hits.iter().map(|h| h.text.clone()).collect();
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, reranker.score(&query.text, &documents)).await {
                Ok(Ok(raw)) if raw.len() == documents.len() => {
                    let weight = self.config.rerank_weight;
                    for (hit, raw_score) in hits.iter_mut().zip(raw) {
                        let ce = sigmoid(raw_score);
                        hit.rerank_score = Some(ce);
                        hit.score = (weight * ce + (1.0 - weight) * hit.vector_score)
                            .clamp(0.0, 1.0);
                    }
                }
                Ok(Ok(raw)) => {
                    warn!(
                        got = raw.len(),
                        expected = documents.len(),
                        "re-ranker returned wrong count, using vector scores"
                    );
                    self.metrics.counter("search.rerank_errors", 1);
                    degraded = true;
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "re-ranker failed, using vector scores");
                    self.metrics.counter("search.rerank_errors", 1);
                    degraded = true;
                }
                Err(_) => {
                    self.metrics.counter("search.rerank_timeouts", 1);
                    degraded = true;
                }
            }
        }

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.metadata.path.cmp(&b.metadata.path))
                .then_with(|| a.metadata.chunk_index.cmp(&b.metadata.chunk_index))
        });
        hits.truncate(query.top_k);

        let response = SearchResponse {
            hits,
            degraded,
            cache_hit: false,
            query_time_ms: start.elapsed().as_millis() as u64,
        };
        // Degraded rankings are returned but never cached.
        if query.use_cache && !degraded {
            self.result_cache
                .insert(&fingerprint, Arc::new(response.clone()));
        }
        self.metrics
            .histogram("search.latency_ms", response.query_time_ms);
        Ok(response)
    }

    /// Pre-compute query embeddings for an explicit list via single-flight.
    pub async fn warm(&self, queries: &[String]) -> usize {
        let mut warmed = 0usize;
        for query in queries {
            let key = normalize_query(query);
            let embedder = self.embedder.clone();
            let text = query.clone();
            if self
                .query_cache
                .get_or_compute(&key, || async move { embedder.embed_one(&text).await })
                .await
                .is_ok()
            {
                warmed += 1;
            }
        }
        warmed
    }

    /// Drop cached rankings; called after the vault changes so cached
    /// results never outlive the chunks they rank.
    pub fn invalidate_results(&self) {
        self.result_cache.clear();
    }

    pub fn query_cache_stats(&self) -> CacheStats {
        self.query_cache.stats()
    }

    pub fn result_cache_stats(&self) -> CacheStats {
        self.result_cache.stats()
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn normalize_query(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn result_fingerprint(query: &SearchQuery) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_query(&query.text).as_bytes());
    hasher.update([query.use_rerank as u8, query.use_expansion as u8]);
    hasher.update(query.top_k.to_le_bytes());
    if let Some(keyword) = &query.keyword_filter {
        hasher.update(b"kw:");
        hasher.update(keyword.as_bytes());
    }
    if let Some(filter) = &query.metadata_filter {
        hasher.update(b"mf:");
        hasher.update(serde_json::to_vec(filter).unwrap_or_default());
    }
    format!("{:x}", hasher.finalize())
}
