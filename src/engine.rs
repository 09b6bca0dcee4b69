//! Engine assembly: one instance of every component, wired together at
//! construction and torn down in reverse on shutdown.

use crate::cache::CacheStats;
use crate::chunker::Chunker;
use crate::config::EngineConfig;
use crate::digest::DigestStore;
use crate::embed::{EmbeddingClient, EmbeddingProvider, HashingEmbedder};
use crate::error::EngineResult;
use crate::metrics::Metrics;
use crate::monitor::VaultMonitor;
use crate::pipeline::{IngestPipeline, SyncReport};
use crate::search::{CrossEncoder, QueryExpander, SearchQuery, SearchResponse, SearchService};
use crate::store::{CollectionStats, MemoryVectorStore, VectorStore};
use crate::vault::VaultClient;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::info;

/// Events broadcast to engine subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum EngineEvent {
    #[serde(rename = "full_sync_started")]
    FullSyncStarted,
    #[serde(rename = "full_sync_complete")]
    FullSyncCompleted {
        scanned: usize,
        rewritten: usize,
        skipped: usize,
        deleted: usize,
        duration_ms: u64,
    },
    #[serde(rename = "file_ingested")]
    FileIngested { path: String, chunks: usize },
    #[serde(rename = "file_removed")]
    FileRemoved { path: String },
    #[serde(rename = "queue_saturated")]
    QueueSaturated,
    #[serde(rename = "search_ready")]
    SearchReady,
}

/// Cooperative shutdown signal checked at every suspension point.
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

#[derive(Default)]
struct ShutdownInner {
    triggered: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Resolve once the signal fires; immediately if it already has.
    pub async fn notified(&self) {
        while !self.is_triggered() {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub collection: CollectionStats,
    pub query_cache: CacheStats,
    pub result_cache: CacheStats,
    pub digest_records: usize,
    pub dirty_paths: usize,
    pub pending_events: usize,
}

pub struct EngineBuilder {
    config: EngineConfig,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    store: Option<Arc<dyn VectorStore>>,
    reranker: Option<Arc<dyn CrossEncoder>>,
    expander: Option<Arc<dyn QueryExpander>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            provider: None,
            store: None,
            reranker: None,
            expander: None,
        }
    }

    /// External embedding model. Defaults to the offline hashing embedder.
    pub fn embedding_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// External vector store. Defaults to the in-process flat index.
    pub fn vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn reranker(mut self, reranker: Arc<dyn CrossEncoder>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn query_expander(mut self, expander: Arc<dyn QueryExpander>) -> Self {
        self.expander = Some(expander);
        self
    }

    pub fn build(self) -> EngineResult<Engine> {
        let config = self.config;
        config.validate()?;

        let metrics = Arc::new(Metrics::default());
        let (event_tx, _) = broadcast::channel(1024);

        let vault = Arc::new(VaultClient::new(
            &config.vault.path,
            config.vault.extensions.clone(),
            metrics.clone(),
        )?);
        let provider = self
            .provider
            .unwrap_or_else(|| Arc::new(HashingEmbedder::new(config.embedding.dim)));
        let embedder = Arc::new(EmbeddingClient::new(
            provider,
            &config.embedding,
            metrics.clone(),
        )?);
        let store: Arc<dyn VectorStore> = self.store.unwrap_or_else(|| {
            Arc::new(MemoryVectorStore::new(
                config.embedding.dim,
                config.store.clone(),
            ))
        });
        let digests = Arc::new(DigestStore::load(&config.state_dir)?);
        let chunker = Arc::new(Chunker::new(&config.chunking));

        let pipeline = Arc::new(IngestPipeline::new(
            vault.clone(),
            chunker,
            embedder.clone(),
            store.clone(),
            digests.clone(),
            metrics.clone(),
            event_tx.clone(),
            config.ingest.concurrency,
        ));
        let monitor = Arc::new(VaultMonitor::new(
            vault.clone(),
            pipeline.clone(),
            metrics.clone(),
            event_tx.clone(),
            config.monitor.debounce_ms,
            config.monitor.queue_capacity,
            config.monitor.shutdown_grace_ms,
        ));
        let search = Arc::new(SearchService::new(
            embedder,
            store.clone(),
            self.reranker,
            self.expander,
            config.search.clone(),
            &config.cache,
            metrics.clone(),
        ));

        info!(
            vault = %config.vault.path.display(),
            state_dir = %config.state_dir.display(),
            dim = config.embedding.dim,
            "engine assembled"
        );

        Ok(Engine {
            config,
            metrics,
            vault,
            store,
            digests,
            pipeline,
            monitor,
            search,
            event_tx,
            shutdown: Shutdown::new(),
            monitor_task: parking_lot::Mutex::new(None),
            invalidator_task: parking_lot::Mutex::new(None),
        })
    }
}

pub struct Engine {
    config: EngineConfig,
    metrics: Arc<Metrics>,
    vault: Arc<VaultClient>,
    store: Arc<dyn VectorStore>,
    digests: Arc<DigestStore>,
    pipeline: Arc<IngestPipeline>,
    monitor: Arc<VaultMonitor>,
    search: Arc<SearchService>,
    event_tx: broadcast::Sender<EngineEvent>,
    shutdown: Shutdown,
    monitor_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    invalidator_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn vault(&self) -> &VaultClient {
        &self.vault
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    /// Enumeration-based reconciliation on demand.
    pub async fn full_sync(&self) -> EngineResult<SyncReport> {
        self.pipeline.full_sync(&self.shutdown).await
    }

    pub async fn search(&self, query: &SearchQuery) -> EngineResult<SearchResponse> {
        self.search.search(query).await
    }

    /// Pre-compute query embeddings for the given texts.
    pub async fn warm(&self, queries: &[String]) -> usize {
        self.search.warm(queries).await
    }

    /// Start continuous operation: the monitor performs the startup full
    /// sync, then drains filesystem events. Cached rankings are dropped
    /// whenever the vault changes.
    pub fn start(&self) {
        let mut slot = self.monitor_task.lock();
        if slot.is_some() {
            return;
        }
        let monitor = self.monitor.clone();
        let shutdown = self.shutdown.clone();
        *slot = Some(tokio::spawn(async move {
            let _ = monitor.run(shutdown).await;
        }));
        drop(slot);

        let mut rx = self.event_tx.subscribe();
        let search = self.search.clone();
        let shutdown = self.shutdown.clone();
        *self.invalidator_task.lock() = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    event = rx.recv() => match event {
                        Ok(EngineEvent::FileIngested { .. })
                        | Ok(EngineEvent::FileRemoved { .. }) => search.invalidate_results(),
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => search.invalidate_results(),
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        }));
    }

    /// Stop accepting events, wait out the grace period for in-flight
    /// ingestion, then abort the rest.
    pub async fn shutdown(&self) {
        self.shutdown.trigger();
        let task = self.monitor_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        if let Some(task) = self.invalidator_task.lock().take() {
            task.abort();
        }
        info!("engine shut down");
    }

    pub async fn stats(&self) -> EngineResult<EngineStats> {
        Ok(EngineStats {
            collection: self.store.collection_stats().await?,
            query_cache: self.search.query_cache_stats(),
            result_cache: self.search.result_cache_stats(),
            digest_records: self.digests.len().await,
            dirty_paths: self.pipeline.dirty_len(),
            pending_events: self.monitor.pending_len(),
        })
    }
}
