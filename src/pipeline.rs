//! Ingestion pipeline: full sync and incremental rewrites.
//!
//! A rewrite is the atomic unit of ingestion: read, chunk, embed, swap the
//! path's chunk set in the store, then (and only then) advance the digest
//! record. Events for one path are serialized behind a per-path lock;
//! distinct paths proceed in parallel up to the configured concurrency.

use crate::chunker::Chunker;
use crate::digest::{DigestRecord, DigestStore};
use crate::embed::EmbeddingClient;
use crate::engine::{EngineEvent, Shutdown};
use crate::error::{EngineError, EngineResult};
use crate::metrics::{MetricEvent, Metrics};
use crate::store::{UpsertItem, VectorStore};
use crate::vault::VaultClient;
use dashmap::DashMap;
use futures_util::StreamExt;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteOutcome {
    Rewritten(usize),
    Skipped,
    Removed,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SyncReport {
    pub scanned: usize,
    pub rewritten: usize,
    pub skipped: usize,
    pub deleted: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

pub struct IngestPipeline {
    vault: Arc<VaultClient>,
    chunker: Arc<Chunker>,
    embedder: Arc<EmbeddingClient>,
    store: Arc<dyn VectorStore>,
    digests: Arc<DigestStore>,
    metrics: Arc<Metrics>,
    events: broadcast::Sender<EngineEvent>,
    limiter: Arc<Semaphore>,
    concurrency: usize,
    path_locks: DashMap<String, Arc<Mutex<()>>>,
    dirty: parking_lot::Mutex<BTreeSet<String>>,
}

impl IngestPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vault: Arc<VaultClient>,
        chunker: Arc<Chunker>,
        embedder: Arc<EmbeddingClient>,
        store: Arc<dyn VectorStore>,
        digests: Arc<DigestStore>,
        metrics: Arc<Metrics>,
        events: broadcast::Sender<EngineEvent>,
        concurrency: usize,
    ) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            vault,
            chunker,
            embedder,
            store,
            digests,
            metrics,
            events,
            limiter: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            path_locks: DashMap::new(),
            dirty: parking_lot::Mutex::new(BTreeSet::new()),
        }
    }

    /// Enumeration-based reconciliation of the vault against the store.
    ///
    /// Unchanged files (digest match with a non-empty chunk set) are
    /// skipped; everything else is rewritten. Paths known to the digest
    /// record but absent from the vault are deleted from the store.
    pub async fn full_sync(&self, shutdown: &Shutdown) -> EngineResult<SyncReport> {
        let start = Instant::now();
        let _ = self.events.send(EngineEvent::FullSyncStarted);

        let listing = self.vault.enumerate()?;
        let known = self.digests.snapshot().await;
        let present: HashSet<&str> = listing.iter().map(|d| d.path.as_str()).collect();

        let mut deleted = 0usize;
        for path in known.keys() {
            if shutdown.is_triggered() {
                return Err(EngineError::Cancelled);
            }
            if !present.contains(path.as_str()) {
                self.delete_path(path).await?;
                deleted += 1;
            }
        }

        // Parallel digest pass over the current vault contents.
        let root = self.vault.root().to_path_buf();
        let paths: Vec<String> = listing.iter().map(|d| d.path.clone()).collect();
        let digests: Vec<(String, Option<String>)> = tokio::task::spawn_blocking(move || {
            paths
                .par_iter()
                .map(|path| {
                    let digest = std::fs::read(root.join(path)).ok().map(|bytes| {
                        let mut hasher = Sha256::new();
                        hasher.update(&bytes);
                        format!("{:x}", hasher.finalize())
                    });
                    (path.clone(), digest)
                })
                .collect()
        })
        .await
        .map_err(|e| EngineError::InvariantViolation(format!("digest pass panicked: {e}")))?;

        let mut to_rewrite: Vec<String> = Vec::new();
        let mut skipped = 0usize;
        for (path, digest) in digests {
            match digest {
                None => {
                    // Vanished between enumeration and hashing.
                    self.delete_path(&path).await?;
                    deleted += 1;
                }
                Some(d) => match known.get(&path) {
                    Some(record) if record.digest == d && record.chunk_count > 0 => skipped += 1,
                    _ => to_rewrite.push(path),
                },
            }
        }

        let rewritten = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        futures_util::stream::iter(to_rewrite)
            .for_each_concurrent(self.concurrency, |path| {
                let rewritten = &rewritten;
                let failed = &failed;
                async move {
                    if shutdown.is_triggered() {
                        return;
                    }
                    match self.rewrite(&path).await {
                        Ok(RewriteOutcome::Rewritten(_)) => {
                            rewritten.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(_) => {}
                        Err(e) if e.is_cancelled() => {}
                        Err(e) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                            warn!(path = %path, error = %e, "rewrite failed during full sync");
                        }
                    }
                }
            })
            .await;

        let report = SyncReport {
            scanned: listing.len(),
            rewritten: rewritten.load(Ordering::Relaxed),
            skipped,
            deleted,
            failed: failed.load(Ordering::Relaxed),
            duration_ms: start.elapsed().as_millis() as u64,
        };

        self.metrics.counter("ingest.full_syncs", 1);
        self.metrics.counter("ingest.skipped", report.skipped as u64);
        self.metrics.counter("ingest.rewritten", report.rewritten as u64);
        self.metrics.record(
            MetricEvent::new("pipeline", "full_sync")
                .duration_ms(report.duration_ms)
                .count(report.scanned as u64)
                .attributes(serde_json::json!({
                    "rewritten": report.rewritten,
                    "skipped": report.skipped,
                    "deleted": report.deleted,
                    "failed": report.failed,
                })),
        );
        let _ = self.events.send(EngineEvent::FullSyncCompleted {
            scanned: report.scanned,
            rewritten: report.rewritten,
            skipped: report.skipped,
            deleted: report.deleted,
            duration_ms: report.duration_ms,
        });
        info!(
            scanned = report.scanned,
            rewritten = report.rewritten,
            skipped = report.skipped,
            deleted = report.deleted,
            failed = report.failed,
            duration_ms = report.duration_ms,
            "full sync complete"
        );
        Ok(report)
    }

    /// Incremental entry point driven by the monitor.
    pub async fn apply_event(&self, path: &str, kind: EventKind) -> EngineResult<()> {
        match kind {
            EventKind::Deleted => self.delete_path(path).await,
            EventKind::Created | EventKind::Modified => self.rewrite(path).await.map(|_| ()),
        }
    }

    /// Rewrite one path: delete the old chunk set and write a fresh one,
    /// atomically from the point of view of concurrent queries. Repeating a
    /// rewrite over unchanged bytes is a no-op.
    pub async fn rewrite(&self, path: &str) -> EngineResult<RewriteOutcome> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| EngineError::Cancelled)?;
        let lock = self.path_lock(path);
        let _guard = lock.lock().await;

        let start = Instant::now();
        let doc = match self.vault.read(path).await {
            Ok(doc) => doc,
            Err(e) if e.is_not_found() => {
                // The file vanished; treat the event as a delete.
                self.delete_path_locked(path).await?;
                return Ok(RewriteOutcome::Removed);
            }
            Err(e) => return Err(e),
        };

        if let Some(record) = self.digests.get(path).await {
            if record.digest == doc.digest && record.chunk_count > 0 {
                self.metrics.counter("ingest.skips_unchanged", 1);
                return Ok(RewriteOutcome::Skipped);
            }
        }

        let chunks = self.chunker.chunk(&doc);
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;

        let items: Vec<UpsertItem> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| UpsertItem {
                key: chunk.metadata.key(),
                vector,
                text: chunk.text,
                metadata: chunk.metadata,
            })
            .collect();
        let chunk_count = items.len();

        if let Err(e) = self.store.replace_path(path, items).await {
            // Leave the digest record untouched so the next sync rewrites,
            // and queue the path for retry on the next tick.
            let dirty_len = {
                let mut dirty = self.dirty.lock();
                dirty.insert(path.to_string());
                dirty.len()
            };
            self.metrics.counter("ingest.store_failures", 1);
            self.metrics.gauge("ingest.dirty_paths", dirty_len as u64);
            self.metrics.record(
                MetricEvent::new("pipeline", "store_write_failed")
                    .path(path)
                    .error(e.to_string()),
            );
            return Err(e);
        }

        self.digests
            .set(
                path,
                DigestRecord {
                    digest: doc.digest,
                    mtime_ms: doc.file_modified.timestamp_millis(),
                    chunk_count: chunk_count as u32,
                },
            )
            .await?;
        self.dirty.lock().remove(path);

        self.metrics.counter("ingest.rewrites", 1);
        self.metrics
            .histogram("ingest.rewrite_ms", start.elapsed().as_millis() as u64);
        self.metrics.record(
            MetricEvent::new("pipeline", "rewrite")
                .path(path)
                .count(chunk_count as u64)
                .duration_ms(start.elapsed().as_millis() as u64),
        );
        let _ = self.events.send(EngineEvent::FileIngested {
            path: path.to_string(),
            chunks: chunk_count,
        });
        Ok(RewriteOutcome::Rewritten(chunk_count))
    }

    pub async fn delete_path(&self, path: &str) -> EngineResult<()> {
        let lock = self.path_lock(path);
        let _guard = lock.lock().await;
        self.delete_path_locked(path).await
    }

    async fn delete_path_locked(&self, path: &str) -> EngineResult<()> {
        self.store.delete_by_path(path).await?;
        self.digests.remove(path).await?;
        self.dirty.lock().remove(path);
        self.metrics.counter("ingest.deletes", 1);
        self.metrics
            .record(MetricEvent::new("pipeline", "delete").path(path));
        let _ = self.events.send(EngineEvent::FileRemoved {
            path: path.to_string(),
        });
        Ok(())
    }

    /// Retry paths whose store write failed. Called by the monitor on its
    /// idle tick.
    pub async fn retry_dirty(&self) {
        let paths: Vec<String> = self.dirty.lock().iter().cloned().collect();
        for path in paths {
            match self.rewrite(&path).await {
                Ok(_) => {}
                Err(e) => debug!(path = %path, error = %e, "dirty retry still failing"),
            }
        }
        self.metrics
            .gauge("ingest.dirty_paths", self.dirty.lock().len() as u64);
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty.lock().len()
    }

    fn path_lock(&self, path: &str) -> Arc<Mutex<()>> {
        self.path_locks
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }
}
