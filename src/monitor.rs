//! Debounced vault watching driving incremental ingestion.
//!
//! Filesystem events are coalesced per path inside the debounce window,
//! then funneled through a bounded pending queue: FIFO across paths, latest
//! event wins per path, and saturation collapses into a full-resync marker
//! so activity bursts can never queue unboundedly.

use crate::engine::{EngineEvent, Shutdown};
use crate::error::{EngineError, EngineResult};
use crate::metrics::{MetricEvent, Metrics};
use crate::pipeline::{EventKind, IngestPipeline};
use crate::vault::VaultClient;
use notify::event::{ModifyKind, RenameMode};
use notify::RecursiveMode;
use notify_debouncer_full::{new_debouncer, DebounceEventResult};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tracing::{info, warn};

/// Idle interval between dirty-path retry sweeps.
const RETRY_TICK_MS: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WorkItem {
    Path { path: String, kind: EventKind },
    FullResync,
}

#[derive(Default)]
struct QueueInner {
    order: VecDeque<String>,
    latest: HashMap<String, EventKind>,
    resync_pending: bool,
}

/// Bounded pending queue with per-path coalescing.
pub(crate) struct PendingQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    notify: Notify,
}

impl PendingQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            capacity: capacity.max(1),
            notify: Notify::new(),
        }
    }

    /// Enqueue one path event. Returns true when the push saturated the
    /// queue and the oldest entry was replaced by a full-resync marker.
    pub(crate) fn push(&self, path: String, kind: EventKind) -> bool {
        let mut saturated = false;
        {
            let mut q = self.inner.lock();
            if let Some(existing) = q.latest.get_mut(&path) {
                *existing = kind;
            } else {
                if q.order.len() >= self.capacity {
                    if let Some(oldest) = q.order.pop_front() {
                        q.latest.remove(&oldest);
                    }
                    q.resync_pending = true;
                    saturated = true;
                }
                q.order.push_back(path.clone());
                q.latest.insert(path, kind);
            }
        }
        self.notify.notify_one();
        saturated
    }

    pub(crate) fn request_resync(&self) {
        self.inner.lock().resync_pending = true;
        self.notify.notify_one();
    }

    /// Next work item, FIFO across paths; a pending resync marker drains
    /// first since the full sync supersedes individual events.
    pub(crate) async fn pop(&self) -> WorkItem {
        loop {
            {
                let mut q = self.inner.lock();
                if q.resync_pending {
                    q.resync_pending = false;
                    return WorkItem::FullResync;
                }
                if let Some(path) = q.order.pop_front() {
                    let kind = q.latest.remove(&path).unwrap_or(EventKind::Modified);
                    return WorkItem::Path { path, kind };
                }
            }
            self.notify.notified().await;
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().order.len()
    }
}

type Watcher = notify_debouncer_full::Debouncer<
    notify::RecommendedWatcher,
    notify_debouncer_full::RecommendedCache,
>;

pub struct VaultMonitor {
    vault: Arc<VaultClient>,
    pipeline: Arc<IngestPipeline>,
    queue: Arc<PendingQueue>,
    metrics: Arc<Metrics>,
    events: broadcast::Sender<EngineEvent>,
    debounce_ms: u64,
    shutdown_grace_ms: u64,
    watcher: Mutex<Option<Watcher>>,
}

impl VaultMonitor {
    pub fn new(
        vault: Arc<VaultClient>,
        pipeline: Arc<IngestPipeline>,
        metrics: Arc<Metrics>,
        events: broadcast::Sender<EngineEvent>,
        debounce_ms: u64,
        queue_capacity: usize,
        shutdown_grace_ms: u64,
    ) -> Self {
        Self {
            vault,
            pipeline,
            queue: Arc::new(PendingQueue::new(queue_capacity)),
            metrics,
            events,
            debounce_ms,
            shutdown_grace_ms,
            watcher: Mutex::new(None),
        }
    }

    /// Install the debounced watcher. Events observed from here on are
    /// queued, so starting the watcher before the startup sync loses
    /// nothing.
    pub fn start_watching(&self) -> EngineResult<()> {
        let mut slot = self.watcher.lock();
        if slot.is_some() {
            return Ok(());
        }

        let vault = self.vault.clone();
        let queue = self.queue.clone();
        let metrics = self.metrics.clone();
        let events = self.events.clone();

        let mut debouncer = new_debouncer(
            Duration::from_millis(self.debounce_ms),
            None, // default tick rate
            move |result: DebounceEventResult| match result {
                Ok(batch) => {
                    for event in &batch {
                        enqueue_event(&vault, &queue, &metrics, &events, event);
                    }
                }
                Err(errors) => {
                    for e in errors {
                        warn!(error = ?e, "vault watcher error");
                    }
                }
            },
        )
        .map_err(|e| EngineError::TransientIo(format!("watcher init: {e}")))?;

        debouncer
            .watch(self.vault.root(), RecursiveMode::Recursive)
            .map_err(|e| EngineError::TransientIo(format!("watch failed: {e}")))?;

        *slot = Some(debouncer);
        info!(
            root = %self.vault.root().display(),
            debounce_ms = self.debounce_ms,
            "vault monitor watching"
        );
        Ok(())
    }

    pub fn stop_watching(&self) {
        if self.watcher.lock().take().is_some() {
            info!("vault monitor stopped watching");
        }
    }

    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }

    /// Queue a full resync ahead of any pending path events.
    pub fn request_resync(&self) {
        self.queue.request_resync();
    }

    /// Monitor loop: startup full sync first (events meanwhile are queued),
    /// then drain events into the pipeline until shutdown. On shutdown,
    /// intake stops, in-flight work gets the grace period, and whatever
    /// remains is aborted.
    pub async fn run(&self, shutdown: Shutdown) -> EngineResult<()> {
        self.start_watching()?;

        match self.pipeline.full_sync(&shutdown).await {
            Ok(_) => {
                let _ = self.events.send(EngineEvent::SearchReady);
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => warn!(error = %e, "startup sync failed; monitor continues"),
        }

        let mut tasks = tokio::task::JoinSet::new();
        loop {
            while tasks.try_join_next().is_some() {}

            tokio::select! {
                _ = shutdown.notified() => break,
                item = self.queue.pop() => match item {
                    WorkItem::FullResync => {
                        self.metrics.counter("monitor.resyncs", 1);
                        match self.pipeline.full_sync(&shutdown).await {
                            Ok(_) => {}
                            Err(e) if e.is_cancelled() => break,
                            Err(e) => warn!(error = %e, "escalated full sync failed"),
                        }
                    }
                    WorkItem::Path { path, kind } => {
                        let pipeline = self.pipeline.clone();
                        tasks.spawn(async move {
                            if let Err(e) = pipeline.apply_event(&path, kind).await {
                                if !e.is_cancelled() {
                                    warn!(path = %path, error = %e, "event ingestion failed");
                                }
                            }
                        });
                    }
                },
                _ = tokio::time::sleep(Duration::from_millis(RETRY_TICK_MS)) => {
                    if self.pipeline.dirty_len() > 0 {
                        self.pipeline.retry_dirty().await;
                    }
                }
            }
        }

        self.stop_watching();

        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.shutdown_grace_ms);
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        aborted = tasks.len(),
                        "shutdown grace elapsed, aborting in-flight ingestion"
                    );
                    tasks.abort_all();
                    break;
                }
            }
        }
        info!("vault monitor loop exited");
        Ok(())
    }
}

/// Classify one debounced event and push the resulting path events. A
/// rename is modeled as delete(old) + create(new), emitted back to back.
fn enqueue_event(
    vault: &VaultClient,
    queue: &PendingQueue,
    metrics: &Metrics,
    events: &broadcast::Sender<EngineEvent>,
    event: &notify::Event,
) {
    let mut pushes: Vec<(String, EventKind)> = Vec::new();

    match event.kind {
        notify::EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::Both if event.paths.len() == 2 => {
                if let Some(old) = recognized(vault, &event.paths[0]) {
                    pushes.push((old, EventKind::Deleted));
                }
                if let Some(new) = recognized(vault, &event.paths[1]) {
                    pushes.push((new, EventKind::Created));
                }
            }
            RenameMode::From => {
                if let Some(path) = event.paths.first().and_then(|p| recognized(vault, p)) {
                    pushes.push((path, EventKind::Deleted));
                }
            }
            RenameMode::To => {
                if let Some(path) = event.paths.first().and_then(|p| recognized(vault, p)) {
                    pushes.push((path, EventKind::Created));
                }
            }
            _ => {
                // Ambiguous rename notification: resolve by existence.
                for abs in &event.paths {
                    if let Some(path) = recognized(vault, abs) {
                        let kind = if abs.exists() {
                            EventKind::Created
                        } else {
                            EventKind::Deleted
                        };
                        pushes.push((path, kind));
                    }
                }
            }
        },
        notify::EventKind::Create(_) => {
            for abs in &event.paths {
                if let Some(path) = recognized(vault, abs) {
                    pushes.push((path, EventKind::Created));
                }
            }
        }
        notify::EventKind::Modify(_) => {
            for abs in &event.paths {
                if let Some(path) = recognized(vault, abs) {
                    pushes.push((path, EventKind::Modified));
                }
            }
        }
        notify::EventKind::Remove(_) => {
            for abs in &event.paths {
                if let Some(path) = recognized(vault, abs) {
                    pushes.push((path, EventKind::Deleted));
                }
            }
        }
        _ => {}
    }

    for (path, kind) in pushes {
        metrics.counter("monitor.events", 1);
        if queue.push(path, kind) {
            metrics.counter("monitor.saturations", 1);
            metrics.record(MetricEvent::new("monitor", "queue_saturated"));
            let _ = events.send(EngineEvent::QueueSaturated);
        }
    }
    metrics.gauge("monitor.queue_depth", queue.len() as u64);
}

fn recognized(vault: &VaultClient, abs: &std::path::Path) -> Option<String> {
    if !vault.matches_extension(abs) {
        return None;
    }
    vault.relativize(abs)
}
