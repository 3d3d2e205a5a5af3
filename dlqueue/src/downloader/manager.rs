//! Download Manager implementation.
//!
//! The manager owns the in-memory queue. A single dispatch loop admits
//! `Queued` entries up to the concurrency ceiling, runs each attempt on a
//! worker task and turns the returned [`ResultFlags`] into the next status:
//! post-processing, backend fallback, retry or a terminal state.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::backend::{
    ArtifactKind, AttemptContext, AttemptReporter, BackendAdapter, BackendKind, Category,
    CategoryStatus,
};
use super::entry::{DownloadStatus, Priority, QueueEntry};
use super::ordering::{SortOrder, dispatch_order};
use super::resilience::RetryConfig;
use super::result::{AttemptOutcome, AttemptResult, ResultFlags};
use crate::filter::{FilterResolver, StaticFilterCatalog};
use crate::metadata::MetadataProvider;
use crate::persistence::{MemoryStore, QueueStore};
use crate::postprocess::{NoopPostProcessor, PostProcessor};
use crate::process::{ProcessSupervisor, SupervisorConfig};
use crate::{Error, Result};

/// Configuration for the Download Manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadManagerConfig {
    /// Maximum number of attempts running at once.
    pub max_concurrent_downloads: usize,
    /// Attempts per entry before it is marked failed.
    pub max_download_retries: u32,
    /// Lower bound of the delay between attempts.
    pub retry_delay_min_ms: u64,
    /// Upper bound of the delay between attempts.
    pub retry_delay_max_ms: u64,
    /// Pick the inter-attempt delay at random between the bounds.
    pub randomize_retry_delay: bool,
    /// Worker permits shared by attempts, metadata lookups and post-processing.
    /// Never smaller than the concurrency ceiling.
    pub worker_pool_size: usize,
    /// Drop completed entries from the queue.
    pub remove_on_success: bool,
    /// Look up metadata before queueing a new entry.
    pub query_metadata: bool,
    /// The same URL captured again within this window is ignored.
    pub duplicate_window_ms: u64,
    /// Dispatch cycle period when nothing wakes the loop earlier.
    pub dispatch_interval_ms: u64,
    /// Upper bound for one batch of concurrent enqueues.
    pub enqueue_timeout_ms: u64,
    /// Directory downloads are written to.
    pub download_dir: PathBuf,
    /// Enabled output categories.
    pub categories: Vec<Category>,
    /// Run duplicate detection after a successful download.
    pub deduplicate: bool,
    /// Run transcoding after a successful download.
    pub transcode: bool,
    /// Ordering among entries of the same priority.
    pub sort_order: SortOrder,
    /// How long shutdown waits for workers to finish.
    pub shutdown_timeout_ms: u64,
}

impl Default for DownloadManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 2,
            max_download_retries: 3,
            retry_delay_min_ms: 1000,
            retry_delay_max_ms: 5000,
            randomize_retry_delay: true,
            worker_pool_size: 4,
            remove_on_success: false,
            query_metadata: false,
            duplicate_window_ms: 2000,
            dispatch_interval_ms: 1000,
            enqueue_timeout_ms: 10_000,
            download_dir: dirs::download_dir()
                .unwrap_or_else(|| PathBuf::from("downloads"))
                .join("dlqueue"),
            categories: vec![Category::Video],
            deduplicate: false,
            transcode: false,
            sort_order: SortOrder::default(),
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl DownloadManagerConfig {
    pub fn retry_policy(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_download_retries,
            min_delay_ms: self.retry_delay_min_ms,
            max_delay_ms: self.retry_delay_max_ms,
            randomize: self.randomize_retry_delay,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_downloads == 0 {
            return Err(Error::config("max_concurrent_downloads must be at least 1"));
        }
        if self.max_download_retries == 0 {
            return Err(Error::config("max_download_retries must be at least 1"));
        }
        if self.dispatch_interval_ms == 0 {
            return Err(Error::config("dispatch_interval_ms must be positive"));
        }
        Ok(())
    }

    fn worker_permits(&self) -> usize {
        self.worker_pool_size.max(self.max_concurrent_downloads)
    }
}

/// Events about individual queue entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryEvent {
    Added {
        id: u64,
        url: String,
    },
    StatusChanged {
        id: u64,
        from: DownloadStatus,
        to: DownloadStatus,
    },
    /// New output line from the running attempt.
    Output {
        id: u64,
        line: String,
    },
    /// Priority, ordering, artifacts or sub-status changed.
    Updated {
        id: u64,
    },
    Removed {
        id: u64,
    },
}

/// Events about the manager as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityEvent {
    BlockedChanged { blocked: bool },
    RunningChanged { running: usize },
}

/// A URL to add to the queue.
#[derive(Debug, Clone, Default)]
pub struct EnqueueRequest {
    pub url: String,
    /// Bypass duplicate suppression.
    pub force: bool,
    pub priority: Priority,
    pub forced_backend: Option<BackendKind>,
    pub sequence: Option<u64>,
    pub original_url: Option<String>,
}

impl EnqueueRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn backend(mut self, kind: BackendKind) -> Self {
        self.forced_backend = Some(kind);
        self
    }

    pub fn sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

/// Builder for [`DownloadManager`].
pub struct DownloadManagerBuilder {
    config: DownloadManagerConfig,
    adapters: Vec<Arc<dyn BackendAdapter>>,
    resolver: Option<Arc<dyn FilterResolver>>,
    store: Option<Arc<dyn QueueStore>>,
    metadata: Option<Arc<dyn MetadataProvider>>,
    post_processor: Option<Arc<dyn PostProcessor>>,
    supervisor: Option<Arc<ProcessSupervisor>>,
}

impl DownloadManagerBuilder {
    /// Register a backend. A later registration of the same kind replaces the earlier one.
    pub fn backend(mut self, adapter: Arc<dyn BackendAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn backends(mut self, adapters: impl IntoIterator<Item = Arc<dyn BackendAdapter>>) -> Self {
        self.adapters.extend(adapters);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn FilterResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn metadata(mut self, provider: Arc<dyn MetadataProvider>) -> Self {
        self.metadata = Some(provider);
        self
    }

    pub fn post_processor(mut self, processor: Arc<dyn PostProcessor>) -> Self {
        self.post_processor = Some(processor);
        self
    }

    pub fn supervisor(mut self, supervisor: Arc<ProcessSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn build(self) -> Result<DownloadManager> {
        self.config.validate()?;

        let supervisor = match self.supervisor {
            Some(supervisor) => supervisor,
            None => Arc::new(ProcessSupervisor::new(SupervisorConfig::default())?),
        };

        let mut adapters = HashMap::new();
        for adapter in self.adapters {
            debug!("Registered download backend: {}", adapter.kind());
            adapters.insert(adapter.kind(), adapter);
        }

        let permits = self.config.worker_permits();
        let (entry_tx, _) = broadcast::channel(1024);
        let (activity_tx, _) = broadcast::channel(64);

        let inner = ManagerInner {
            config: RwLock::new(self.config),
            entries: DashMap::new(),
            in_flight: Mutex::new(HashSet::new()),
            blocked: AtomicBool::new(false),
            recent_urls: DashMap::new(),
            adapters,
            resolver: self
                .resolver
                .unwrap_or_else(|| Arc::new(StaticFilterCatalog::default())),
            store: self.store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
            metadata: self.metadata,
            post_processor: self
                .post_processor
                .unwrap_or_else(|| Arc::new(NoopPostProcessor)),
            supervisor,
            workers: Arc::new(Semaphore::new(permits)),
            worker_permits: Mutex::new(permits),
            wakeup: Notify::new(),
            entry_tx,
            activity_tx,
            shutdown: CancellationToken::new(),
            dispatcher: Mutex::new(None),
            tasks: TaskTracker::new(),
        };

        Ok(DownloadManager {
            inner: Arc::new(inner),
        })
    }
}

struct ManagerInner {
    config: RwLock<DownloadManagerConfig>,
    entries: DashMap<u64, Arc<Mutex<QueueEntry>>>,
    /// Ids with a running attempt. Lock order: `in_flight`, then an entry.
    in_flight: Mutex<HashSet<u64>>,
    blocked: AtomicBool,
    recent_urls: DashMap<String, Instant>,
    adapters: HashMap<BackendKind, Arc<dyn BackendAdapter>>,
    resolver: Arc<dyn FilterResolver>,
    store: Arc<dyn QueueStore>,
    metadata: Option<Arc<dyn MetadataProvider>>,
    post_processor: Arc<dyn PostProcessor>,
    supervisor: Arc<ProcessSupervisor>,
    workers: Arc<Semaphore>,
    worker_permits: Mutex<usize>,
    wakeup: Notify,
    entry_tx: broadcast::Sender<EntryEvent>,
    activity_tx: broadcast::Sender<ActivityEvent>,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    tasks: TaskTracker,
}

/// The Download Manager service.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<ManagerInner>,
}

impl DownloadManager {
    pub fn builder(config: DownloadManagerConfig) -> DownloadManagerBuilder {
        DownloadManagerBuilder {
            config,
            adapters: Vec::new(),
            resolver: None,
            store: None,
            metadata: None,
            post_processor: None,
            supervisor: None,
        }
    }

    pub fn config(&self) -> DownloadManagerConfig {
        self.inner.config.read().clone()
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.inner.supervisor
    }

    /// Registered backends that can currently run.
    pub fn available_backends(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<BackendKind> = self
            .inner
            .adapters
            .values()
            .filter(|adapter| adapter.is_available())
            .map(|adapter| adapter.kind())
            .collect();
        kinds.sort();
        kinds
    }

    /// Add a URL to the queue.
    ///
    /// Returns `Ok(false)` when the URL is empty, was captured within the
    /// duplicate window (unless `force`) or the manager is blocked.
    pub async fn enqueue(&self, url: &str, force: bool) -> Result<bool> {
        self.enqueue_with(EnqueueRequest::new(url).force(force))
            .await
            .map(|id| id.is_some())
    }

    /// Add a URL with explicit options. Returns the new entry id when accepted.
    pub async fn enqueue_with(&self, request: EnqueueRequest) -> Result<Option<u64>> {
        let inner = &self.inner;
        let url = request.url.trim();
        if url.is_empty() {
            debug!("Ignoring empty URL");
            return Ok(None);
        }
        if inner.is_blocked() {
            debug!(%url, "Queue is blocked, ignoring URL");
            return Ok(None);
        }
        if !inner.claim_url(url, request.force) {
            debug!(%url, "Ignoring duplicate URL");
            return Ok(None);
        }

        let id = inner.store.next_id().await?;
        let query = inner.config.read().query_metadata && inner.metadata.is_some();
        let status = if query {
            DownloadStatus::Querying
        } else {
            DownloadStatus::Queued
        };

        let mut entry = QueueEntry::new(id, url, status);
        entry.priority = request.priority;
        entry.forced_backend = request.forced_backend;
        entry.sequence = request.sequence;
        if let Some(original) = request.original_url {
            entry.original_url = original;
        }

        inner.store.save(&entry).await?;
        inner.entries.insert(id, Arc::new(Mutex::new(entry)));
        info!(entry_id = id, %url, %status, "Entry added");
        inner.emit(EntryEvent::Added {
            id,
            url: url.to_string(),
        });

        if query {
            inner.spawn_metadata_query(id);
        } else {
            inner.wake();
        }
        Ok(Some(id))
    }

    /// Enqueue a batch of URLs concurrently, e.g. one paste event.
    ///
    /// URLs whose enqueue has not finished within `enqueue_timeout_ms`
    /// report `false`.
    pub async fn enqueue_all<I, S>(&self, urls: I, force: bool) -> Vec<bool>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let timeout = Duration::from_millis(self.inner.config.read().enqueue_timeout_ms);
        let pending = urls.into_iter().map(|url| {
            let url = url.as_ref().to_string();
            async move {
                match tokio::time::timeout(timeout, self.enqueue(&url, force)).await {
                    Ok(Ok(accepted)) => accepted,
                    Ok(Err(e)) => {
                        error!(%url, error = %e, "Failed to enqueue URL");
                        false
                    }
                    Err(_) => {
                        warn!(%url, "Enqueue timed out");
                        false
                    }
                }
            }
        });
        futures::future::join_all(pending).await
    }

    /// Stop an entry. Returns `false` if it was already terminal.
    pub async fn cancel(&self, id: u64) -> Result<bool> {
        let inner = &self.inner;
        let slot = inner.slot(id)?;
        let from = {
            let mut entry = slot.lock();
            if entry.is_terminal() {
                return Ok(false);
            }
            let from = entry.status;
            entry.transition(DownloadStatus::Stopped)?;
            entry.generation += 1;
            entry.result_flags = ResultFlags::STOPPED;
            if let Some(token) = entry.cancel_token.take() {
                token.cancel();
            }
            from
        };

        inner.supervisor.wake();
        info!(entry_id = id, %from, "Entry stopped");
        inner.emit_status(id, from, DownloadStatus::Stopped);
        inner.persist(id).await;
        Ok(true)
    }

    /// Queue a failed, stopped or unresolvable entry again.
    pub async fn retry(&self, id: u64) -> Result<()> {
        let inner = &self.inner;
        let slot = inner.slot(id)?;
        let from = {
            let mut entry = slot.lock();
            let from = entry.status;
            match from {
                DownloadStatus::Failed | DownloadStatus::Stopped | DownloadStatus::NoMethod => {
                    entry.reset_for_retry();
                    entry.generation += 1;
                }
                other => {
                    return Err(Error::validation(format!(
                        "Entry {id} cannot be retried while {other}"
                    )));
                }
            }
            from
        };

        info!(entry_id = id, %from, "Entry queued for retry");
        inner.emit_status(id, from, DownloadStatus::Queued);
        inner.persist(id).await;
        inner.wake();
        Ok(())
    }

    /// Change an entry's priority. Takes effect at the next dispatch cycle.
    pub async fn set_priority(&self, id: u64, priority: Priority) -> Result<()> {
        self.inner
            .update(id, |entry| entry.priority = priority)
            .await
    }

    /// Change an entry's playlist position.
    pub async fn reorder(&self, id: u64, sequence: Option<u64>) -> Result<()> {
        self.inner
            .update(id, |entry| entry.sequence = sequence)
            .await
    }

    /// Remove an entry from the queue, stopping it first if needed.
    pub async fn remove(&self, id: u64) -> Result<bool> {
        let inner = &self.inner;
        let Some((_, slot)) = inner.entries.remove(&id) else {
            return Ok(false);
        };
        {
            let mut entry = slot.lock();
            entry.generation += 1;
            if let Some(token) = entry.cancel_token.take() {
                token.cancel();
                inner.supervisor.wake();
            }
        }
        inner.store.remove(id).await?;
        info!(entry_id = id, "Entry removed");
        inner.emit(EntryEvent::Removed { id });
        Ok(true)
    }

    pub fn is_blocked(&self) -> bool {
        self.inner.is_blocked()
    }

    /// Pause or resume enqueueing and dispatch.
    pub fn set_blocked(&self, blocked: bool) {
        let previous = self.inner.blocked.swap(blocked, Ordering::SeqCst);
        if previous == blocked {
            return;
        }
        info!(blocked, "Download activity {}", if blocked { "paused" } else { "resumed" });
        let _ = self
            .inner
            .activity_tx
            .send(ActivityEvent::BlockedChanged { blocked });
        if !blocked {
            self.inner.wake();
        }
    }

    pub fn sort_order(&self) -> SortOrder {
        self.inner.config.read().sort_order
    }

    pub fn set_sort_order(&self, order: SortOrder) {
        self.inner.config.write().sort_order = order;
        self.inner.wake();
    }

    /// Change the concurrency ceiling at runtime.
    ///
    /// Lowering it never interrupts running attempts; new ones are admitted
    /// once the count drops below the new ceiling.
    pub fn set_max_concurrent(&self, max: usize) -> Result<()> {
        if max == 0 {
            return Err(Error::validation("max_concurrent_downloads must be at least 1"));
        }
        let needed = {
            let mut config = self.inner.config.write();
            config.max_concurrent_downloads = max;
            config.worker_permits()
        };
        let mut permits = self.inner.worker_permits.lock();
        if needed > *permits {
            self.inner.workers.add_permits(needed - *permits);
            *permits = needed;
        }
        drop(permits);
        info!(max, "Concurrency ceiling changed");
        self.inner.wake();
        Ok(())
    }

    /// Copies of every entry, in display order.
    pub fn snapshot(&self) -> Vec<QueueEntry> {
        let order = self.sort_order();
        let mut entries: Vec<QueueEntry> = self
            .inner
            .entries
            .iter()
            .map(|slot| slot.value().lock().clone())
            .collect();
        entries.sort_by(|a, b| order.compare(&a.sort_key(), &b.sort_key()));
        entries
    }

    pub fn get(&self, id: u64) -> Option<QueueEntry> {
        self.inner.entries.get(&id).map(|slot| slot.value().lock().clone())
    }

    /// Number of attempts currently running.
    pub fn running_count(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    pub fn queued_count(&self) -> usize {
        self.inner
            .entries
            .iter()
            .filter(|slot| slot.value().lock().status == DownloadStatus::Queued)
            .count()
    }

    /// Whether no entry is waiting for or running an attempt.
    pub fn is_idle(&self) -> bool {
        if self.running_count() > 0 {
            return false;
        }
        self.inner
            .entries
            .iter()
            .all(|slot| slot.value().lock().is_terminal())
    }

    pub fn subscribe_entries(&self) -> broadcast::Receiver<EntryEvent> {
        self.inner.entry_tx.subscribe()
    }

    pub fn subscribe_activity(&self) -> broadcast::Receiver<ActivityEvent> {
        self.inner.activity_tx.subscribe()
    }

    /// Run a dispatch cycle as soon as possible.
    pub fn wake(&self) {
        self.inner.wake();
    }

    /// Load persisted entries. Entries interrupted mid-attempt are queued again.
    ///
    /// Returns the number of entries loaded.
    pub async fn restore(&self) -> Result<usize> {
        let inner = &self.inner;
        let stored = inner.store.load_all().await?;
        let mut loaded = 0;
        let mut requeued = Vec::new();

        for mut entry in stored {
            if inner.entries.contains_key(&entry.id) {
                continue;
            }
            if !entry.is_terminal() && entry.status != DownloadStatus::Queued {
                debug!(entry_id = entry.id, status = %entry.status, "Re-queueing interrupted entry");
                entry.status = DownloadStatus::Queued;
                entry.category_status.clear();
                entry.touch();
                requeued.push(entry.id);
            }
            inner.entries.insert(entry.id, Arc::new(Mutex::new(entry)));
            loaded += 1;
        }

        for id in requeued {
            inner.persist(id).await;
        }
        info!(entries = loaded, "Restored queue");
        inner.wake();
        Ok(loaded)
    }

    /// Spawn the dispatch loop. Calling it again is a no-op.
    pub fn start(&self) {
        let mut dispatcher = self.inner.dispatcher.lock();
        if dispatcher.is_some() || self.inner.shutdown.is_cancelled() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *dispatcher = Some(tokio::spawn(async move { inner.run_dispatcher().await }));
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop dispatching, cancel running attempts and wait for workers.
    ///
    /// Attempts interrupted here are queued again so they resume on the next
    /// start.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return;
        }
        info!("Shutting down download manager");
        inner.shutdown.cancel();
        inner.supervisor.wake();

        let dispatcher = inner.dispatcher.lock().take();
        if let Some(handle) = dispatcher
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Dispatch loop ended abnormally");
        }

        inner.tasks.close();
        let timeout = Duration::from_millis(inner.config.read().shutdown_timeout_ms);
        if tokio::time::timeout(timeout, inner.tasks.wait()).await.is_err() {
            warn!(
                remaining = inner.tasks.len(),
                "Timed out waiting for download workers"
            );
        }

        let supervisor = Arc::clone(&inner.supervisor);
        if let Err(e) = tokio::task::spawn_blocking(move || supervisor.shutdown()).await {
            warn!(error = %e, "Supervisor shutdown task failed");
        }

        if let Err(e) = inner.store.flush().await {
            error!(error = %e, "Failed to flush queue store");
        }
        info!("Download manager stopped");
    }
}

impl ManagerInner {
    fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    fn wake(&self) {
        self.wakeup.notify_one();
    }

    fn slot(&self, id: u64) -> Result<Arc<Mutex<QueueEntry>>> {
        self.entries
            .get(&id)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or_else(|| Error::not_found("entry", id))
    }

    fn emit(&self, event: EntryEvent) {
        let _ = self.entry_tx.send(event);
    }

    fn emit_status(&self, id: u64, from: DownloadStatus, to: DownloadStatus) {
        if from != to {
            self.emit(EntryEvent::StatusChanged { id, from, to });
        }
    }

    fn emit_running(&self, running: usize) {
        let _ = self
            .activity_tx
            .send(ActivityEvent::RunningChanged { running });
    }

    /// Record a capture of `url`. Returns `false` for a duplicate within the window.
    fn claim_url(&self, url: &str, force: bool) -> bool {
        let window = Duration::from_millis(self.config.read().duplicate_window_ms);
        let now = Instant::now();
        self.recent_urls
            .retain(|_, seen| now.duration_since(*seen) < window);

        match self.recent_urls.entry(url.to_string()) {
            Entry::Occupied(mut seen) => {
                if !force && now.duration_since(*seen.get()) < window {
                    return false;
                }
                seen.insert(now);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    async fn update<F>(&self, id: u64, apply: F) -> Result<()>
    where
        F: FnOnce(&mut QueueEntry),
    {
        let slot = self.slot(id)?;
        {
            let mut entry = slot.lock();
            apply(&mut entry);
            entry.touch();
        }
        self.emit(EntryEvent::Updated { id });
        self.persist(id).await;
        self.wake();
        Ok(())
    }

    /// Write the current state of an entry to the store.
    ///
    /// Snapshots are numbered under the entry lock, so a store can tell a late
    /// write of an older snapshot from a newer one.
    async fn persist(&self, id: u64) {
        let Some(entry) = self.entries.get(&id).map(|slot| {
            let mut entry = slot.value().lock();
            entry.revision += 1;
            entry.clone()
        }) else {
            return;
        };
        if let Err(e) = self.store.save(&entry).await {
            error!(entry_id = id, error = %e, "Failed to persist entry");
        }
    }

    async fn acquire_worker(&self, cancel: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = Arc::clone(&self.workers).acquire_owned() => permit.ok(),
        }
    }

    async fn run_dispatcher(self: Arc<Self>) {
        info!("Dispatch loop started");
        loop {
            let changed = self.dispatch_cycle();
            for id in changed {
                self.persist(id).await;
            }

            let interval = Duration::from_millis(self.config.read().dispatch_interval_ms);
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Dispatch loop stopped");
    }

    /// Admit queued entries up to the ceiling. Returns the ids that changed.
    fn dispatch_cycle(self: &Arc<Self>) -> Vec<u64> {
        if self.is_blocked() || self.shutdown.is_cancelled() {
            return Vec::new();
        }
        let (ceiling, order) = {
            let config = self.config.read();
            (config.max_concurrent_downloads, config.sort_order)
        };

        let mut in_flight = self.in_flight.lock();
        let free = ceiling.saturating_sub(in_flight.len());
        if free == 0 {
            return Vec::new();
        }

        let mut candidates: Vec<_> = self
            .entries
            .iter()
            .filter_map(|slot| {
                let entry = slot.value().lock();
                (entry.status == DownloadStatus::Queued && !in_flight.contains(&entry.id))
                    .then(|| (entry.sort_key(), Arc::clone(slot.value())))
            })
            .collect();
        if candidates.is_empty() {
            return Vec::new();
        }
        candidates.sort_by(|a, b| dispatch_order(order, &a.0, &b.0));

        let mut changed = Vec::new();
        let mut started = 0;
        for (_, slot) in candidates {
            if started == free {
                break;
            }
            let mut entry = slot.lock();
            if entry.status != DownloadStatus::Queued {
                continue;
            }
            let id = entry.id;

            let Some(adapter) = self.select_backend(&entry) else {
                if entry.transition(DownloadStatus::NoMethod).is_ok() {
                    info!(entry_id = id, url = %entry.url, "No backend can handle URL");
                    entry.last_output = Some("No download method available".to_string());
                    self.emit_status(id, DownloadStatus::Queued, DownloadStatus::NoMethod);
                    changed.push(id);
                }
                continue;
            };

            if let Err(e) = entry.transition(DownloadStatus::Starting) {
                warn!(entry_id = id, error = %e, "Cannot start entry");
                continue;
            }
            entry.generation += 1;
            let token = self.shutdown.child_token();
            entry.cancel_token = Some(token.clone());
            entry.current_backend = Some(adapter.kind());
            entry.result_flags = ResultFlags::default();
            entry.category_status.clear();
            in_flight.insert(id);

            info!(
                entry_id = id,
                backend = %adapter.kind(),
                priority = ?entry.priority,
                "Starting download"
            );
            self.emit_status(id, DownloadStatus::Queued, DownloadStatus::Starting);
            self.spawn_attempt(&entry, adapter, token);
            changed.push(id);
            started += 1;
        }

        if started > 0 {
            self.emit_running(in_flight.len());
        }
        changed
    }

    /// Backend for the next attempt of `entry`, honouring its blacklist.
    fn select_backend(&self, entry: &QueueEntry) -> Option<Arc<dyn BackendAdapter>> {
        if let Some(forced) = entry.forced_backend {
            if entry.backend_blacklist.contains(&forced) {
                return None;
            }
            return self
                .adapters
                .get(&forced)
                .filter(|adapter| adapter.is_available())
                .cloned();
        }

        let mut excluded = entry.backend_blacklist.clone();
        loop {
            let kind = self.resolver.resolve_backend(&entry.url, &excluded)?;
            match self.adapters.get(&kind) {
                Some(adapter) if adapter.is_available() => return Some(Arc::clone(adapter)),
                _ => {
                    if !excluded.insert(kind) {
                        return None;
                    }
                }
            }
        }
    }

    fn spawn_attempt(
        self: &Arc<Self>,
        entry: &QueueEntry,
        adapter: Arc<dyn BackendAdapter>,
        token: CancellationToken,
    ) {
        let (target_dir, categories) = {
            let config = self.config.read();
            (config.download_dir.clone(), config.categories.clone())
        };
        let id = entry.id;
        let generation = entry.generation;
        let kind = adapter.kind();

        let ctx = AttemptContext {
            entry_id: id,
            url: entry.url.clone(),
            target_dir,
            categories,
            cancel: token.clone(),
            supervisor: Arc::clone(&self.supervisor),
            resolver: Arc::clone(&self.resolver),
            reporter: Arc::new(EntryReporter {
                inner: Arc::clone(self),
                id,
                generation,
            }),
        };

        let inner = Arc::clone(self);
        self.tasks.spawn(async move {
            let result = match inner.acquire_worker(&token).await {
                Some(permit) => {
                    let result = AssertUnwindSafe(adapter.run(ctx))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            error!(entry_id = id, backend = %kind, "Backend panicked");
                            AttemptResult::failed().with_output("Backend crashed")
                        });
                    drop(permit);
                    result
                }
                None => AttemptResult::stopped(),
            };
            inner.finish_attempt(id, generation, kind, result).await;
        });
    }

    /// Apply the result of one attempt.
    async fn finish_attempt(
        self: &Arc<Self>,
        id: u64,
        generation: u64,
        kind: BackendKind,
        result: AttemptResult,
    ) {
        let outcome = result.flags.outcome();
        let mut retry_delay = None;
        let mut post_process = false;

        let applied = {
            let mut in_flight = self.in_flight.lock();
            in_flight.remove(&id);
            self.emit_running(in_flight.len());

            let slot = self.entries.get(&id).map(|slot| Arc::clone(slot.value()));
            let Some(slot) = slot else {
                drop(in_flight);
                self.wake();
                return;
            };
            let mut entry = slot.lock();
            if entry.generation != generation || entry.is_terminal() {
                debug!(entry_id = id, backend = %kind, ?outcome, "Ignoring result of superseded attempt");
                None
            } else {
                let from = entry.status;
                entry.result_flags = result.flags;
                if let Some(line) = result.last_output {
                    entry.last_output = Some(line);
                }

                let next = match outcome {
                    AttemptOutcome::Stopped => {
                        entry.cancel_token = None;
                        if self.shutdown.is_cancelled() {
                            DownloadStatus::Queued
                        } else {
                            DownloadStatus::Stopped
                        }
                    }
                    AttemptOutcome::Succeeded => {
                        post_process = true;
                        DownloadStatus::PostProcessing
                    }
                    AttemptOutcome::Unsupported => {
                        entry.cancel_token = None;
                        entry.backend_blacklist.insert(kind);
                        if entry.forced_backend.is_some() || self.select_backend(&entry).is_none()
                        {
                            DownloadStatus::NoMethod
                        } else {
                            DownloadStatus::Queued
                        }
                    }
                    AttemptOutcome::Failed => {
                        entry.cancel_token = None;
                        entry.retry_counter += 1;
                        let policy = self.config.read().retry_policy();
                        if policy.should_retry(entry.retry_counter) {
                            retry_delay = Some(policy.next_delay());
                            DownloadStatus::Retrying
                        } else {
                            DownloadStatus::Failed
                        }
                    }
                };

                match entry.transition(next) {
                    Ok(()) => {
                        log_outcome(&entry, kind, outcome);
                        Some((from, next))
                    }
                    Err(e) => {
                        warn!(entry_id = id, error = %e, "Cannot apply attempt result");
                        entry.cancel_token = None;
                        post_process = false;
                        retry_delay = None;
                        None
                    }
                }
            }
        };

        if let Some((from, to)) = applied {
            self.emit_status(id, from, to);
            self.persist(id).await;
            if let Some(delay) = retry_delay {
                self.schedule_requeue(id, generation, delay);
            }
            if post_process {
                self.spawn_post_processing(id, generation);
            }
        }
        self.wake();
    }

    /// Move a `Retrying` entry back to `Queued` after `delay`.
    fn schedule_requeue(self: &Arc<Self>, id: u64, generation: u64, delay: Duration) {
        debug!(entry_id = id, delay_ms = delay.as_millis() as u64, "Retry scheduled");
        let inner = Arc::clone(self);
        self.tasks.spawn(async move {
            tokio::select! {
                _ = inner.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let requeued = inner
                .entries
                .get(&id)
                .map(|slot| Arc::clone(slot.value()))
                .is_some_and(|slot| {
                    let mut entry = slot.lock();
                    entry.generation == generation
                        && entry.status == DownloadStatus::Retrying
                        && entry.transition(DownloadStatus::Queued).is_ok()
                });
            if requeued {
                inner.emit_status(id, DownloadStatus::Retrying, DownloadStatus::Queued);
                inner.persist(id).await;
                inner.wake();
            }
        });
    }

    /// Move an entry to the next post-processing stage.
    ///
    /// Returns a copy of the entry, or `None` if the attempt was cancelled
    /// or superseded in the meantime.
    fn advance(&self, id: u64, generation: u64, next: DownloadStatus) -> Option<QueueEntry> {
        let slot = self.entries.get(&id).map(|slot| Arc::clone(slot.value()))?;
        let mut entry = slot.lock();
        if entry.generation != generation || entry.is_terminal() {
            return None;
        }
        let from = entry.status;
        if let Err(e) = entry.transition(next) {
            warn!(entry_id = id, error = %e, "Cannot advance post-processing");
            return None;
        }
        if next.is_terminal() {
            entry.cancel_token = None;
        }
        self.emit_status(id, from, next);
        Some(entry.clone())
    }

    fn note_output(&self, id: u64, generation: u64, line: String) {
        if let Some(slot) = self.entries.get(&id).map(|slot| Arc::clone(slot.value())) {
            let mut entry = slot.lock();
            if entry.generation == generation {
                entry.last_output = Some(line.clone());
                drop(entry);
                self.emit(EntryEvent::Output { id, line });
            }
        }
    }

    fn spawn_post_processing(self: &Arc<Self>, id: u64, generation: u64) {
        let inner = Arc::clone(self);
        self.tasks.spawn(async move { inner.post_process(id, generation).await });
    }

    async fn post_process(self: Arc<Self>, id: u64, generation: u64) {
        let token = self
            .entries
            .get(&id)
            .and_then(|slot| slot.value().lock().cancel_token.clone())
            .unwrap_or_else(|| self.shutdown.child_token());
        let Some(_permit) = self.acquire_worker(&token).await else {
            return;
        };
        let (deduplicate, transcode, remove_on_success) = {
            let config = self.config.read();
            (config.deduplicate, config.transcode, config.remove_on_success)
        };

        if deduplicate {
            let Some(entry) = self.advance(id, generation, DownloadStatus::Deduplicating) else {
                return;
            };
            self.persist(id).await;
            match self.post_processor.deduplicate(&entry).await {
                Ok(removed) if !removed.is_empty() => {
                    if let Some(slot) = self.entries.get(&id).map(|slot| Arc::clone(slot.value())) {
                        let mut entry = slot.lock();
                        for path in &removed {
                            entry.artifacts.mark_removed(path.clone());
                        }
                    }
                    self.note_output(
                        id,
                        generation,
                        format!("Removed {} duplicate file(s)", removed.len()),
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(entry_id = id, error = %e, "Deduplication failed");
                    self.note_output(id, generation, format!("Deduplication failed: {e}"));
                }
            }
        }

        if transcode {
            let Some(entry) = self.advance(id, generation, DownloadStatus::Transcoding) else {
                return;
            };
            self.persist(id).await;
            match self.post_processor.transcode(&entry, &token).await {
                Ok(produced) => {
                    if let Some(slot) = self.entries.get(&id).map(|slot| Arc::clone(slot.value())) {
                        let mut entry = slot.lock();
                        for path in produced {
                            entry.artifacts.push(ArtifactKind::File, path);
                        }
                    }
                }
                // a cancel already moved the entry on
                Err(Error::Cancelled) => return,
                Err(e) => {
                    warn!(entry_id = id, error = %e, "Transcoding failed");
                    self.note_output(id, generation, format!("Transcoding failed: {e}"));
                }
            }
        }

        if self.advance(id, generation, DownloadStatus::Complete).is_none() {
            return;
        }
        info!(entry_id = id, "Download complete");

        if remove_on_success {
            if self.entries.remove(&id).is_some() {
                if let Err(e) = self.store.remove(id).await {
                    error!(entry_id = id, error = %e, "Failed to remove completed entry");
                }
                self.emit(EntryEvent::Removed { id });
            }
        } else {
            self.persist(id).await;
        }
    }

    fn spawn_metadata_query(self: &Arc<Self>, id: u64) {
        let Some(provider) = self.metadata.clone() else {
            return;
        };
        let Ok(slot) = self.slot(id) else {
            return;
        };
        let token = self.shutdown.child_token();
        let (url, generation) = {
            let mut entry = slot.lock();
            entry.cancel_token = Some(token.clone());
            (entry.url.clone(), entry.generation)
        };

        let inner = Arc::clone(self);
        self.tasks.spawn(async move {
            let metadata = match inner.acquire_worker(&token).await {
                Some(_permit) => match provider.query(&url, &token).await {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        debug!(entry_id = id, error = %e, "Metadata lookup failed");
                        None
                    }
                },
                None => None,
            };

            let queued = {
                let mut entry = slot.lock();
                if entry.generation != generation || entry.status != DownloadStatus::Querying {
                    false
                } else {
                    entry.cancel_token = None;
                    if let Some(metadata) = metadata {
                        entry.title = metadata.title.or(entry.title.take());
                        entry.sequence = entry.sequence.or(metadata.playlist_index);
                    }
                    // on shutdown the entry stays in Querying and restore re-queues it
                    !inner.shutdown.is_cancelled()
                        && entry.transition(DownloadStatus::Queued).is_ok()
                }
            };
            if queued {
                inner.emit_status(id, DownloadStatus::Querying, DownloadStatus::Queued);
                inner.persist(id).await;
                inner.wake();
            }
        });
    }
}

fn log_outcome(entry: &QueueEntry, kind: BackendKind, outcome: AttemptOutcome) {
    match entry.status {
        DownloadStatus::Retrying => warn!(
            entry_id = entry.id,
            backend = %kind,
            attempt = entry.retry_counter,
            "Download failed, will retry"
        ),
        DownloadStatus::Failed => error!(
            entry_id = entry.id,
            backend = %kind,
            attempts = entry.retry_counter,
            "Download failed"
        ),
        DownloadStatus::Queued if outcome == AttemptOutcome::Unsupported => info!(
            entry_id = entry.id,
            backend = %kind,
            "Backend cannot handle URL, trying another"
        ),
        status => debug!(entry_id = entry.id, backend = %kind, %status, "Attempt finished"),
    }
}

/// Feeds progress from one attempt into its entry.
struct EntryReporter {
    inner: Arc<ManagerInner>,
    id: u64,
    generation: u64,
}

impl EntryReporter {
    /// Run `apply` on the entry if this attempt is still the current one.
    fn with_entry<R>(&self, apply: impl FnOnce(&mut QueueEntry) -> R) -> Option<R> {
        let slot = self
            .inner
            .entries
            .get(&self.id)
            .map(|slot| Arc::clone(slot.value()))?;
        let mut entry = slot.lock();
        if entry.generation != self.generation || !entry.status.is_attempt_phase() {
            return None;
        }
        Some(apply(&mut entry))
    }
}

impl AttemptReporter for EntryReporter {
    fn phase(&self, status: DownloadStatus) {
        if !status.is_attempt_phase() {
            return;
        }
        let changed = self.with_entry(|entry| {
            let from = entry.status;
            (from != status && entry.transition(status).is_ok()).then_some(from)
        });
        if let Some(Some(from)) = changed {
            self.inner.emit_status(self.id, from, status);
        }
    }

    fn output(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        if self
            .with_entry(|entry| entry.last_output = Some(line.to_string()))
            .is_some()
        {
            self.inner.emit(EntryEvent::Output {
                id: self.id,
                line: line.to_string(),
            });
        }
    }

    fn category(&self, category: Category, status: CategoryStatus) {
        if self
            .with_entry(|entry| entry.category_status.insert(category, status))
            .is_some()
        {
            self.inner.emit(EntryEvent::Updated { id: self.id });
        }
    }

    fn artifact(&self, kind: ArtifactKind, path: PathBuf) {
        if self
            .with_entry(|entry| entry.artifacts.push(kind, path))
            .is_some()
        {
            self.inner.emit(EntryEvent::Updated { id: self.id });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct AlwaysSucceeds;

    #[async_trait]
    impl BackendAdapter for AlwaysSucceeds {
        fn kind(&self) -> BackendKind {
            BackendKind::DirectHttp
        }

        fn supported_categories(&self) -> &'static [Category] {
            &[Category::Video]
        }

        fn is_available(&self) -> bool {
            true
        }

        async fn run(&self, _ctx: AttemptContext) -> AttemptResult {
            AttemptResult::success()
        }
    }

    fn manager(config: DownloadManagerConfig) -> DownloadManager {
        DownloadManager::builder(config)
            .backend(Arc::new(AlwaysSucceeds))
            .build()
            .unwrap()
    }

    fn quiet_config() -> DownloadManagerConfig {
        DownloadManagerConfig {
            download_dir: std::env::temp_dir(),
            ..Default::default()
        }
    }

    #[test]
    fn test_download_manager_config_default() {
        let config = DownloadManagerConfig::default();
        assert_eq!(config.max_concurrent_downloads, 2);
        assert_eq!(config.max_download_retries, 3);
        assert_eq!(config.categories, vec![Category::Video]);
        assert!(config.validate().is_ok());
        assert_eq!(config.worker_permits(), 4);
    }

    #[test]
    fn test_zero_ceiling_is_rejected() {
        let config = DownloadManagerConfig {
            max_concurrent_downloads: 0,
            ..Default::default()
        };
        assert!(DownloadManager::builder(config).build().is_err());
    }

    #[tokio::test]
    async fn test_enqueue_assigns_increasing_ids() {
        let manager = manager(quiet_config());
        let a = manager
            .enqueue_with(EnqueueRequest::new("https://example.com/a"))
            .await
            .unwrap();
        let b = manager
            .enqueue_with(EnqueueRequest::new("https://example.com/b"))
            .await
            .unwrap();
        assert_eq!(a, Some(1));
        assert_eq!(b, Some(2));
        assert_eq!(manager.get(1).unwrap().status, DownloadStatus::Queued);
        assert_eq!(manager.queued_count(), 2);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_empty_url() {
        let manager = manager(quiet_config());
        assert!(!manager.enqueue("", false).await.unwrap());
        assert!(!manager.enqueue("   ", true).await.unwrap());
        assert!(manager.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_within_window_is_ignored() {
        let manager = manager(quiet_config());
        assert!(manager.enqueue("https://example.com/v", false).await.unwrap());
        assert!(!manager.enqueue("https://example.com/v", false).await.unwrap());
        assert!(manager.enqueue("https://example.com/v", true).await.unwrap());
        assert_eq!(manager.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_after_window_is_accepted() {
        let manager = manager(DownloadManagerConfig {
            duplicate_window_ms: 0,
            ..quiet_config()
        });
        assert!(manager.enqueue("https://example.com/v", false).await.unwrap());
        assert!(manager.enqueue("https://example.com/v", false).await.unwrap());
    }

    #[tokio::test]
    async fn test_blocked_manager_rejects_enqueue() {
        let manager = manager(quiet_config());
        let mut activity = manager.subscribe_activity();

        manager.set_blocked(true);
        assert!(manager.is_blocked());
        assert!(!manager.enqueue("https://example.com/v", false).await.unwrap());
        assert_eq!(
            activity.try_recv().unwrap(),
            ActivityEvent::BlockedChanged { blocked: true }
        );

        manager.set_blocked(false);
        assert!(manager.enqueue("https://example.com/v", false).await.unwrap());
    }

    #[tokio::test]
    async fn test_blocked_manager_does_not_dispatch() {
        let manager = manager(quiet_config());
        manager.enqueue("https://example.com/v", false).await.unwrap();
        manager.set_blocked(true);
        assert!(manager.inner.dispatch_cycle().is_empty());
        assert_eq!(manager.running_count(), 0);
    }

    #[tokio::test]
    async fn test_retry_requires_finished_entry() {
        let manager = manager(quiet_config());
        manager.enqueue("https://example.com/v", false).await.unwrap();

        let err = manager.retry(1).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(matches!(
            manager.retry(42).await.unwrap_err(),
            Error::NotFound { .. }
        ));

        assert!(manager.cancel(1).await.unwrap());
        assert_eq!(manager.get(1).unwrap().status, DownloadStatus::Stopped);
        manager.retry(1).await.unwrap();
        assert_eq!(manager.get(1).unwrap().status, DownloadStatus::Queued);
    }

    #[tokio::test]
    async fn test_cancel_terminal_entry_returns_false() {
        let manager = manager(quiet_config());
        manager.enqueue("https://example.com/v", false).await.unwrap();
        assert!(manager.cancel(1).await.unwrap());
        assert!(!manager.cancel(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_set_priority_and_reorder() {
        let manager = manager(quiet_config());
        manager.enqueue("https://example.com/v", false).await.unwrap();
        let mut events = manager.subscribe_entries();

        manager.set_priority(1, Priority::Maximum).await.unwrap();
        manager.reorder(1, Some(7)).await.unwrap();

        let entry = manager.get(1).unwrap();
        assert_eq!(entry.priority, Priority::Maximum);
        assert_eq!(entry.sequence, Some(7));
        assert_eq!(events.try_recv().unwrap(), EntryEvent::Updated { id: 1 });
    }

    #[tokio::test]
    async fn test_set_max_concurrent_grows_worker_pool() {
        let manager = manager(quiet_config());
        assert!(manager.set_max_concurrent(0).is_err());
        manager.set_max_concurrent(8).unwrap();
        assert_eq!(manager.config().max_concurrent_downloads, 8);
        assert_eq!(manager.inner.workers.available_permits(), 8);
    }

    #[tokio::test]
    async fn test_remove_entry() {
        let manager = manager(quiet_config());
        manager.enqueue("https://example.com/v", false).await.unwrap();
        assert!(manager.remove(1).await.unwrap());
        assert!(!manager.remove(1).await.unwrap());
        assert!(manager.get(1).is_none());
    }

    #[tokio::test]
    async fn test_forced_blacklisted_backend_is_no_method() {
        let manager = manager(quiet_config());
        let id = manager
            .enqueue_with(EnqueueRequest::new("https://example.com/v").backend(BackendKind::DirectHttp))
            .await
            .unwrap()
            .unwrap();
        manager
            .inner
            .slot(id)
            .unwrap()
            .lock()
            .backend_blacklist
            .insert(BackendKind::DirectHttp);

        let changed = manager.inner.dispatch_cycle();
        assert_eq!(changed, vec![id]);
        assert_eq!(manager.get(id).unwrap().status, DownloadStatus::NoMethod);
        assert_eq!(manager.running_count(), 0);
    }

    #[tokio::test]
    async fn test_restore_requeues_interrupted_entries() {
        let store = Arc::new(MemoryStore::new());
        let mut downloading = QueueEntry::new(1, "https://example.com/a", DownloadStatus::Downloading);
        downloading.retry_counter = 1;
        store.save(&downloading).await.unwrap();
        store
            .save(&QueueEntry::new(2, "https://example.com/b", DownloadStatus::Complete))
            .await
            .unwrap();

        let manager = DownloadManager::builder(quiet_config())
            .store(store.clone())
            .build()
            .unwrap();
        assert_eq!(manager.restore().await.unwrap(), 2);
        assert_eq!(manager.get(1).unwrap().status, DownloadStatus::Queued);
        assert_eq!(manager.get(1).unwrap().retry_counter, 1);
        assert_eq!(manager.get(2).unwrap().status, DownloadStatus::Complete);
        assert_eq!(store.get(1).unwrap().status, DownloadStatus::Queued);
    }

    #[tokio::test]
    async fn test_snapshot_follows_sort_order() {
        let manager = manager(quiet_config());
        manager.enqueue("https://b.example.com", false).await.unwrap();
        manager.enqueue("https://a.example.com", false).await.unwrap();

        manager.set_sort_order(SortOrder::UrlAsc);
        let ids: Vec<u64> = manager.snapshot().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![2, 1]);

        manager.set_sort_order(SortOrder::InsertionDesc);
        let ids: Vec<u64> = manager.snapshot().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![2, 1]);

        manager.set_sort_order(SortOrder::InsertionAsc);
        let ids: Vec<u64> = manager.snapshot().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }
}
