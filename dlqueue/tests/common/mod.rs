//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use dlqueue::downloader::backend::{
    ArtifactKind, AttemptContext, BackendAdapter, BackendKind, Category,
};
use dlqueue::downloader::{
    AttemptResult, DownloadManager, DownloadManagerConfig, EntryEvent, QueueEntry,
};
use dlqueue::filter::FilterResolver;
use dlqueue::process::ProcessSpec;

/// Backend that replays scripted results.
///
/// Once the script runs out every attempt returns `fallback`. With a `hold`
/// each attempt stays busy for that long unless it is cancelled first.
pub struct ScriptedAdapter {
    kind: BackendKind,
    script: Mutex<VecDeque<AttemptResult>>,
    fallback: AttemptResult,
    hold: Duration,
    artifacts: Vec<PathBuf>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    calls: AtomicUsize,
    started: Mutex<Vec<u64>>,
}

impl ScriptedAdapter {
    pub fn new(kind: BackendKind, fallback: AttemptResult) -> Self {
        Self {
            kind,
            script: Mutex::new(VecDeque::new()),
            fallback,
            hold: Duration::ZERO,
            artifacts: Vec::new(),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
        }
    }

    pub fn with_script(self, results: impl IntoIterator<Item = AttemptResult>) -> Self {
        self.script.lock().extend(results);
        self
    }

    pub fn with_hold(mut self, hold: Duration) -> Self {
        self.hold = hold;
        self
    }

    /// Files every finished attempt reports.
    pub fn with_artifacts(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.artifacts = paths.into_iter().collect();
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    /// Entry ids in the order their attempts began.
    pub fn started(&self) -> Vec<u64> {
        self.started.lock().clone()
    }
}

#[async_trait]
impl BackendAdapter for ScriptedAdapter {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn supported_categories(&self) -> &'static [Category] {
        &[Category::Video]
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn run(&self, ctx: AttemptContext) -> AttemptResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.lock().push(ctx.entry_id);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        let cancelled = if self.hold.is_zero() {
            ctx.cancel.is_cancelled()
        } else {
            tokio::select! {
                _ = ctx.cancel.cancelled() => true,
                _ = tokio::time::sleep(self.hold) => false,
            }
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        if cancelled {
            return AttemptResult::stopped();
        }
        for path in &self.artifacts {
            ctx.reporter.artifact(ArtifactKind::File, path.clone());
        }
        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Resolver that offers backends in a fixed order and builds no commands.
pub struct OrderedResolver {
    order: Vec<BackendKind>,
    command: Option<ProcessSpec>,
}

impl OrderedResolver {
    pub fn new(order: impl IntoIterator<Item = BackendKind>) -> Self {
        Self {
            order: order.into_iter().collect(),
            command: None,
        }
    }

    /// Every category of every backend runs `command`.
    pub fn with_command(mut self, command: ProcessSpec) -> Self {
        self.command = Some(command);
        self
    }
}

impl FilterResolver for OrderedResolver {
    fn resolve_backend(&self, _url: &str, excluded: &BTreeSet<BackendKind>) -> Option<BackendKind> {
        self.order.iter().copied().find(|kind| !excluded.contains(kind))
    }

    fn build_arguments(
        &self,
        _kind: BackendKind,
        _category: Category,
        _target_dir: &Path,
        _url: &str,
    ) -> Option<ProcessSpec> {
        self.command.clone()
    }
}

/// Manager settings that keep tests fast.
pub fn fast_config(download_dir: &Path) -> DownloadManagerConfig {
    DownloadManagerConfig {
        max_concurrent_downloads: 2,
        retry_delay_min_ms: 0,
        retry_delay_max_ms: 0,
        randomize_retry_delay: false,
        dispatch_interval_ms: 20,
        download_dir: download_dir.to_path_buf(),
        shutdown_timeout_ms: 5000,
        ..Default::default()
    }
}

/// Poll `manager` until `check` holds for entry `id`, or panic after `timeout`.
pub async fn wait_for_entry(
    manager: &DownloadManager,
    id: u64,
    timeout: Duration,
    check: impl Fn(&QueueEntry) -> bool,
) -> QueueEntry {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(entry) = manager.get(id)
            && check(&entry)
        {
            return entry;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("entry {id} did not reach the expected state: {:?}", manager.get(id));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until every entry is terminal and nothing runs.
pub async fn wait_until_idle(manager: &DownloadManager, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !manager.is_idle() {
        if tokio::time::Instant::now() >= deadline {
            panic!("queue did not settle: {:?}", manager.snapshot());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Ids of `StatusChanged { to }` events received so far.
pub fn drain_transitions(
    events: &mut tokio::sync::broadcast::Receiver<EntryEvent>,
    to: dlqueue::downloader::DownloadStatus,
) -> Vec<u64> {
    let mut ids = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let EntryEvent::StatusChanged { id, to: status, .. } = event
            && status == to
        {
            ids.push(id);
        }
    }
    ids
}
