//! Queue entries and their status state machine.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::backend::{ArtifactKind, BackendKind, Category, CategoryStatus};
use super::ordering::SortKey;
use super::result::ResultFlags;
use crate::{Error, Result};

/// Status of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadStatus {
    /// Waiting for metadata lookup.
    Querying,
    /// Ready for dispatch.
    Queued,
    /// Backend selected, attempt being launched.
    Starting,
    /// Backend is preparing (extracting, resolving formats).
    Preparing,
    /// Backend is processing input before the transfer begins.
    Processing,
    /// Transfer in progress.
    Downloading,
    /// Download finished, post-processing running.
    PostProcessing,
    /// Duplicate detection running.
    Deduplicating,
    /// Transcoding running.
    Transcoding,
    /// Attempt failed, waiting to be queued again.
    Retrying,
    Complete,
    Failed,
    Stopped,
    Skipped,
    /// No backend can handle the URL.
    NoMethod,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Querying => "QUERYING",
            Self::Queued => "QUEUED",
            Self::Starting => "STARTING",
            Self::Preparing => "PREPARING",
            Self::Processing => "PROCESSING",
            Self::Downloading => "DOWNLOADING",
            Self::PostProcessing => "POST_PROCESSING",
            Self::Deduplicating => "DEDUPLICATING",
            Self::Transcoding => "TRANSCODING",
            Self::Retrying => "RETRYING",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
            Self::Skipped => "SKIPPED",
            Self::NoMethod => "NO_METHOD",
        }
    }

    /// Terminal statuses never transition on their own.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Failed | Self::Stopped | Self::Skipped | Self::NoMethod
        )
    }

    /// Statuses during which a backend attempt owns the entry.
    pub fn is_attempt_phase(&self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Preparing | Self::Processing | Self::Downloading
        )
    }

    /// Check whether `next` is a legal successor of this status.
    ///
    /// Explicit user actions (retry) reset terminal entries without going
    /// through this check.
    pub fn can_transition_to(&self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;

        if self.is_terminal() {
            return false;
        }
        if *self == next {
            return true;
        }

        match (*self, next) {
            (_, Stopped | Failed | Skipped | NoMethod) => true,
            (Retrying, Queued) => true,
            (_, Retrying) => true,
            (Querying, Queued) => true,
            (Queued, Starting) => true,
            // backend fallback puts an attempt back into the queue
            (Starting | Preparing | Processing | Downloading, Queued) => true,
            (Starting, Preparing | Processing | Downloading) => true,
            (Preparing, Processing | Downloading) => true,
            (Processing, Preparing | Downloading) => true,
            (Downloading, Preparing | Processing) => true,
            (Starting | Preparing | Processing | Downloading, PostProcessing) => true,
            (PostProcessing, Deduplicating | Transcoding | Complete) => true,
            (Deduplicating, Transcoding | Complete) => true,
            (Transcoding, Complete) => true,
            _ => false,
        }
    }

    /// Rank used by the status sort order.
    pub(crate) fn sort_bucket(&self) -> u8 {
        match self {
            Self::Downloading => 0,
            Self::Preparing | Self::Processing | Self::Starting => 1,
            Self::PostProcessing | Self::Deduplicating | Self::Transcoding => 2,
            Self::Retrying => 3,
            Self::Querying => 4,
            Self::Queued => 5,
            Self::Complete => 6,
            Self::Stopped => 7,
            Self::Skipped => 8,
            Self::Failed => 9,
            Self::NoMethod => 10,
        }
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch priority. Five tiers, symmetric around zero.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Minimum,
    Low,
    #[default]
    Normal,
    High,
    Maximum,
}

impl Priority {
    pub fn weight(&self) -> i8 {
        match self {
            Self::Minimum => -2,
            Self::Low => -1,
            Self::Normal => 0,
            Self::High => 1,
            Self::Maximum => 2,
        }
    }

    pub fn from_weight(weight: i8) -> Self {
        match weight {
            i8::MIN..=-2 => Self::Minimum,
            -1 => Self::Low,
            0 => Self::Normal,
            1 => Self::High,
            _ => Self::Maximum,
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "minimum" | "min" => Ok(Self::Minimum),
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "maximum" | "max" => Ok(Self::Maximum),
            other => Err(Error::validation(format!("Unknown priority: {other}"))),
        }
    }
}

/// Files produced by an entry. Lists only grow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifacts {
    pub files: Vec<PathBuf>,
    pub thumbnails: Vec<PathBuf>,
    pub logs: Vec<PathBuf>,
    /// Files deleted by post-processing. They stay listed in `files`.
    #[serde(default)]
    pub removed: Vec<PathBuf>,
}

impl Artifacts {
    /// Record a path, ignoring exact repeats.
    pub fn push(&mut self, kind: ArtifactKind, path: PathBuf) {
        let list = match kind {
            ArtifactKind::File => &mut self.files,
            ArtifactKind::Thumbnail => &mut self.thumbnails,
            ArtifactKind::Log => &mut self.logs,
        };
        if !list.contains(&path) {
            list.push(path);
        }
    }

    /// Record that post-processing deleted `path`.
    pub fn mark_removed(&mut self, path: PathBuf) {
        if !self.removed.contains(&path) {
            self.removed.push(path);
        }
    }

    /// Files still on disk as far as the queue knows.
    pub fn present_files(&self) -> impl Iterator<Item = &PathBuf> {
        self.files.iter().filter(|path| !self.removed.contains(path))
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.thumbnails.is_empty() && self.logs.is_empty()
    }
}

/// One requested download and its lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: u64,
    pub url: String,
    pub original_url: String,
    #[serde(default)]
    pub title: Option<String>,
    pub status: DownloadStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub sequence: Option<u64>,
    #[serde(default)]
    pub forced_backend: Option<BackendKind>,
    #[serde(default)]
    pub current_backend: Option<BackendKind>,
    #[serde(default)]
    pub backend_blacklist: BTreeSet<BackendKind>,
    #[serde(default)]
    pub retry_counter: u32,
    #[serde(default)]
    pub result_flags: ResultFlags,
    #[serde(default)]
    pub artifacts: Artifacts,
    #[serde(default)]
    pub last_output: Option<String>,
    #[serde(default)]
    pub category_status: BTreeMap<Category, CategoryStatus>,
    pub added_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped each time the entry is written to a store. Stores keep the
    /// highest revision they have seen.
    #[serde(default)]
    pub revision: u64,
    /// Present only while an attempt is in flight.
    #[serde(skip)]
    pub(crate) cancel_token: Option<CancellationToken>,
    /// Bumped on every dispatch and cancel; results from older attempts are dropped.
    #[serde(skip)]
    pub(crate) generation: u64,
}

impl QueueEntry {
    pub fn new(id: u64, url: impl Into<String>, status: DownloadStatus) -> Self {
        let url = url.into();
        let now = Utc::now();
        Self {
            id,
            original_url: url.clone(),
            url,
            title: None,
            status,
            priority: Priority::Normal,
            sequence: None,
            forced_backend: None,
            current_backend: None,
            backend_blacklist: BTreeSet::new(),
            retry_counter: 0,
            result_flags: ResultFlags::default(),
            artifacts: Artifacts::default(),
            last_output: None,
            category_status: BTreeMap::new(),
            added_at: now,
            updated_at: now,
            revision: 0,
            cancel_token: None,
            generation: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether an attempt currently holds a cancellation token.
    pub fn is_in_flight(&self) -> bool {
        self.cancel_token.is_some()
    }

    /// Move to `next`, rejecting illegal transitions.
    pub fn transition(&mut self, next: DownloadStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::invalid_transition(self.status, next));
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    /// Reset a finished entry so it can be dispatched again.
    pub(crate) fn reset_for_retry(&mut self) {
        if self.status == DownloadStatus::NoMethod {
            self.backend_blacklist.clear();
        }
        self.retry_counter = 0;
        self.result_flags = ResultFlags::default();
        self.cancel_token = None;
        self.category_status.clear();
        self.status = DownloadStatus::Queued;
        self.touch();
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn sort_key(&self) -> SortKey {
        SortKey {
            id: self.id,
            priority: self.priority,
            sequence: self.sequence,
            url: self.url.clone(),
            title: self.title.clone(),
            status: self.status,
        }
    }
}
