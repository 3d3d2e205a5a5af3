use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{QueueStore, accepts};
use crate::downloader::QueueEntry;
use crate::utils::fs::{ensure_dir_all_with_op, io_error, write_atomic};
use crate::{Error, Result};

const QUEUE_FILE: &str = "queue.json";
const COUNTER_FILE: &str = "last-id";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct QueueFile {
    version: u32,
    entries: Vec<QueueEntry>,
}

struct State {
    last_id: u64,
    entries: BTreeMap<u64, QueueEntry>,
    /// Ids removed since the store was opened.
    removed: HashSet<u64>,
}

/// Store that keeps the queue in a JSON file inside a data directory.
///
/// The id counter lives in its own file and is written before an id is
/// handed out. Both files are replaced atomically.
pub struct JsonFileStore {
    queue_path: PathBuf,
    counter_path: PathBuf,
    state: Mutex<State>,
}

impl JsonFileStore {
    /// Open (or create) the store in `dir`.
    pub async fn open(dir: &Path) -> Result<Self> {
        ensure_dir_all_with_op("creating data directory", dir).await?;
        let queue_path = dir.join(QUEUE_FILE);
        let counter_path = dir.join(COUNTER_FILE);

        let entries = read_queue(&queue_path).await?;
        let counter = read_counter(&counter_path).await?;
        let max_entry_id = entries.keys().next_back().copied().unwrap_or(0);
        let last_id = counter.max(max_entry_id);

        debug!(
            path = %queue_path.display(),
            entries = entries.len(),
            last_id,
            "Opened queue store"
        );

        Ok(Self {
            queue_path,
            counter_path,
            state: Mutex::new(State {
                last_id,
                entries,
                removed: HashSet::new(),
            }),
        })
    }

    pub fn queue_path(&self) -> &Path {
        &self.queue_path
    }

    async fn write_queue(&self, entries: &BTreeMap<u64, QueueEntry>) -> Result<()> {
        let file = QueueFile {
            version: FORMAT_VERSION,
            entries: entries.values().cloned().collect(),
        };
        let json = serde_json::to_vec_pretty(&file)?;
        write_atomic("writing queue file", &self.queue_path, &json).await
    }
}

async fn read_queue(path: &Path) -> Result<BTreeMap<u64, QueueEntry>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(io_error("reading queue file", path, e)),
    };

    match serde_json::from_slice::<QueueFile>(&bytes) {
        Ok(file) => Ok(file.entries.into_iter().map(|e| (e.id, e)).collect()),
        Err(e) => {
            let mut backup = path.as_os_str().to_owned();
            backup.push(".corrupt");
            let backup = PathBuf::from(backup);
            warn!(
                path = %path.display(),
                backup = %backup.display(),
                error = %e,
                "Queue file is unreadable, starting with an empty queue"
            );
            tokio::fs::rename(path, &backup)
                .await
                .map_err(|e| io_error("backing up queue file", path, e))?;
            Ok(BTreeMap::new())
        }
    }
}

async fn read_counter(path: &Path) -> Result<u64> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => text.trim().parse::<u64>().map_err(|e| {
            Error::config(format!("Invalid id counter in {}: {e}", path.display()))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(io_error("reading id counter", path, e)),
    }
}

#[async_trait]
impl QueueStore for JsonFileStore {
    async fn next_id(&self) -> Result<u64> {
        let mut state = self.state.lock().await;
        let id = state.last_id + 1;
        write_atomic(
            "writing id counter",
            &self.counter_path,
            id.to_string().as_bytes(),
        )
        .await?;
        state.last_id = id;
        Ok(id)
    }

    async fn save(&self, entry: &QueueEntry) -> Result<()> {
        let mut state = self.state.lock().await;
        if !accepts(
            state.entries.get(&entry.id),
            state.removed.contains(&entry.id),
            entry,
        ) {
            return Ok(());
        }
        state.entries.insert(entry.id, entry.clone());
        self.write_queue(&state.entries).await
    }

    async fn remove(&self, id: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        state.removed.insert(id);
        if state.entries.remove(&id).is_some() {
            self.write_queue(&state.entries).await?;
        }
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<QueueEntry>> {
        let state = self.state.lock().await;
        Ok(state.entries.values().cloned().collect())
    }

    async fn flush(&self) -> Result<()> {
        let state = self.state.lock().await;
        self.write_queue(&state.entries).await
    }
}
