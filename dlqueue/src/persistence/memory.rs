use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{QueueStore, accepts};
use crate::Result;
use crate::downloader::QueueEntry;

/// Store that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    last_id: AtomicU64,
    contents: Mutex<Contents>,
}

#[derive(Debug, Default)]
struct Contents {
    entries: BTreeMap<u64, QueueEntry>,
    removed: HashSet<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start allocating ids after `last_id`.
    pub fn with_last_id(last_id: u64) -> Self {
        Self {
            last_id: AtomicU64::new(last_id),
            contents: Mutex::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.contents.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.lock().entries.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<QueueEntry> {
        self.contents.lock().entries.get(&id).cloned()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn next_id(&self) -> Result<u64> {
        Ok(self.last_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn save(&self, entry: &QueueEntry) -> Result<()> {
        let mut contents = self.contents.lock();
        if accepts(
            contents.entries.get(&entry.id),
            contents.removed.contains(&entry.id),
            entry,
        ) {
            contents.entries.insert(entry.id, entry.clone());
        }
        Ok(())
    }

    async fn remove(&self, id: u64) -> Result<()> {
        let mut contents = self.contents.lock();
        contents.entries.remove(&id);
        contents.removed.insert(id);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<QueueEntry>> {
        Ok(self.contents.lock().entries.values().cloned().collect())
    }
}
