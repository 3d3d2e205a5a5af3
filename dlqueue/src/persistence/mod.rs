//! Queue persistence.
//!
//! The manager writes every entry mutation through a [`QueueStore`] and reads
//! the whole queue back on startup. Ids come from the store so they stay
//! unique and increasing across restarts.

mod json;
mod memory;

use async_trait::async_trait;
use tracing::trace;

pub use json::JsonFileStore;
pub use memory::MemoryStore;

use crate::Result;
use crate::downloader::QueueEntry;

/// Whether `incoming` may replace what the store holds for its id.
fn accepts(stored: Option<&QueueEntry>, removed: bool, incoming: &QueueEntry) -> bool {
    if removed {
        trace!(entry_id = incoming.id, "Dropping save of a removed entry");
        return false;
    }
    match stored {
        Some(stored) if stored.revision > incoming.revision => {
            trace!(
                entry_id = incoming.id,
                stored = stored.revision,
                incoming = incoming.revision,
                "Dropping stale entry snapshot"
            );
            false
        }
        _ => true,
    }
}

/// Durable storage for queue entries and the id counter.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Allocate the next entry id. Ids are never reused.
    async fn next_id(&self) -> Result<u64>;

    /// Insert or replace an entry.
    ///
    /// A save is dropped when the store already holds a higher revision of
    /// the entry, or when the id was removed.
    async fn save(&self, entry: &QueueEntry) -> Result<()>;

    /// Forget an entry for good. Removing an unknown id is not an error.
    async fn remove(&self, id: u64) -> Result<()>;

    /// Every stored entry, ordered by id.
    async fn load_all(&self) -> Result<Vec<QueueEntry>>;

    /// Push buffered writes to durable storage.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
