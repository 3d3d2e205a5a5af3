//! Download queue.
//!
//! The Download Manager is responsible for:
//! - Holding the queue and its ordering (priority, then the active sort order)
//! - Admitting at most `max_concurrent_downloads` attempts at once
//! - Running attempts on interchangeable backends
//! - Turning attempt result flags into retries, backend fallback or terminal states
//! - Sequencing post-processing after a successful download

pub mod backend;

mod entry;
mod manager;
mod ordering;
mod resilience;
mod result;

pub use entry::{Artifacts, DownloadStatus, Priority, QueueEntry};
pub use manager::{
    ActivityEvent, DownloadManager, DownloadManagerBuilder, DownloadManagerConfig,
    EnqueueRequest, EntryEvent,
};
pub use ordering::{SortKey, SortOrder, dispatch_order};
pub use resilience::RetryConfig;
pub use result::{AttemptOutcome, AttemptResult, ResultFlags};
