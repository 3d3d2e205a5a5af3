//! Queue ordering.
//!
//! Every comparator is total: when the primary key ties, the entry id
//! decides. Descending orders are the exact reverse of their ascending
//! counterpart, so missing values sort last ascending and first descending.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::entry::{DownloadStatus, Priority};

/// The fields of an entry that ordering looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub id: u64,
    pub priority: Priority,
    pub sequence: Option<u64>,
    pub url: String,
    pub title: Option<String>,
    pub status: DownloadStatus,
}

/// User-selected secondary ordering of the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SortOrder {
    UrlAsc,
    UrlDesc,
    TitleAsc,
    TitleDesc,
    Status,
    #[default]
    InsertionAsc,
    InsertionDesc,
    Sequence,
}

impl SortOrder {
    pub const ALL: [SortOrder; 8] = [
        Self::UrlAsc,
        Self::UrlDesc,
        Self::TitleAsc,
        Self::TitleDesc,
        Self::Status,
        Self::InsertionAsc,
        Self::InsertionDesc,
        Self::Sequence,
    ];

    pub fn compare(&self, a: &SortKey, b: &SortKey) -> Ordering {
        match self {
            Self::UrlAsc => compare_text(Some(&a.url), Some(&b.url)).then(a.id.cmp(&b.id)),
            Self::UrlDesc => Self::UrlAsc.compare(a, b).reverse(),
            Self::TitleAsc => {
                compare_text(a.title.as_deref(), b.title.as_deref()).then(a.id.cmp(&b.id))
            }
            Self::TitleDesc => Self::TitleAsc.compare(a, b).reverse(),
            Self::Status => a
                .status
                .sort_bucket()
                .cmp(&b.status.sort_bucket())
                .then(a.id.cmp(&b.id)),
            Self::InsertionAsc => a.id.cmp(&b.id),
            Self::InsertionDesc => b.id.cmp(&a.id),
            Self::Sequence => compare_missing_last(a.sequence, b.sequence).then(a.id.cmp(&b.id)),
        }
    }
}

impl std::str::FromStr for SortOrder {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "url-asc" => Ok(Self::UrlAsc),
            "url-desc" => Ok(Self::UrlDesc),
            "title-asc" => Ok(Self::TitleAsc),
            "title-desc" => Ok(Self::TitleDesc),
            "status" => Ok(Self::Status),
            "insertion-asc" => Ok(Self::InsertionAsc),
            "insertion-desc" => Ok(Self::InsertionDesc),
            "sequence" => Ok(Self::Sequence),
            other => Err(crate::Error::validation(format!(
                "Unknown sort order: {other}"
            ))),
        }
    }
}

/// Order used for dispatch: priority tier first (highest first), then the
/// active sort order.
pub fn dispatch_order(order: SortOrder, a: &SortKey, b: &SortKey) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| order.compare(a, b))
}

/// Case-insensitive text comparison; empty or missing text sorts last.
fn compare_text(a: Option<&str>, b: Option<&str>) -> Ordering {
    let a = a.filter(|s| !s.trim().is_empty());
    let b = b.filter(|s| !s.trim().is_empty());
    match (a, b) {
        (Some(x), Some(y)) => x
            .to_lowercase()
            .cmp(&y.to_lowercase())
            .then_with(|| x.cmp(y)),
        (a, b) => compare_missing_last(a.map(|_| ()), b.map(|_| ())),
    }
}

fn compare_missing_last<T: Ord>(a: Option<T>, b: Option<T>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
