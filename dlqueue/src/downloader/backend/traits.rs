//! Backend adapter trait and related types.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::downloader::entry::DownloadStatus;
use crate::downloader::result::AttemptResult;
use crate::filter::FilterResolver;
use crate::process::ProcessSupervisor;

/// Type of download backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// yt-dlp, the general purpose video extractor.
    YtDlp,
    /// gallery-dl for image galleries.
    GalleryDl,
    /// spotDL for music services.
    SpotDl,
    /// Plain HTTP(S) file transfer.
    DirectHttp,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [Self::YtDlp, Self::GalleryDl, Self::SpotDl, Self::DirectHttp];

    /// Get the backend kind from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "yt-dlp" | "ytdlp" => Some(Self::YtDlp),
            "gallery-dl" | "gallerydl" => Some(Self::GalleryDl),
            "spotdl" | "spot-dl" => Some(Self::SpotDl),
            "direct-http" | "http" => Some(Self::DirectHttp),
            _ => None,
        }
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::YtDlp => "yt-dlp",
            Self::GalleryDl => "gallery-dl",
            Self::SpotDl => "spotdl",
            Self::DirectHttp => "direct-http",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of output a download can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Video,
    Audio,
    Subtitles,
    Thumbnails,
}

impl Category {
    /// The primary category among `enabled`: video if enabled, else audio.
    ///
    /// Falls back to the first enabled category when neither is selected.
    pub fn primary(enabled: &[Category]) -> Option<Category> {
        if enabled.contains(&Category::Video) {
            Some(Category::Video)
        } else if enabled.contains(&Category::Audio) {
            Some(Category::Audio)
        } else {
            enabled.first().copied()
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Subtitles => "subtitles",
            Self::Thumbnails => "thumbnails",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of a single category within an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CategoryStatus {
    Running,
    Done,
    Failed,
    Skipped,
}

/// Where an artifact path is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    File,
    Thumbnail,
    Log,
}

/// Receives progress from a running attempt.
///
/// Reports from an attempt that has been cancelled or superseded are dropped
/// by the receiver.
pub trait AttemptReporter: Send + Sync {
    /// Backend moved to a new in-attempt phase.
    fn phase(&self, status: DownloadStatus);
    /// A line of backend output.
    fn output(&self, line: &str);
    fn category(&self, category: Category, status: CategoryStatus);
    fn artifact(&self, kind: ArtifactKind, path: PathBuf);
}

/// Reporter that ignores everything.
pub struct NullReporter;

impl AttemptReporter for NullReporter {
    fn phase(&self, _status: DownloadStatus) {}
    fn output(&self, _line: &str) {}
    fn category(&self, _category: Category, _status: CategoryStatus) {}
    fn artifact(&self, _kind: ArtifactKind, _path: PathBuf) {}
}

/// Everything a backend needs for one attempt.
#[derive(Clone)]
pub struct AttemptContext {
    pub entry_id: u64,
    pub url: String,
    pub target_dir: PathBuf,
    /// Enabled categories, primary first.
    pub categories: Vec<Category>,
    pub cancel: CancellationToken,
    pub supervisor: Arc<ProcessSupervisor>,
    pub resolver: Arc<dyn FilterResolver>,
    pub reporter: Arc<dyn AttemptReporter>,
}

impl AttemptContext {
    /// Enabled categories this backend supports, primary first.
    pub fn categories_for(&self, supported: &[Category]) -> Vec<Category> {
        let enabled: Vec<Category> = self
            .categories
            .iter()
            .copied()
            .filter(|c| supported.contains(c))
            .collect();

        let primary = Category::primary(&enabled);
        let mut ordered: Vec<Category> = primary.into_iter().collect();
        ordered.extend(enabled.into_iter().filter(|c| Some(*c) != primary));

        // a backend with a single fixed output still runs when nothing it
        // supports is enabled
        if ordered.is_empty()
            && let Some(first) = supported.first()
        {
            ordered.push(*first);
        }
        ordered
    }
}

/// Trait implemented by all download backends.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Get the backend kind.
    fn kind(&self) -> BackendKind;

    /// Categories this backend can produce, primary first.
    fn supported_categories(&self) -> &'static [Category];

    /// Check if the backend can run (e.g., binary exists).
    fn is_available(&self) -> bool;

    /// Get the backend version string.
    fn version(&self) -> Option<String> {
        None
    }

    /// Run one download attempt to completion.
    ///
    /// Must return promptly once `ctx.cancel` fires, with the stopped flag set.
    async fn run(&self, ctx: AttemptContext) -> AttemptResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_from_str() {
        assert_eq!(BackendKind::from_str("yt-dlp"), Some(BackendKind::YtDlp));
        assert_eq!(BackendKind::from_str("YTDLP"), Some(BackendKind::YtDlp));
        assert_eq!(BackendKind::from_str("gallery-dl"), Some(BackendKind::GalleryDl));
        assert_eq!(BackendKind::from_str("spotdl"), Some(BackendKind::SpotDl));
        assert_eq!(BackendKind::from_str("http"), Some(BackendKind::DirectHttp));
        assert_eq!(BackendKind::from_str("wget"), None);
        for kind in BackendKind::ALL {
            assert_eq!(BackendKind::from_str(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_primary_category() {
        use Category::*;
        assert_eq!(Category::primary(&[Audio, Video]), Some(Video));
        assert_eq!(Category::primary(&[Subtitles, Audio]), Some(Audio));
        assert_eq!(Category::primary(&[Thumbnails]), Some(Thumbnails));
        assert_eq!(Category::primary(&[]), None);
    }
}
