//! Metadata lookup for freshly captured URLs.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::process::{ProcessExit, ProcessSpec, ProcessSupervisor};
use crate::{Error, Result};

/// Upper bound on the info JSON read from the tool.
const MAX_INFO_JSON_LEN: usize = 16 * 1024 * 1024;

/// What a metadata lookup found out about a URL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaMetadata {
    pub title: Option<String>,
    pub thumbnail_url: Option<String>,
    pub duration_secs: Option<f64>,
    /// Position inside a playlist, when the URL points into one.
    pub playlist_index: Option<u64>,
}

/// Looks up metadata for a URL before it is queued.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// `Ok(None)` means nothing is known; the entry is queued regardless.
    async fn query(&self, url: &str, cancel: &CancellationToken) -> Result<Option<MediaMetadata>>;
}

#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    title: Option<String>,
    thumbnail: Option<String>,
    duration: Option<f64>,
    playlist_index: Option<u64>,
}

/// Metadata provider that asks yt-dlp for the info JSON.
pub struct YtDlpMetadataProvider {
    binary_path: String,
    supervisor: Arc<ProcessSupervisor>,
}

impl YtDlpMetadataProvider {
    pub fn new(binary_path: impl Into<String>, supervisor: Arc<ProcessSupervisor>) -> Self {
        Self {
            binary_path: binary_path.into(),
            supervisor,
        }
    }
}

#[async_trait]
impl MetadataProvider for YtDlpMetadataProvider {
    async fn query(&self, url: &str, cancel: &CancellationToken) -> Result<Option<MediaMetadata>> {
        let spec = ProcessSpec::new(&self.binary_path).args([
            "--dump-single-json",
            "--skip-download",
            "--no-playlist",
            "--no-warnings",
            "--",
            url,
        ]);
        let mut process = self.supervisor.start(&spec, cancel)?;
        let stdout = process.read_stdout(MAX_INFO_JSON_LEN).await?;
        let metadata = if stdout.len() < MAX_INFO_JSON_LEN {
            parse_info_json(&String::from_utf8_lossy(&stdout))
        } else {
            debug!(%url, limit = MAX_INFO_JSON_LEN, "Info JSON too large, ignoring it");
            None
        };

        match process.wait().await {
            _ if cancel.is_cancelled() => Err(Error::Cancelled),
            ProcessExit::Exited(Some(0)) => Ok(metadata),
            exit => {
                debug!(%url, ?exit, "Metadata lookup failed");
                Ok(None)
            }
        }
    }
}

/// Parse yt-dlp's info JSON.
pub fn parse_info_json(text: &str) -> Option<MediaMetadata> {
    let info: YtDlpInfo = serde_json::from_str(text.trim()).ok()?;
    Some(MediaMetadata {
        title: info.title.filter(|t| !t.trim().is_empty()),
        thumbnail_url: info.thumbnail,
        duration_secs: info.duration,
        playlist_index: info.playlist_index,
    })
}
