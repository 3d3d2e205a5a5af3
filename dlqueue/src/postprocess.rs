//! Post-processing stages run after a successful download.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::downloader::QueueEntry;
use crate::process::{ProcessSpec, ProcessSupervisor};
use crate::utils::fs::{io_error, remove_file_if_exists};
use crate::{Error, Result};

const DIGEST_CHUNK: usize = 64 * 1024;

/// Post-processing settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessConfig {
    /// Path to the ffmpeg binary used for transcoding.
    pub ffmpeg_path: String,
    /// Container/extension files are converted to, e.g. `mp4`.
    pub transcode_format: Option<String>,
    /// Extra ffmpeg arguments placed between input and output.
    pub transcode_args: Vec<String>,
    /// Delete the source file after a successful conversion.
    pub delete_source: bool,
}

impl Default for PostProcessConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            transcode_format: None,
            transcode_args: Vec::new(),
            delete_source: false,
        }
    }
}

/// Stages run between `PostProcessing` and `Complete`.
#[async_trait]
pub trait PostProcessor: Send + Sync {
    /// Remove duplicate artifacts. Returns the removed paths.
    async fn deduplicate(&self, entry: &QueueEntry) -> Result<Vec<PathBuf>>;

    /// Convert artifacts. Returns the files produced.
    async fn transcode(&self, entry: &QueueEntry, cancel: &CancellationToken)
    -> Result<Vec<PathBuf>>;
}

/// Post-processor that does nothing.
pub struct NoopPostProcessor;

#[async_trait]
impl PostProcessor for NoopPostProcessor {
    async fn deduplicate(&self, _entry: &QueueEntry) -> Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }

    async fn transcode(
        &self,
        _entry: &QueueEntry,
        _cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }
}

/// Content-based deduplication plus ffmpeg transcoding.
pub struct FilePostProcessor {
    config: PostProcessConfig,
    supervisor: Arc<ProcessSupervisor>,
}

impl FilePostProcessor {
    pub fn new(config: PostProcessConfig, supervisor: Arc<ProcessSupervisor>) -> Self {
        Self { config, supervisor }
    }

    fn transcode_spec(&self, input: &Path, output: &Path) -> ProcessSpec {
        ProcessSpec::new(&self.config.ffmpeg_path)
            .args(["-hide_banner", "-nostdin", "-loglevel", "error", "-y", "-i"])
            .arg(input.to_string_lossy())
            .args(self.config.transcode_args.iter().cloned())
            .arg(output.to_string_lossy())
    }
}

#[async_trait]
impl PostProcessor for FilePostProcessor {
    async fn deduplicate(&self, entry: &QueueEntry) -> Result<Vec<PathBuf>> {
        let files: Vec<PathBuf> = entry.artifacts.present_files().cloned().collect();
        let duplicates = find_duplicates(&files).await?;
        for path in &duplicates {
            remove_file_if_exists("removing duplicate file", path).await?;
            debug!(entry_id = entry.id, path = %path.display(), "Removed duplicate file");
        }
        Ok(duplicates)
    }

    async fn transcode(
        &self,
        entry: &QueueEntry,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>> {
        let Some(format) = self.config.transcode_format.as_deref() else {
            return Ok(Vec::new());
        };
        let format = format.trim_start_matches('.').to_lowercase();

        let mut produced = Vec::new();
        for input in entry.artifacts.present_files() {
            let same_format = input
                .extension()
                .is_some_and(|ext| ext.to_string_lossy().to_lowercase() == format);
            if same_format || !tokio::fs::try_exists(input).await.unwrap_or(false) {
                continue;
            }

            let output = input.with_extension(&format);
            let process = self
                .supervisor
                .start_silent(&self.transcode_spec(input, &output), cancel)?;
            let exit = process.wait().await;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if !exit.is_success() {
                remove_file_if_exists("removing failed transcode", &output).await?;
                return Err(Error::Other(format!(
                    "Transcoding {} failed ({exit:?})",
                    input.display()
                )));
            }

            info!(entry_id = entry.id, input = %input.display(), output = %output.display(), "Transcoded file");
            if self.config.delete_source
                && let Err(e) = remove_file_if_exists("removing transcode source", input).await
            {
                warn!(error = %e, "Failed to remove transcode source");
            }
            produced.push(output);
        }
        Ok(produced)
    }
}

/// Files in `paths` whose content equals an earlier file in the list.
async fn find_duplicates(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut seen: HashMap<(u64, [u8; 32]), PathBuf> = HashMap::new();
    let mut visited = HashSet::new();
    let mut duplicates = Vec::new();

    for path in paths {
        if !visited.insert(path.clone()) {
            continue;
        }
        let Ok(meta) = tokio::fs::metadata(path).await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let digest = content_digest(path).await?;
        match seen.entry((meta.len(), digest)) {
            Entry::Occupied(original) => {
                debug!(
                    path = %path.display(),
                    original = %original.get().display(),
                    sha256 = %hex::encode(digest),
                    "Found duplicate file"
                );
                duplicates.push(path.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(path.clone());
            }
        }
    }
    Ok(duplicates)
}

/// SHA-256 of the file at `path`, read in fixed-size chunks.
async fn content_digest(path: &Path) -> Result<[u8; 32]> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| io_error("opening file for deduplication", path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; DIGEST_CHUNK];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| io_error("reading file for deduplication", path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&hasher.finalize());
    Ok(digest)
}
