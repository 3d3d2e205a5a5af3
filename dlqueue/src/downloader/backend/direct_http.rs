//! Direct HTTP(S) file transfer backend.
//!
//! Runs in-process on the shared HTTP client. A URL that answers with an HTML
//! page is a web page rather than a file, so it is reported as unsupported and
//! left to the other backends.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use url::Url;

use super::config::DirectHttpConfig;
use super::traits::{
    ArtifactKind, AttemptContext, BackendAdapter, BackendKind, Category, CategoryStatus,
};
use crate::downloader::entry::DownloadStatus;
use crate::downloader::result::AttemptResult;
use crate::utils::filename::{filename_from_disposition, filename_from_url};
use crate::utils::fs::{ensure_dir_all_with_op, remove_file_if_exists};

const SUPPORTED: &[Category] = &[Category::Video];

/// Suffix of files still being written.
const PARTIAL_SUFFIX: &str = ".part";

/// Plain HTTP download backend.
pub struct DirectHttpBackend {
    client: reqwest::Client,
    config: DirectHttpConfig,
}

impl DirectHttpBackend {
    pub fn new(client: reqwest::Client, config: DirectHttpConfig) -> Self {
        Self { client, config }
    }

    async fn transfer(&self, ctx: &AttemptContext, url: Url) -> AttemptResult {
        ctx.reporter.phase(DownloadStatus::Preparing);

        let response = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return AttemptResult::stopped(),
            response = self.client.get(url.clone()).send() => response,
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                debug!(entry_id = ctx.entry_id, error = %e, "HTTP request failed");
                return AttemptResult::failed().with_output(e.to_string());
            }
        };

        let status = response.status();
        if !status.is_success() {
            return AttemptResult::failed().with_output(format!("HTTP {status}"));
        }

        let is_page = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim().to_lowercase().starts_with("text/html"));
        if is_page {
            return AttemptResult::unsupported().with_output("URL points to a web page");
        }

        let file_name = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(filename_from_disposition)
            .or_else(|| filename_from_url(response.url()))
            .or_else(|| filename_from_url(&url))
            .unwrap_or_else(|| format!("download-{}", ctx.entry_id));

        let target = unused_path(&ctx.target_dir, &file_name).await;
        let partial = partial_path(&target);
        let total = response.content_length();

        let mut file = match tokio::fs::File::create(&partial).await {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %partial.display(), error = %e, "Cannot create output file");
                return AttemptResult::failed().with_output(e.to_string());
            }
        };

        ctx.reporter.phase(DownloadStatus::Downloading);
        let mut stream = response.bytes_stream();
        let mut received: u64 = 0;
        let mut last_percent: Option<u64> = None;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    drop(file);
                    discard(&partial).await;
                    return AttemptResult::stopped();
                }
                chunk = stream.next() => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    if let Err(e) = file.write_all(&bytes).await {
                        drop(file);
                        discard(&partial).await;
                        return AttemptResult::failed().with_output(e.to_string());
                    }
                    received += bytes.len() as u64;
                    if let Some(total) = total.filter(|t| *t > 0) {
                        let percent = received.saturating_mul(100) / total;
                        if last_percent != Some(percent) {
                            last_percent = Some(percent);
                            ctx.reporter
                                .output(&format!("[http] {percent}% of {total} bytes"));
                        }
                    }
                }
                Some(Err(e)) => {
                    drop(file);
                    discard(&partial).await;
                    return AttemptResult::failed().with_output(e.to_string());
                }
                None => break,
            }
        }

        if let Err(e) = file.flush().await {
            drop(file);
            discard(&partial).await;
            return AttemptResult::failed().with_output(e.to_string());
        }
        drop(file);

        if let Err(e) = tokio::fs::rename(&partial, &target).await {
            discard(&partial).await;
            return AttemptResult::failed().with_output(e.to_string());
        }

        debug!(entry_id = ctx.entry_id, path = %target.display(), bytes = received, "Direct download finished");
        ctx.reporter.artifact(ArtifactKind::File, target.clone());
        AttemptResult::success().with_output(format!("Saved {}", target.display()))
    }
}

#[async_trait]
impl BackendAdapter for DirectHttpBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::DirectHttp
    }

    fn supported_categories(&self) -> &'static [Category] {
        SUPPORTED
    }

    fn is_available(&self) -> bool {
        self.config.enabled
    }

    async fn run(&self, ctx: AttemptContext) -> AttemptResult {
        let url = match Url::parse(&ctx.url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => url,
            _ => return AttemptResult::unsupported(),
        };

        if let Err(e) = ensure_dir_all_with_op("creating output directory", &ctx.target_dir).await
        {
            return AttemptResult::failed().with_output(e.to_string());
        }

        let category = ctx
            .categories_for(SUPPORTED)
            .first()
            .copied()
            .unwrap_or(Category::Video);
        ctx.reporter.category(category, CategoryStatus::Running);

        let result = self.transfer(&ctx, url).await;
        let status = if result.flags.success {
            CategoryStatus::Done
        } else {
            CategoryStatus::Failed
        };
        ctx.reporter.category(category, status);
        if let Some(line) = &result.last_output {
            ctx.reporter.output(line);
        }
        result
    }
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// First of `name`, `name (1)`, `name (2)`... that does not exist yet.
async fn unused_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
        return candidate;
    }

    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };
    for n in 1u32.. {
        let numbered = match ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = dir.join(numbered);
        if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
    }
    candidate
}

async fn discard(partial: &Path) {
    if let Err(e) = remove_file_if_exists("removing partial download", partial).await {
        warn!(error = %e, "Failed to remove partial download");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/dl/file.zip")),
            PathBuf::from("/dl/file.zip.part")
        );
    }

    #[tokio::test]
    async fn test_unused_path_numbers_existing_files() {
        let temp = TempDir::new().unwrap();
        assert_eq!(
            unused_path(temp.path(), "a.zip").await,
            temp.path().join("a.zip")
        );

        std::fs::write(temp.path().join("a.zip"), b"x").unwrap();
        std::fs::write(temp.path().join("a (1).zip"), b"x").unwrap();
        assert_eq!(
            unused_path(temp.path(), "a.zip").await,
            temp.path().join("a (2).zip")
        );

        std::fs::write(temp.path().join("README"), b"x").unwrap();
        assert_eq!(
            unused_path(temp.path(), "README").await,
            temp.path().join("README (1)")
        );
    }
}
