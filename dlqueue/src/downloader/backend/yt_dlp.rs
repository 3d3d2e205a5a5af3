//! yt-dlp backend.

use std::path::PathBuf;

use async_trait::async_trait;

use super::config::ToolConfig;
use super::process_backend::{LineSignal, OutputParser, run_categories, unquote};
use super::traits::{ArtifactKind, AttemptContext, BackendAdapter, BackendKind, Category};
use crate::downloader::entry::DownloadStatus;
use crate::downloader::result::AttemptResult;

const SUPPORTED: &[Category] = &[
    Category::Video,
    Category::Audio,
    Category::Subtitles,
    Category::Thumbnails,
];

/// yt-dlp based backend.
pub struct YtDlpBackend {
    config: ToolConfig,
    version: Option<String>,
}

impl YtDlpBackend {
    /// Backend without a detected version; unavailable until one is set.
    pub fn with_config(config: ToolConfig) -> Self {
        Self {
            config,
            version: None,
        }
    }

    pub fn with_version(mut self, version: Option<String>) -> Self {
        self.version = version;
        self
    }

    pub fn config(&self) -> &ToolConfig {
        &self.config
    }
}

#[async_trait]
impl BackendAdapter for YtDlpBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::YtDlp
    }

    fn supported_categories(&self) -> &'static [Category] {
        SUPPORTED
    }

    fn is_available(&self) -> bool {
        self.config.enabled && self.version.is_some()
    }

    fn version(&self) -> Option<String> {
        self.version.clone()
    }

    async fn run(&self, ctx: AttemptContext) -> AttemptResult {
        run_categories(&ctx, BackendKind::YtDlp, SUPPORTED, &YtDlpOutput).await
    }
}

/// Classifier for yt-dlp's `--newline` output.
pub struct YtDlpOutput;

impl OutputParser for YtDlpOutput {
    fn classify(&self, line: &str) -> LineSignal {
        let line = line.trim();

        if let Some(rest) = line.strip_prefix("ERROR:") {
            return if is_unsupported_error(rest) {
                LineSignal::Unsupported
            } else {
                LineSignal::Error
            };
        }

        if let Some(path) = line.strip_prefix("[download] Destination:") {
            return artifact(ArtifactKind::File, path);
        }
        if let Some(rest) = line.strip_prefix("[download] ")
            && let Some(path) = rest.strip_suffix(" has already been downloaded")
        {
            return artifact(ArtifactKind::File, path);
        }
        if let Some(path) = line.strip_prefix("[Merger] Merging formats into") {
            return artifact(ArtifactKind::File, path);
        }
        if let Some(path) = line.strip_prefix("[ExtractAudio] Destination:") {
            return artifact(ArtifactKind::File, path);
        }
        if line.starts_with("[info] Writing video thumbnail")
            && let Some((_, path)) = line.split_once(" to: ")
        {
            return artifact(ArtifactKind::Thumbnail, path);
        }
        if line.starts_with("[info] Writing video subtitles")
            && let Some((_, path)) = line.split_once(" to: ")
        {
            return artifact(ArtifactKind::File, path);
        }

        if line.starts_with("[download]") && line.contains('%') {
            return LineSignal::Phase(DownloadStatus::Downloading);
        }
        if line.starts_with("[Merger]")
            || line.starts_with("[ExtractAudio]")
            || line.starts_with("[FixupM3u8]")
            || line.starts_with("[VideoConvertor]")
        {
            return LineSignal::Phase(DownloadStatus::Processing);
        }
        if line.starts_with('[') {
            return LineSignal::Phase(DownloadStatus::Preparing);
        }

        LineSignal::Noise
    }
}

fn is_unsupported_error(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("unsupported url") || message.contains("is not a valid url")
}

fn artifact(kind: ArtifactKind, path: &str) -> LineSignal {
    let path = unquote(path);
    if path.is_empty() {
        return LineSignal::Noise;
    }
    LineSignal::Artifact(kind, PathBuf::from(path))
}
