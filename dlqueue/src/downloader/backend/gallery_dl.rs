//! gallery-dl backend.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::config::ToolConfig;
use super::process_backend::{LineSignal, OutputParser, run_categories};
use super::traits::{ArtifactKind, AttemptContext, BackendAdapter, BackendKind, Category};
use crate::downloader::entry::DownloadStatus;
use crate::downloader::result::AttemptResult;

/// Gallery media is tracked under the primary category.
const SUPPORTED: &[Category] = &[Category::Video];

/// Exit status bit gallery-dl sets when no extractor matches the URL.
const NO_EXTRACTOR_EXIT_BIT: i32 = 64;

/// gallery-dl based backend.
pub struct GalleryDlBackend {
    config: ToolConfig,
    version: Option<String>,
}

impl GalleryDlBackend {
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
}

#[async_trait]
impl BackendAdapter for GalleryDlBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::GalleryDl
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
        run_categories(&ctx, BackendKind::GalleryDl, SUPPORTED, &GalleryDlOutput).await
    }
}

/// Classifier for gallery-dl output.
///
/// Downloaded files are printed as bare paths, files skipped because they
/// already exist are prefixed with `# `. Log records look like
/// `[extractor][level] message`.
pub struct GalleryDlOutput;

impl OutputParser for GalleryDlOutput {
    fn classify(&self, line: &str) -> LineSignal {
        let line = line.trim();
        let lower = line.to_lowercase();

        if lower.contains("[error]") {
            return if lower.contains("unsupported url") || lower.contains("no suitable extractor")
            {
                LineSignal::Unsupported
            } else {
                LineSignal::Error
            };
        }
        if line.starts_with('[') {
            return LineSignal::Phase(DownloadStatus::Preparing);
        }

        let candidate = line.strip_prefix("# ").unwrap_or(line);
        if looks_like_path(candidate) {
            return LineSignal::Artifact(ArtifactKind::File, PathBuf::from(candidate));
        }

        LineSignal::Noise
    }

    fn exit_code_means_unsupported(&self, code: i32) -> bool {
        code & NO_EXTRACTOR_EXIT_BIT != 0
    }
}

fn looks_like_path(line: &str) -> bool {
    let path = Path::new(line);
    path.is_absolute() || line.starts_with("./") || line.starts_with(".\\")
}
