//! spotDL backend.

use std::path::PathBuf;

use async_trait::async_trait;

use super::config::ToolConfig;
use super::process_backend::{LineSignal, OutputParser, run_categories, unquote};
use super::traits::{ArtifactKind, AttemptContext, BackendAdapter, BackendKind, Category};
use crate::downloader::entry::DownloadStatus;
use crate::downloader::result::AttemptResult;

const SUPPORTED: &[Category] = &[Category::Audio];

/// spotDL based backend.
pub struct SpotDlBackend {
    config: ToolConfig,
    version: Option<String>,
}

impl SpotDlBackend {
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
impl BackendAdapter for SpotDlBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::SpotDl
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
        run_categories(&ctx, BackendKind::SpotDl, SUPPORTED, &SpotDlOutput).await
    }
}

/// Classifier for spotDL output.
pub struct SpotDlOutput;

impl OutputParser for SpotDlOutput {
    fn classify(&self, line: &str) -> LineSignal {
        let line = line.trim();
        let lower = line.to_lowercase();

        if lower.contains("invalid url")
            || lower.contains("is not a valid")
            || lower.contains("no results found")
            || lower.contains("queryerror")
        {
            return LineSignal::Unsupported;
        }
        if lower.starts_with("error") || lower.contains("exception") {
            return LineSignal::Error;
        }
        if let Some(rest) = line.strip_prefix("Skipping ")
            && let Some((path, _)) = rest.split_once(" (file already exists)")
        {
            return LineSignal::Artifact(ArtifactKind::File, PathBuf::from(unquote(path)));
        }
        if line.starts_with("Downloaded ") {
            return LineSignal::Phase(DownloadStatus::Processing);
        }
        if line.starts_with("Processing query") || line.starts_with("Found ") {
            return LineSignal::Phase(DownloadStatus::Preparing);
        }
        if lower.contains('%') {
            return LineSignal::Phase(DownloadStatus::Downloading);
        }

        LineSignal::Noise
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("Processing query: https://open.spotify.com/track/x", LineSignal::Phase(DownloadStatus::Preparing))]
    #[case("Found 12 songs in Some Album (Album)", LineSignal::Phase(DownloadStatus::Preparing))]
    #[case("Downloaded \"Artist - Song\": https://music.youtube.com/watch?v=x", LineSignal::Phase(DownloadStatus::Processing))]
    #[case("No results found for song: Artist - Song", LineSignal::Unsupported)]
    #[case("Error: something broke", LineSignal::Error)]
    #[case("Artist - Song  45%", LineSignal::Phase(DownloadStatus::Downloading))]
    fn test_classify(#[case] line: &str, #[case] expected: LineSignal) {
        assert_eq!(SpotDlOutput.classify(line), expected);
    }

    #[test]
    fn test_skipped_existing_file_is_artifact() {
        assert_eq!(
            SpotDlOutput.classify("Skipping /music/Artist - Song.mp3 (file already exists) (duplicate)"),
            LineSignal::Artifact(ArtifactKind::File, PathBuf::from("/music/Artist - Song.mp3"))
        );
    }
}
