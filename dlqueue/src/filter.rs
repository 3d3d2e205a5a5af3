//! URL filters: which backend handles a URL and how each tool is invoked.

use std::collections::BTreeSet;
use std::path::Path;

use url::Url;

use crate::downloader::backend::{BackendKind, BackendsConfig, Category};
use crate::process::ProcessSpec;

/// Maps URLs to backends and builds backend command lines.
pub trait FilterResolver: Send + Sync {
    /// The preferred backend for `url` that is not in `excluded`.
    fn resolve_backend(&self, url: &str, excluded: &BTreeSet<BackendKind>) -> Option<BackendKind>;

    /// Command line for one category of a process-backed download.
    ///
    /// `None` means the backend has no way to produce that category.
    fn build_arguments(
        &self,
        kind: BackendKind,
        category: Category,
        target_dir: &Path,
        url: &str,
    ) -> Option<ProcessSpec>;
}

/// Output template handed to yt-dlp.
const YT_DLP_OUTPUT_TEMPLATE: &str = "%(title)s [%(id)s].%(ext)s";
/// Output template handed to spotDL.
const SPOTDL_OUTPUT_TEMPLATE: &str = "{artists} - {title}.{output-ext}";

/// Resolver backed by the static backend configuration.
#[derive(Debug, Clone)]
pub struct StaticFilterCatalog {
    config: BackendsConfig,
}

impl StaticFilterCatalog {
    pub fn new(config: BackendsConfig) -> Self {
        Self { config }
    }

    fn claims(&self, kind: BackendKind, url: &Url) -> bool {
        if kind == BackendKind::DirectHttp && !matches!(url.scheme(), "http" | "https") {
            return false;
        }

        let hosts = self.config.hosts(kind);
        if hosts.is_empty() {
            return true;
        }

        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_lowercase();
        hosts.iter().any(|claimed| {
            let claimed = claimed.trim().to_lowercase();
            host == claimed || host.ends_with(&format!(".{claimed}"))
        })
    }
}

impl Default for StaticFilterCatalog {
    fn default() -> Self {
        Self::new(BackendsConfig::default())
    }
}

impl FilterResolver for StaticFilterCatalog {
    fn resolve_backend(&self, url: &str, excluded: &BTreeSet<BackendKind>) -> Option<BackendKind> {
        let parsed = Url::parse(url).ok()?;
        self.config
            .order
            .iter()
            .copied()
            .filter(|kind| !excluded.contains(kind))
            .filter(|kind| self.config.is_enabled(*kind))
            .find(|kind| self.claims(*kind, &parsed))
    }

    fn build_arguments(
        &self,
        kind: BackendKind,
        category: Category,
        target_dir: &Path,
        url: &str,
    ) -> Option<ProcessSpec> {
        let tool = self.config.tool(kind)?;
        let dir = target_dir.to_string_lossy().into_owned();

        let category_args: Vec<&str> = match (kind, category) {
            (BackendKind::YtDlp, Category::Video) => vec!["-f", "bv*+ba/b"],
            (BackendKind::YtDlp, Category::Audio) => vec!["-f", "ba/b", "-x"],
            (BackendKind::YtDlp, Category::Subtitles) => {
                vec!["--skip-download", "--write-subs", "--write-auto-subs"]
            }
            (BackendKind::YtDlp, Category::Thumbnails) => {
                vec!["--skip-download", "--write-thumbnail"]
            }
            (BackendKind::GalleryDl, Category::Video) => vec![],
            (BackendKind::SpotDl, Category::Audio) => vec![],
            _ => return None,
        };

        let spec = match kind {
            BackendKind::YtDlp => ProcessSpec::new(&tool.binary_path)
                .args(["--newline", "--no-colors", "-P", dir.as_str(), "-o", YT_DLP_OUTPUT_TEMPLATE])
                .args(category_args),
            BackendKind::GalleryDl => ProcessSpec::new(&tool.binary_path).args(["-d", dir.as_str()]),
            BackendKind::SpotDl => {
                let output = Path::new(&dir).join(SPOTDL_OUTPUT_TEMPLATE);
                ProcessSpec::new(&tool.binary_path)
                    .args(["download", url, "--output"])
                    .arg(output.to_string_lossy())
                    .args(tool.extra_args.iter().cloned())
                    .current_dir(target_dir)
            }
            BackendKind::DirectHttp => return None,
        };

        if kind == BackendKind::SpotDl {
            return Some(spec);
        }

        Some(
            spec.args(tool.extra_args.iter().cloned())
                .arg("--")
                .arg(url)
                .current_dir(target_dir),
        )
    }
}
