//! Download backends.
//!
//! Each backend implements [`BackendAdapter`]. The process-backed tools share
//! one driver in [`process_backend`] and differ only in how they read their
//! own output.

mod config;
mod direct_http;
mod gallery_dl;
pub mod process_backend;
mod spotdl;
mod traits;
mod yt_dlp;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::process::{ProcessSpec, ProcessSupervisor};

pub use config::{BackendsConfig, DirectHttpConfig, ProxyConfig, ToolConfig};
pub use direct_http::DirectHttpBackend;
pub use gallery_dl::GalleryDlBackend;
pub use spotdl::SpotDlBackend;
pub use traits::{
    ArtifactKind, AttemptContext, AttemptReporter, BackendAdapter, BackendKind, Category,
    CategoryStatus, NullReporter,
};
pub use yt_dlp::YtDlpBackend;

/// How long a `--version` run may take before it is cancelled.
const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Stdout kept from a version run.
const VERSION_OUTPUT_LIMIT: usize = 4096;

/// Build every configured backend, detecting tool versions through `supervisor`.
pub async fn default_backends(
    config: &BackendsConfig,
    client: reqwest::Client,
    supervisor: &ProcessSupervisor,
) -> Vec<Arc<dyn BackendAdapter>> {
    let (yt_dlp, gallery_dl, spotdl) = futures::join!(
        tool_version(supervisor, &config.yt_dlp),
        tool_version(supervisor, &config.gallery_dl),
        tool_version(supervisor, &config.spotdl),
    );
    vec![
        Arc::new(YtDlpBackend::with_config(config.yt_dlp.clone()).with_version(yt_dlp)),
        Arc::new(GalleryDlBackend::with_config(config.gallery_dl.clone()).with_version(gallery_dl)),
        Arc::new(SpotDlBackend::with_config(config.spotdl.clone()).with_version(spotdl)),
        Arc::new(DirectHttpBackend::new(client, config.direct_http.clone())),
    ]
}

async fn tool_version(supervisor: &ProcessSupervisor, tool: &ToolConfig) -> Option<String> {
    if !tool.enabled {
        return None;
    }
    detect_version(supervisor, &tool.binary_path, "--version", VERSION_TIMEOUT).await
}

/// Run `<binary> <flag>` under `supervisor` and return the first line it
/// prints on stdout.
///
/// `None` when the tool cannot start, exits unsuccessfully, or does not finish
/// within `timeout`; a run that times out is cancelled.
pub async fn detect_version(
    supervisor: &ProcessSupervisor,
    binary: &str,
    flag: &str,
    timeout: Duration,
) -> Option<String> {
    let token = CancellationToken::new();
    let mut process = match supervisor.start(&ProcessSpec::new(binary).arg(flag), &token) {
        Ok(process) => process,
        Err(e) => {
            debug!(binary, error = %e, "Version check could not start");
            return None;
        }
    };

    let finished = tokio::time::timeout(timeout, async {
        let stdout = process.read_stdout(VERSION_OUTPUT_LIMIT).await.ok();
        (stdout, process.wait().await)
    })
    .await;

    match finished {
        Ok((Some(stdout), exit)) if exit.is_success() => String::from_utf8_lossy(&stdout)
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string),
        Ok((_, exit)) => {
            debug!(binary, ?exit, "Version check failed");
            None
        }
        Err(_) => {
            warn!(binary, timeout_ms = timeout.as_millis() as u64, "Version check timed out");
            token.cancel();
            supervisor.wake();
            process.wait().await;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::SupervisorConfig;

    fn supervisor() -> ProcessSupervisor {
        ProcessSupervisor::new(SupervisorConfig {
            poll_interval_ms: 20,
            graceful_timeout_ms: 300,
            forced_timeout_ms: 300,
            shutdown_timeout_ms: 2000,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_detect_version_of_missing_binary() {
        let supervisor = supervisor();
        let version = detect_version(
            &supervisor,
            "/nonexistent/tool-4711",
            "--version",
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(version, None);
        assert_eq!(supervisor.tracked_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_detect_version_reads_first_line() {
        let supervisor = supervisor();
        let version = detect_version(&supervisor, "echo", "2024.08.06", Duration::from_secs(5)).await;
        assert_eq!(version.as_deref(), Some("2024.08.06"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hanging_version_check_is_cancelled() {
        let supervisor = supervisor();
        let started = std::time::Instant::now();
        let version = detect_version(&supervisor, "sleep", "30", Duration::from_millis(200)).await;

        assert_eq!(version, None);
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
        assert_eq!(supervisor.tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_default_backends_cover_every_kind() {
        let config = BackendsConfig::default();
        let client = crate::utils::http_client::build_download_client(&config.direct_http).unwrap();
        let backends = default_backends(&config, client, &supervisor()).await;
        let kinds: Vec<BackendKind> = backends.iter().map(|b| b.kind()).collect();
        for kind in BackendKind::ALL {
            assert!(kinds.contains(&kind));
        }
    }
}
