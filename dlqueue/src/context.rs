//! Application context.
//!
//! The AppContext holds every long-lived service and manages their
//! lifecycle. It is built once at startup and passed to whoever needs it.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::config::AppConfig;
use crate::downloader::backend::{BackendKind, default_backends};
use crate::downloader::{DownloadManager, DownloadStatus};
use crate::filter::StaticFilterCatalog;
use crate::metadata::YtDlpMetadataProvider;
use crate::persistence::{JsonFileStore, QueueStore};
use crate::postprocess::FilePostProcessor;
use crate::process::ProcessSupervisor;
use crate::utils::http_client::build_download_client;

/// Every service of a running instance.
pub struct AppContext {
    pub config: AppConfig,
    pub data_dir: PathBuf,
    pub supervisor: Arc<ProcessSupervisor>,
    pub store: Arc<dyn QueueStore>,
    pub download_manager: DownloadManager,
    /// Cancelled when the application should exit.
    cancellation_token: CancellationToken,
}

impl AppContext {
    /// Build every service from `config`. Nothing is started yet.
    pub async fn initialize(config: AppConfig) -> Result<Self> {
        info!("Initializing application context");
        config.validate()?;

        let data_dir = config.data_dir();
        let store: Arc<dyn QueueStore> = Arc::new(JsonFileStore::open(&data_dir).await?);
        let supervisor = Arc::new(ProcessSupervisor::new(config.supervisor.clone())?);

        let client = build_download_client(&config.backends.direct_http)?;
        let backends = default_backends(&config.backends, client, &supervisor).await;
        for backend in &backends {
            if backend.is_available() {
                info!(
                    backend = %backend.kind(),
                    version = backend.version().as_deref().unwrap_or("unknown"),
                    "Backend available"
                );
            } else {
                warn!(backend = %backend.kind(), "Backend not available");
            }
        }

        let mut builder = DownloadManager::builder(config.queue.clone())
            .backends(backends)
            .resolver(Arc::new(StaticFilterCatalog::new(config.backends.clone())))
            .store(Arc::clone(&store))
            .supervisor(Arc::clone(&supervisor))
            .post_processor(Arc::new(FilePostProcessor::new(
                config.postprocess.clone(),
                Arc::clone(&supervisor),
            )));
        if config.queue.query_metadata && config.backends.yt_dlp.enabled {
            builder = builder.metadata(Arc::new(YtDlpMetadataProvider::new(
                config.backends.yt_dlp.binary_path.clone(),
                Arc::clone(&supervisor),
            )));
        }
        let download_manager = builder.build()?;

        info!(data_dir = %data_dir.display(), "Application context initialized");

        Ok(Self {
            config,
            data_dir,
            supervisor,
            store,
            download_manager,
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Load the persisted queue and start dispatching.
    pub async fn start(&self) -> Result<()> {
        let restored = self.download_manager.restore().await?;
        self.download_manager.start();
        info!(restored, "Download manager started");
        Ok(())
    }

    /// Stop every service. Safe to call more than once.
    pub async fn shutdown(&self) {
        info!("Shutting down services");
        self.cancellation_token.cancel();
        self.download_manager.shutdown().await;
        info!("Services shut down");
    }

    /// Get the cancellation token for external use.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats::collect(&self.download_manager)
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub entries: usize,
    pub running: usize,
    pub queued: usize,
    pub complete: usize,
    pub failed: usize,
    pub blocked: bool,
    pub backends: Vec<BackendKind>,
}

impl QueueStats {
    pub fn collect(manager: &DownloadManager) -> Self {
        let entries = manager.snapshot();
        let count = |status: DownloadStatus| entries.iter().filter(|e| e.status == status).count();
        Self {
            entries: entries.len(),
            running: manager.running_count(),
            queued: count(DownloadStatus::Queued),
            complete: count(DownloadStatus::Complete),
            failed: count(DownloadStatus::Failed) + count(DownloadStatus::NoMethod),
            blocked: manager.is_blocked(),
            backends: manager.available_backends(),
        }
    }
}
