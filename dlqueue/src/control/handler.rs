use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::protocol::{ControlCommand, ControlRequest, ControlResponse};
use crate::context::QueueStats;
use crate::downloader::DownloadManager;
use crate::logging::LoggingConfig;

/// Answers control requests.
#[async_trait]
pub trait ControlHandler: Send + Sync {
    async fn handle(&self, request: ControlRequest) -> ControlResponse;
}

/// Handler of a running instance.
pub struct AppControlHandler {
    manager: DownloadManager,
    shutdown: CancellationToken,
    logging: Option<Arc<LoggingConfig>>,
}

impl AppControlHandler {
    /// `shutdown` is cancelled when a `shutdown` request arrives.
    pub fn new(manager: DownloadManager, shutdown: CancellationToken) -> Self {
        Self {
            manager,
            shutdown,
            logging: None,
        }
    }

    pub fn with_logging(mut self, logging: Arc<LoggingConfig>) -> Self {
        self.logging = Some(logging);
        self
    }
}

#[async_trait]
impl ControlHandler for AppControlHandler {
    async fn handle(&self, request: ControlRequest) -> ControlResponse {
        let Some(command) = request.command() else {
            return ControlResponse::unhandled(&request.command);
        };

        match command {
            ControlCommand::WakeUp => {
                info!("Another instance asked this one to take over");
                self.manager.wake();
                ControlResponse::success("dlqueue is running")
            }
            ControlCommand::Shutdown => {
                info!("Shutdown requested over the control channel");
                self.shutdown.cancel();
                ControlResponse::success("Shutting down")
            }
            ControlCommand::Status => {
                let stats = QueueStats::collect(&self.manager);
                match serde_json::to_string(&stats) {
                    Ok(json) => ControlResponse::success(json),
                    Err(e) => ControlResponse::failed(e.to_string()),
                }
            }
            ControlCommand::Enqueue(url) => match self.manager.enqueue(&url, false).await {
                Ok(true) => ControlResponse::success(format!("Queued {url}")),
                Ok(false) => ControlResponse::failed(format!("Not queued: {url}")),
                Err(e) => ControlResponse::failed(e.to_string()),
            },
            ControlCommand::LogFilter(directive) => match &self.logging {
                Some(logging) => match logging.set_filter(&directive) {
                    Ok(()) => ControlResponse::success(logging.get_filter()),
                    Err(e) => ControlResponse::failed(e.to_string()),
                },
                None => ControlResponse::failed("Logging is not reloadable"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlResult;
    use crate::downloader::DownloadManagerConfig;

    fn handler() -> (AppControlHandler, CancellationToken) {
        let manager = DownloadManager::builder(DownloadManagerConfig {
            download_dir: std::env::temp_dir(),
            ..Default::default()
        })
        .build()
        .unwrap();
        let token = CancellationToken::new();
        (AppControlHandler::new(manager, token.clone()), token)
    }

    #[tokio::test]
    async fn test_shutdown_cancels_token() {
        let (handler, token) = handler();
        let response = handler.handle(ControlRequest::new("shutdown")).await;
        assert!(response.is_success());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_unknown_command_is_unhandled() {
        let (handler, token) = handler();
        let response = handler.handle(ControlRequest::new("reboot")).await;
        assert_eq!(response.result, ControlResult::Unhandled);
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_enqueue_and_status() {
        let (handler, _) = handler();
        let response = handler
            .handle(ControlRequest::with_params("enqueue", "https://example.com/v"))
            .await;
        assert!(response.is_success());

        let response = handler.handle(ControlRequest::new("status")).await;
        let stats: serde_json::Value =
            serde_json::from_str(response.message.as_deref().unwrap()).unwrap();
        assert_eq!(stats["entries"], 1);
        assert_eq!(stats["queued"], 1);
    }

    #[tokio::test]
    async fn test_log_filter_without_logging_fails() {
        let (handler, _) = handler();
        let response = handler
            .handle(ControlRequest::with_params("log-filter", "dlqueue=debug"))
            .await;
        assert_eq!(response.result, ControlResult::Failed);
    }
}
