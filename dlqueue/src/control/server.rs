use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::ControlConfig;
use super::handler::ControlHandler;
use super::protocol::{ControlRequest, ControlResponse, ControlResult, MAX_REQUEST_LEN};
use crate::{Error, Result};

/// Loopback listener for control requests.
pub struct ControlServer {
    listener: TcpListener,
    timeout: Duration,
}

impl ControlServer {
    /// Bind `127.0.0.1:<port>`. Port 0 picks a free port.
    pub async fn bind(config: &ControlConfig) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, config.port))
            .await
            .map_err(|e| Error::Control(format!("cannot bind port {}: {e}", config.port)))?;
        Ok(Self {
            listener,
            timeout: config.timeout(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Answer requests until `cancel` fires.
    pub async fn serve(self, handler: Arc<dyn ControlHandler>, cancel: CancellationToken) {
        if let Ok(addr) = self.local_addr() {
            info!(%addr, "Control channel listening");
        }
        let connections = TaskTracker::new();

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept control connection");
                    continue;
                }
            };

            let handler = Arc::clone(&handler);
            let timeout = self.timeout;
            connections.spawn(async move {
                if let Err(e) = handle_connection(stream, handler, timeout).await {
                    debug!(%peer, error = %e, "Control connection failed");
                }
            });
        }

        connections.close();
        if tokio::time::timeout(self.timeout, connections.wait())
            .await
            .is_err()
        {
            warn!("Control connections still open at shutdown");
        }
        debug!("Control channel closed");
    }
}

async fn handle_connection(
    stream: TcpStream,
    handler: Arc<dyn ControlHandler>,
    timeout: Duration,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half.take(MAX_REQUEST_LEN));
    let mut line = String::new();

    let response = match tokio::time::timeout(timeout, reader.read_line(&mut line)).await {
        Err(_) => ControlResponse::new(ControlResult::Timeout, Some("No request received".into())),
        Ok(Err(e)) => ControlResponse::new(ControlResult::IoError, Some(e.to_string())),
        Ok(Ok(_)) => match ControlRequest::parse(&line) {
            Some(request) => {
                debug!(request = %request.to_line(), "Control request");
                handler.handle(request).await
            }
            None => ControlResponse::failed("Empty request"),
        },
    };

    let mut out = response.to_line()?;
    out.push('\n');
    write_half.write_all(out.as_bytes()).await?;
    write_half.shutdown().await?;
    Ok(())
}
