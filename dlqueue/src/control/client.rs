use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use super::protocol::{ControlRequest, ControlResponse, ControlResult};

/// Send one request to the instance listening on `port`.
///
/// Never fails: a refused connection is reported as
/// [`ControlResult::NotRunning`], a slow peer as [`ControlResult::Timeout`].
pub async fn send_request(
    port: u16,
    request: &ControlRequest,
    timeout: Duration,
) -> ControlResponse {
    match tokio::time::timeout(timeout, exchange(port, request)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) if is_not_running(e.kind()) => {
            debug!(port, "No instance is listening");
            ControlResponse::new(ControlResult::NotRunning, None)
        }
        Ok(Err(e)) => ControlResponse::new(ControlResult::IoError, Some(e.to_string())),
        Err(_) => ControlResponse::new(
            ControlResult::Timeout,
            Some(format!("No answer within {} ms", timeout.as_millis())),
        ),
    }
}

fn is_not_running(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset | ErrorKind::AddrNotAvailable
    )
}

async fn exchange(port: u16, request: &ControlRequest) -> std::io::Result<ControlResponse> {
    let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await?;
    let mut line = request.to_line();
    line.push('\n');
    stream.write_all(line.as_bytes()).await?;

    let mut reader = BufReader::new(stream);
    let mut response = String::new();
    reader.read_line(&mut response).await?;
    if response.trim().is_empty() {
        return Err(std::io::Error::new(
            ErrorKind::UnexpectedEof,
            "connection closed without a response",
        ));
    }
    ControlResponse::from_line(&response)
        .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e.to_string()))
}
