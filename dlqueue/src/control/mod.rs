//! Loopback control channel.
//!
//! A second invocation of the binary connects to the running instance on a
//! fixed local port, sends one request line and reads one JSON response line.
//! This keeps two instances from working on the same persisted queue.

mod client;
mod handler;
mod protocol;
mod server;

use serde::{Deserialize, Serialize};

pub use client::send_request;
pub use handler::{AppControlHandler, ControlHandler};
pub use protocol::{
    ControlCommand, ControlMessage, ControlRequest, ControlResponse, ControlResult,
    PROTOCOL_VERSION,
};
pub use server::ControlServer;

/// Default control port.
pub const DEFAULT_CONTROL_PORT: u16 = 49159;

/// `[control]` section of the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Listen for control requests while running.
    pub enabled: bool,
    /// Loopback port.
    pub port: u16,
    /// Connect and read timeout, for both sides.
    pub timeout_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: DEFAULT_CONTROL_PORT,
            timeout_ms: 3000,
        }
    }
}

impl ControlConfig {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }
}
