//! Control channel wire format.
//!
//! Request: one line, `command` or `command=params`.
//! Response: one JSON line tagged by `kind`.

use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

/// Longest request line accepted, in bytes.
pub(crate) const MAX_REQUEST_LEN: u64 = 8 * 1024;

/// A raw request line split into command and parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub command: String,
    pub params: Option<String>,
}

impl ControlRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            params: None,
        }
    }

    pub fn with_params(command: impl Into<String>, params: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            params: Some(params.into()),
        }
    }

    /// Parse a request line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let request = match line.split_once('=') {
            Some((command, params)) => Self {
                command: command.trim().to_string(),
                params: Some(params.to_string()),
            },
            None => Self::new(line),
        };
        (!request.command.is_empty()).then_some(request)
    }

    /// Encode as a request line without the trailing newline.
    pub fn to_line(&self) -> String {
        match &self.params {
            Some(params) => format!("{}={}", self.command, params),
            None => self.command.clone(),
        }
    }

    /// Interpret the request. Unknown commands yield `None`.
    pub fn command(&self) -> Option<ControlCommand> {
        let params = self.params.as_deref().map(str::trim).filter(|p| !p.is_empty());
        match (self.command.to_lowercase().as_str(), params) {
            ("wake-up", _) => Some(ControlCommand::WakeUp),
            ("shutdown", _) => Some(ControlCommand::Shutdown),
            ("status", _) => Some(ControlCommand::Status),
            ("enqueue", Some(url)) => Some(ControlCommand::Enqueue(url.to_string())),
            ("log-filter", Some(directive)) => Some(ControlCommand::LogFilter(directive.to_string())),
            _ => None,
        }
    }
}

/// Commands the running instance understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Another invocation started; the running instance takes over.
    WakeUp,
    Shutdown,
    /// Queue statistics as JSON.
    Status,
    /// Add a URL to the running instance's queue.
    Enqueue(String),
    /// Replace the log filter directive.
    LogFilter(String),
}

/// Outcome of a control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlResult {
    Success,
    Failed,
    /// The command is not known to the receiver.
    Unhandled,
    Timeout,
    /// Nothing is listening on the control port.
    NotRunning,
    IoError,
}

/// Body of a response message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub protocol_version: u32,
    pub result: ControlResult,
    #[serde(default)]
    pub message: Option<String>,
}

impl ControlResponse {
    pub fn new(result: ControlResult, message: Option<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            result,
            message,
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(ControlResult::Success, Some(message.into()))
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ControlResult::Failed, Some(message.into()))
    }

    pub fn unhandled(command: &str) -> Self {
        Self::new(
            ControlResult::Unhandled,
            Some(format!("Unknown command: {command}")),
        )
    }

    pub fn is_success(&self) -> bool {
        self.result == ControlResult::Success
    }

    /// Encode as a single JSON line without the trailing newline.
    pub fn to_line(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(&ControlMessage::Response(self.clone()))?)
    }

    /// Decode a response line.
    pub fn from_line(line: &str) -> crate::Result<Self> {
        match serde_json::from_str::<ControlMessage>(line.trim())? {
            ControlMessage::Response(response) => Ok(response),
        }
    }
}

/// Every message the server sends, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ControlMessage {
    Response(ControlResponse),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("wake-up", Some(ControlCommand::WakeUp))]
    #[case("  shutdown \n", Some(ControlCommand::Shutdown))]
    #[case("WAKE-UP", Some(ControlCommand::WakeUp))]
    #[case("status", Some(ControlCommand::Status))]
    #[case(
        "enqueue=https://example.com/v?a=1",
        Some(ControlCommand::Enqueue("https://example.com/v?a=1".to_string()))
    )]
    #[case("enqueue=", None)]
    #[case("enqueue", None)]
    #[case("log-filter=dlqueue=debug", Some(ControlCommand::LogFilter("dlqueue=debug".to_string())))]
    #[case("dance", None)]
    fn test_command(#[case] line: &str, #[case] expected: Option<ControlCommand>) {
        let request = ControlRequest::parse(line).unwrap();
        assert_eq!(request.command(), expected);
    }

    #[test]
    fn test_parse_splits_on_first_equals() {
        let request = ControlRequest::parse("log-filter=a=debug,b=info").unwrap();
        assert_eq!(request.command, "log-filter");
        assert_eq!(request.params.as_deref(), Some("a=debug,b=info"));
        assert_eq!(request.to_line(), "log-filter=a=debug,b=info");
    }

    #[test]
    fn test_blank_request() {
        assert_eq!(ControlRequest::parse(""), None);
        assert_eq!(ControlRequest::parse("   "), None);
        assert_eq!(ControlRequest::parse("=x"), None);
    }

    #[test]
    fn test_response_wire_format() {
        let line = ControlResponse::success("ok").to_line().unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["kind"], "response");
        assert_eq!(value["protocol_version"], 1);
        assert_eq!(value["result"], "success");
        assert_eq!(value["message"], "ok");

        let not_running = ControlResponse::new(ControlResult::NotRunning, None);
        let value: serde_json::Value =
            serde_json::from_str(&not_running.to_line().unwrap()).unwrap();
        assert_eq!(value["result"], "not-running");
    }

    #[test]
    fn test_response_from_line() {
        let response = ControlResponse::from_line(
            r#"{"kind":"response","protocol_version":1,"result":"io-error"}"#,
        )
        .unwrap();
        assert_eq!(response.result, ControlResult::IoError);
        assert_eq!(response.message, None);
        assert!(ControlResponse::from_line(r#"{"kind":"other"}"#).is_err());
    }
}
