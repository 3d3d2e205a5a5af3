//! Backend configuration.

use serde::{Deserialize, Serialize};

use super::traits::BackendKind;

/// Configuration shared by the process-backed tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Whether the backend takes part in resolution.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Path to the tool binary.
    pub binary_path: String,
    /// Additional arguments placed before the URL.
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Hosts this tool claims. Empty means every host.
    #[serde(default)]
    pub hosts: Vec<String>,
}

impl ToolConfig {
    fn with_binary(binary_path: &str, hosts: &[&str]) -> Self {
        Self {
            enabled: true,
            binary_path: binary_path.to_string(),
            extra_args: Vec::new(),
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
        }
    }
}

/// Proxy settings for in-process HTTP transfers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_true")]
    pub use_system_proxy: bool,
}

/// Direct HTTP backend configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectHttpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Hosts this backend claims. Empty means every host.
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Connect timeout in seconds (0 = none).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub proxy: ProxyConfig,
}

fn default_true() -> bool {
    true
}

fn default_user_agent() -> String {
    format!("dlqueue/{}", env!("CARGO_PKG_VERSION"))
}

fn default_connect_timeout() -> u64 {
    30
}

impl Default for DirectHttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hosts: Vec::new(),
            user_agent: default_user_agent(),
            connect_timeout_secs: default_connect_timeout(),
            proxy: ProxyConfig {
                use_system_proxy: true,
                ..Default::default()
            },
        }
    }
}

/// Configuration of every backend plus their resolution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendsConfig {
    /// Order in which backends are tried for a URL.
    pub order: Vec<BackendKind>,
    pub yt_dlp: ToolConfig,
    pub gallery_dl: ToolConfig,
    pub spotdl: ToolConfig,
    pub direct_http: DirectHttpConfig,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            order: vec![
                BackendKind::SpotDl,
                BackendKind::GalleryDl,
                BackendKind::YtDlp,
                BackendKind::DirectHttp,
            ],
            yt_dlp: ToolConfig::with_binary("yt-dlp", &[]),
            gallery_dl: ToolConfig::with_binary(
                "gallery-dl",
                &[
                    "deviantart.com",
                    "pixiv.net",
                    "imgur.com",
                    "flickr.com",
                    "artstation.com",
                    "danbooru.donmai.us",
                ],
            ),
            spotdl: ToolConfig::with_binary("spotdl", &["open.spotify.com"]),
            direct_http: DirectHttpConfig::default(),
        }
    }
}

impl BackendsConfig {
    pub fn tool(&self, kind: BackendKind) -> Option<&ToolConfig> {
        match kind {
            BackendKind::YtDlp => Some(&self.yt_dlp),
            BackendKind::GalleryDl => Some(&self.gallery_dl),
            BackendKind::SpotDl => Some(&self.spotdl),
            BackendKind::DirectHttp => None,
        }
    }

    pub fn is_enabled(&self, kind: BackendKind) -> bool {
        match kind {
            BackendKind::DirectHttp => self.direct_http.enabled,
            other => self.tool(other).is_some_and(|t| t.enabled),
        }
    }

    pub fn hosts(&self, kind: BackendKind) -> &[String] {
        match kind {
            BackendKind::DirectHttp => &self.direct_http.hosts,
            other => self.tool(other).map(|t| t.hosts.as_slice()).unwrap_or(&[]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_claim_expected_hosts() {
        let config = BackendsConfig::default();
        assert!(config.hosts(BackendKind::YtDlp).is_empty());
        assert_eq!(config.hosts(BackendKind::SpotDl), ["open.spotify.com"]);
        assert!(BackendKind::ALL.iter().all(|k| config.is_enabled(*k)));
        assert_eq!(config.order.len(), 4);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: BackendsConfig = toml::from_str(
            r#"
            [yt_dlp]
            binary_path = "/opt/yt-dlp"
            extra_args = ["--no-mtime"]
            "#,
        )
        .unwrap();
        assert_eq!(config.yt_dlp.binary_path, "/opt/yt-dlp");
        assert!(config.yt_dlp.enabled);
        assert_eq!(config.spotdl.binary_path, "spotdl");
        assert!(config.direct_http.proxy.use_system_proxy);
    }
}
