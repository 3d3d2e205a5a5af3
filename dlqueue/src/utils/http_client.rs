use std::{sync::OnceLock, time::Duration};

use tracing::{debug, warn};

use crate::downloader::backend::{DirectHttpConfig, ProxyConfig};
use crate::{Error, Result};

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Apply `proxy_config` to an existing `reqwest::ClientBuilder`.
///
/// - `enabled = false` disables all proxies, including env/system ones
/// - `enabled = true` with a `url` uses that proxy (optionally with auth)
/// - `enabled = true` without a `url` follows `use_system_proxy`
pub fn apply_proxy_config(
    mut builder: reqwest::ClientBuilder,
    proxy_config: &ProxyConfig,
) -> reqwest::ClientBuilder {
    if !proxy_config.enabled {
        return builder.no_proxy();
    }

    if let Some(url) = proxy_config.url.as_deref() {
        match reqwest::Proxy::all(url) {
            Ok(mut proxy) => {
                if let (Some(username), Some(password)) = (
                    proxy_config.username.as_ref(),
                    proxy_config.password.as_ref(),
                ) {
                    proxy = proxy.basic_auth(username, password);
                }
                builder = builder.proxy(proxy);
            }
            Err(error) => {
                warn!(
                    proxy_url = %url,
                    error = %error,
                    "Invalid proxy URL; disabling proxy"
                );
                builder = builder.no_proxy();
            }
        }
        return builder;
    }

    if proxy_config.use_system_proxy {
        return builder;
    }

    builder.no_proxy()
}

/// Build the client used for direct file transfers.
///
/// Only the connect timeout is bounded; transfers of large files may take
/// arbitrarily long and are cut short through cancellation instead.
pub fn build_download_client(config: &DirectHttpConfig) -> Result<reqwest::Client> {
    install_rustls_provider();

    let mut builder = reqwest::Client::builder()
        .user_agent(config.user_agent.as_str())
        .redirect(reqwest::redirect::Policy::limited(10));

    if config.connect_timeout_secs > 0 {
        builder = builder.connect_timeout(Duration::from_secs(config.connect_timeout_secs));
    }

    builder = apply_proxy_config(builder, &config.proxy);

    builder
        .build()
        .map_err(|e| Error::config(format!("Failed to build HTTP client: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_client_with_defaults() {
        let config = DirectHttpConfig::default();
        assert!(build_download_client(&config).is_ok());
    }

    #[test]
    fn test_invalid_proxy_url_falls_back_to_no_proxy() {
        let config = DirectHttpConfig {
            proxy: ProxyConfig {
                enabled: true,
                url: Some("::not a proxy::".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(build_download_client(&config).is_ok());
    }
}
