// Creates HTTP clients with proxy, timeout, and TLS configuration.

use crate::constants::variables;
use anyhow::Result;
use quarry_sdk::{build_constants, AgentWebProxy, StringUtil};
use reqwest::Client;
use std::time::Duration;

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 100;
/// Maximum allowed request timeout in seconds.
const MAX_TIMEOUT_SECS: u64 = 1200;

/// Creates properly configured HTTP clients for the agent.
pub struct HttpClientFactory;

impl HttpClientFactory {
    /// Create a new `reqwest::Client` configured with proxy and TLS settings.
    ///
    /// - If `QUARRY_AGENT_TLS_NO_VERIFY` is set, TLS certificate
    ///   verification is disabled (dangerous!).
    /// - HTTP and HTTPS proxy settings are read from the `AgentWebProxy`.
    /// - The request timeout comes from `QUARRY_AGENT_HTTP_TIMEOUT`,
    ///   clamped to `[100, 1200]` seconds.
    pub fn create_client(web_proxy: &AgentWebProxy) -> Result<Client> {
        let mut builder = Client::builder()
            .timeout(Self::request_timeout())
            .connect_timeout(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(60));

        // Configure proxy
        if let Some(ref http_proxy) = web_proxy.http_proxy_address {
            let mut proxy = reqwest::Proxy::http(http_proxy)?;
            if let (Some(ref user), Some(ref pass)) =
                (&web_proxy.http_proxy_username, &web_proxy.http_proxy_password)
            {
                proxy = proxy.basic_auth(user, pass);
            }
            builder = builder.proxy(proxy);
        }

        if let Some(ref https_proxy) = web_proxy.https_proxy_address {
            let mut proxy = reqwest::Proxy::https(https_proxy)?;
            if let (Some(ref user), Some(ref pass)) = (
                &web_proxy.https_proxy_username,
                &web_proxy.https_proxy_password,
            ) {
                proxy = proxy.basic_auth(user, pass);
            }
            builder = builder.proxy(proxy);
        }

        // Configure no-proxy list. reqwest honors NO_PROXY from the
        // environment, so make sure the normalized value is visible there.
        if let Some(ref no_proxy_str) = web_proxy.no_proxy_string {
            if !no_proxy_str.is_empty() {
                std::env::set_var("NO_PROXY", no_proxy_str);
            }
        }

        // TLS verification
        if let Ok(val) = std::env::var(variables::agent::TLS_NO_VERIFY) {
            if StringUtil::convert_to_bool(&val) == Some(true) {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        // Default user agent
        builder = builder.user_agent(format!(
            "QuarryAgent-{}/{}",
            build_constants::AgentPackage::PACKAGE_NAME,
            build_constants::AgentPackage::VERSION,
        ));

        let client = builder.build()?;
        Ok(client)
    }

    /// Create a client with default proxy settings read from environment.
    pub fn create_default_client() -> Result<Client> {
        let proxy = AgentWebProxy::new();
        Self::create_client(&proxy)
    }

    /// The request timeout, read from the environment and clamped.
    fn request_timeout() -> Duration {
        let raw = std::env::var(variables::agent::HTTP_TIMEOUT).unwrap_or_default();
        let secs = raw.parse::<u64>().unwrap_or(DEFAULT_TIMEOUT_SECS);
        Duration::from_secs(secs.clamp(DEFAULT_TIMEOUT_SECS, MAX_TIMEOUT_SECS))
    }
}
