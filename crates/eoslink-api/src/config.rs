//! Server configuration from environment variables.

use eoslink_flow::error::{Error, Result};
use eoslink_flow::runtime::FlowConfig;

/// API server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port the HTTP server binds to.
    pub port: u16,
    /// Pretty logs and relaxed requirements for local development.
    pub debug: bool,
    /// Base URL of the EOS optimizer, e.g. `http://eos.local:8503`.
    pub eos_base_url: String,
    /// Per-request timeout for optimizer calls, in seconds.
    pub eos_http_timeout_seconds: u64,
    /// Orchestration configuration passed through to the flow layer.
    pub flow: FlowConfig,
}

impl Config {
    /// Loads configuration from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the offending variable.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|name| std::env::var(name).ok())
    }

    /// Loads configuration through an injectable lookup, for tests.
    ///
    /// `EOS_BASE_URL` is required; everything else has defaults.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the offending variable.
    pub fn from_env_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port = match lookup("PORT") {
            Some(value) => value
                .parse::<u16>()
                .map_err(|_| Error::configuration(format!("PORT: not a port number: {value}")))?,
            None => 8080,
        };

        let debug = match lookup("EOSLINK_DEBUG") {
            Some(value) => matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
            None => false,
        };

        let eos_base_url = lookup("EOS_BASE_URL")
            .ok_or_else(|| Error::configuration("EOS_BASE_URL is required"))?;
        if !eos_base_url.starts_with("http://") && !eos_base_url.starts_with("https://") {
            return Err(Error::configuration(format!(
                "EOS_BASE_URL: not an http(s) URL: {eos_base_url}"
            )));
        }

        let eos_http_timeout_seconds = match lookup("EOS_HTTP_TIMEOUT_SECONDS") {
            Some(value) => {
                let parsed = value.parse::<u64>().map_err(|_| {
                    Error::configuration(format!(
                        "EOS_HTTP_TIMEOUT_SECONDS: not a non-negative integer: {value}"
                    ))
                })?;
                if parsed == 0 {
                    return Err(Error::configuration(
                        "EOS_HTTP_TIMEOUT_SECONDS: must be greater than zero",
                    ));
                }
                parsed
            }
            None => 10,
        };

        Ok(Self {
            port,
            debug,
            eos_base_url,
            eos_http_timeout_seconds,
            flow: FlowConfig::from_env_with(lookup)?,
        })
    }
}
