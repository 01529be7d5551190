//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! API keys come from the OPENAI_API_KEYS env var or `pool.keys_file`,
//! never from the TOML directly to avoid leaking secrets.

use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Env var holding the comma- or newline-separated upstream API keys
pub const KEYS_ENV: &str = "OPENAI_API_KEYS";

/// Config file looked up in the working directory when no path is given
const DEFAULT_CONFIG_FILE: &str = "rotating-chat-proxy.toml";

/// Root configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub pool: PoolConfig,
}

/// HTTP proxy settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Upstream attempts per inbound request. Defaults to the pool size.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

/// Key pool settings
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    /// File with one key per line (alternative to the OPENAI_API_KEYS env var)
    #[serde(default)]
    pub keys_file: Option<PathBuf>,
    #[serde(skip)]
    pub keys: Vec<Secret<String>>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            upstream_url: default_upstream_url(),
            timeout_secs: default_timeout(),
            max_connections: default_max_connections(),
            max_attempts: None,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown(),
            keys_file: None,
            keys: Vec::new(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5000))
}

fn default_upstream_url() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_timeout() -> u64 {
    60
}

fn default_max_connections() -> usize {
    1000
}

fn default_cooldown() -> u64 {
    key_pool::DEFAULT_COOLDOWN.as_secs()
}

impl Config {
    /// Load configuration from an optional TOML file, then resolve API keys.
    ///
    /// With no path, every setting takes its default. Key resolution order:
    /// 1. OPENAI_API_KEYS env var, if it holds at least one key
    /// 2. keys_file path from config
    ///
    /// An empty key list is a configuration error: the proxy cannot start
    /// without at least one key.
    pub fn load(path: Option<&Path>) -> common::Result<Self> {
        let mut config: Config = match path {
            Some(path) => toml::from_str(&std::fs::read_to_string(path)?)?,
            None => Config::default(),
        };

        if !config.proxy.upstream_url.starts_with("http://")
            && !config.proxy.upstream_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "upstream_url must start with http:// or https://, got: {}",
                config.proxy.upstream_url
            )));
        }

        if config.proxy.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if config.proxy.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if config.proxy.max_attempts == Some(0) {
            return Err(common::Error::Config(
                "max_attempts must be greater than 0".into(),
            ));
        }

        if config.pool.cooldown_secs == 0 {
            return Err(common::Error::Config(
                "cooldown_secs must be greater than 0".into(),
            ));
        }

        // A blank env var does not shadow keys_file.
        config.pool.keys = std::env::var(KEYS_ENV)
            .map(|raw| parse_keys(&raw))
            .unwrap_or_default();
        if config.pool.keys.is_empty()
            && let Some(keys_file) = &config.pool.keys_file
        {
            let raw = std::fs::read_to_string(keys_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read keys_file {}: {e}",
                    keys_file.display()
                ))
            })?;
            config.pool.keys = parse_keys(&raw);
        }

        if config.pool.keys.is_empty() {
            return Err(common::Error::Config(format!(
                "no upstream API keys configured: set {KEYS_ENV} or pool.keys_file"
            )));
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    ///
    /// Falls back to `rotating-chat-proxy.toml` only if that file exists;
    /// `None` means run on defaults.
    pub fn resolve_path(cli_path: Option<&str>) -> Option<PathBuf> {
        if let Some(p) = cli_path {
            return Some(PathBuf::from(p));
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return Some(PathBuf::from(p));
        }
        let default = PathBuf::from(DEFAULT_CONFIG_FILE);
        default.exists().then_some(default)
    }

    /// Upstream attempts allowed per inbound request.
    pub fn max_attempts(&self, pool_size: usize) -> u32 {
        self.proxy
            .max_attempts
            .unwrap_or_else(|| u32::try_from(pool_size).unwrap_or(u32::MAX))
    }
}

/// Split a key list on commas and newlines, dropping blanks.
fn parse_keys(raw: &str) -> Vec<Secret<String>> {
    raw.split([',', '\n'])
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(|k| k.to_owned().into())
        .collect()
}
