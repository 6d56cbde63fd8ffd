use std::path::Path;

use serde::Deserialize;
use weir_core::{config::RuntimeConfig, AnyResult};

/// Demo service configuration, loadable from TOML or JSON.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Cap on aggregated request bodies, in bytes.
    pub chunk_limit: Option<usize>,
    /// Keep-alive idle timeout, in seconds.
    pub keepalive_secs: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            chunk_limit: None,
            keepalive_secs: None,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_port() -> u16 {
    8080
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> AnyResult<Config> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Ok(serde_json::from_str(&raw)?),
            _ => Ok(toml::from_str(&raw)?),
        }
    }
}
