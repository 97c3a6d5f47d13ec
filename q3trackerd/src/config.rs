use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub master: MasterConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub janitor: JanitorConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MasterConfig {
    /// Bind address for the master UDP listener.
    #[serde(default = "default_master_listen")]
    pub listen: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Upstream master queried for seed addresses.
    #[serde(default = "default_upstream_host")]
    pub host: String,
    /// Protocol numbers to query for.
    #[serde(default = "default_protocols")]
    pub protocols: Vec<u32>,
    #[serde(default = "default_discovery_interval")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_poll_workers")]
    pub workers: usize,
    #[serde(default = "default_poll_queue_capacity")]
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JanitorConfig {
    #[serde(default = "default_janitor_interval")]
    pub interval_secs: u64,
}

fn default_http_port() -> u16 {
    8080
}

fn default_master_listen() -> String {
    "0.0.0.0:27950".to_string()
}

fn default_upstream_host() -> String {
    "wolfmaster.idsoftware.com:27950".to_string()
}

fn default_protocols() -> Vec<u32> {
    vec![57, 60, 84]
}

fn default_discovery_interval() -> u64 {
    300
}

fn default_poll_interval() -> u64 {
    15
}

fn default_poll_workers() -> usize {
    4
}

fn default_poll_queue_capacity() -> usize {
    1024
}

fn default_janitor_interval() -> u64 {
    60
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: default_http_port(),
        }
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            listen: default_master_listen(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: default_upstream_host(),
            protocols: default_protocols(),
            interval_secs: default_discovery_interval(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval(),
            workers: default_poll_workers(),
            queue_capacity: default_poll_queue_capacity(),
        }
    }
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_janitor_interval(),
        }
    }
}

impl Config {
    /// Loads configuration from a TOML file; no path means defaults. The
    /// PORT environment variable overrides the HTTP port either way.
    pub fn load(path: Option<impl AsRef<Path>>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let path = path.as_ref();
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                toml::from_str(&contents)
                    .with_context(|| format!("Failed to parse config file: {}", path.display()))?
            }
            None => Config::default(),
        };

        if let Ok(port) = std::env::var("PORT") {
            config.http.port = port
                .parse()
                .with_context(|| format!("Invalid PORT value: {port}"))?;
        }

        Ok(config)
    }
}
