use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
pub struct Bootstrap {
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub pidfile: Option<String>,
    #[serde(default)]
    pub logger: Logger,
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub upstream: Upstream,
    #[serde(default)]
    pub cache: CacheSettings,
}

impl Bootstrap {
    pub fn validate(&self) -> Result<()> {
        if self.server.addr.trim().is_empty() {
            return Err(anyhow!("server.addr is required"));
        }
        if self.upstream.origin.trim().is_empty() {
            return Err(anyhow!("upstream.origin is required"));
        }
        if !self.upstream.origin.starts_with("http://")
            && !self.upstream.origin.starts_with("https://")
        {
            return Err(anyhow!("upstream.origin must be an http(s) url"));
        }
        if self.cache.segment_size == 0 {
            return Err(anyhow!("cache.segment_size must be positive"));
        }
        if self.cache.capacity < self.cache.segment_size {
            return Err(anyhow!("cache.capacity must hold at least one segment"));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct Logger {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub max_size: u64,
    #[serde(default)]
    pub max_backups: u64,
}

#[derive(Debug, Deserialize)]
pub struct Server {
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(default)]
    pub access_log: Option<AccessLog>,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            access_log: None,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct AccessLog {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct Upstream {
    /// Origin base url, e.g. `http://dav.example.com:5005`.
    #[serde(default)]
    pub origin: String,
    /// Path prefix prepended to every inbound path.
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for Upstream {
    fn default() -> Self {
        Self {
            origin: String::new(),
            path_prefix: default_path_prefix(),
            request_timeout: default_request_timeout(),
            idle_timeout: default_idle_timeout(),
            max_idle_per_host: default_max_idle_per_host(),
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_capacity")]
    pub capacity: u64,
    #[serde(default = "default_segment_size")]
    pub segment_size: u64,
    #[serde(default = "default_metadata_ttl", with = "humantime_serde")]
    pub metadata_ttl: Duration,
    #[serde(default = "default_redirect_ttl", with = "humantime_serde")]
    pub redirect_ttl: Duration,
    #[serde(default = "default_preload_ttl", with = "humantime_serde")]
    pub preload_ttl: Duration,
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            segment_size: default_segment_size(),
            metadata_ttl: default_metadata_ttl(),
            redirect_ttl: default_redirect_ttl(),
            preload_ttl: default_preload_ttl(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

fn default_addr() -> String {
    "0.0.0.0:8090".to_string()
}

fn default_path_prefix() -> String {
    "/webdav".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_idle_per_host() -> usize {
    5
}

fn default_user_agent() -> String {
    concat!("matinee/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_capacity() -> u64 {
    500 * 1024 * 1024
}

fn default_segment_size() -> u64 {
    2 * 1024 * 1024
}

fn default_metadata_ttl() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_redirect_ttl() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_preload_ttl() -> Duration {
    Duration::from_secs(2 * 60)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

pub fn load(path: &Path) -> Result<(Bootstrap, Vec<String>)> {
    let raw = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    let mut ignored = Vec::new();
    let de = serde_yaml::Deserializer::from_str(&raw);
    let cfg: Bootstrap = serde_ignored::deserialize(de, |path| {
        ignored.push(path.to_string());
    })
    .with_context(|| format!("parse config {}", path.display()))?;

    Ok((cfg, ignored))
}
