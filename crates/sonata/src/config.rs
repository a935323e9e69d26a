// src/config.rs
use crate::error::{SonataError, SonataResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Longest accepted tick period, one day.
pub const MAX_TICK_SECS: u32 = 86_400;

/// Server configuration.
///
/// Loaded from `SONATA_*` environment variables (with `.env` support) or a
/// JSON file; every field has a default, so partial sources are fine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Interface to listen on (default: 0.0.0.0)
    pub host: String,

    /// TCP port (default: 9006)
    pub port: u16,

    /// Directory served to clients (default: ./root)
    pub doc_root: PathBuf,

    /// Worker threads (default: one per logical CPU)
    pub workers: usize,

    /// Seconds between idle-timer ticks. Idle connections are closed after
    /// three ticks without traffic (default: 5)
    pub tick_secs: u32,

    /// Maximum simultaneously open client connections (default: 10000)
    pub max_connections: usize,

    /// Size of the connection table; accepted descriptors at or above this
    /// value are rejected (default: 65536)
    pub max_fd: usize,

    /// Pin worker threads to CPU cores (default: false)
    pub pin_workers: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9006,
            doc_root: PathBuf::from("./root"),
            workers: num_cpus::get(),
            tick_secs: 5,
            max_connections: 10_000,
            max_fd: 65_536,
            pin_workers: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables (with .env support).
    pub fn from_env() -> SonataResult<Self> {
        // A missing .env file is fine.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from any key lookup, using `SONATA_*` names.
    pub fn from_lookup<F>(lookup: F) -> SonataResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(host) = lookup("SONATA_HOST") {
            config.host = host;
        }
        if let Some(port) = lookup("SONATA_PORT") {
            config.port = parse_var("SONATA_PORT", &port)?;
        }
        if let Some(root) = lookup("SONATA_DOC_ROOT") {
            config.doc_root = PathBuf::from(root);
        }
        if let Some(workers) = lookup("SONATA_WORKERS") {
            config.workers = parse_var("SONATA_WORKERS", &workers)?;
        }
        if let Some(tick) = lookup("SONATA_TICK_SECS") {
            config.tick_secs = parse_var("SONATA_TICK_SECS", &tick)?;
        }
        if let Some(max) = lookup("SONATA_MAX_CONNECTIONS") {
            config.max_connections = parse_var("SONATA_MAX_CONNECTIONS", &max)?;
        }
        if let Some(max) = lookup("SONATA_MAX_FD") {
            config.max_fd = parse_var("SONATA_MAX_FD", &max)?;
        }
        if let Some(pin) = lookup("SONATA_PIN_WORKERS") {
            config.pin_workers = matches!(
                pin.to_lowercase().as_str(),
                "true" | "1" | "yes"
            );
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> SonataResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SonataError::Config(format!("{}: {e}", path.display())))?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> SonataResult<()> {
        if self.workers == 0 {
            return Err(SonataError::Config("workers must be at least 1".into()));
        }
        if self.tick_secs == 0 {
            return Err(SonataError::Config("tick_secs must be at least 1".into()));
        }
        if self.tick_secs > MAX_TICK_SECS {
            return Err(SonataError::Config(format!(
                "tick_secs must be at most {MAX_TICK_SECS}"
            )));
        }
        if self.max_connections == 0 {
            return Err(SonataError::Config("max_connections must be at least 1".into()));
        }
        if self.max_fd == 0 {
            return Err(SonataError::Config("max_fd must be at least 1".into()));
        }
        Ok(())
    }

    /// Get the full server address.
    pub fn server_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> SonataResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| SonataError::Config(format!("{key}: invalid value {value:?}")))
}
