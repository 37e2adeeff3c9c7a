// src/config.rs
use crate::error::{EngineError, RavelResult};
use serde::Deserialize;
use std::path::Path;

/// Engine configuration.
///
/// Loadable from a JSON file via [`ServerConfig::from_file`]; every
/// field has a working default so `ServerConfig::default()` is a valid
/// production setup. Validation rejects the values the engine cannot
/// defend against at runtime (a zero rate cap divides, a zero pool
/// retains nothing, ...).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Worker threads; 0 means one per CPU core.
    pub workers: usize,
    /// Connection slots preallocated per worker.
    pub arena_capacity: usize,
    /// Request descriptors each worker retains for reuse.
    pub pool_capacity: usize,
    /// Maximum keep-alive transactions per connection.
    pub keepalive_max: u32,
    /// Budget for reading one request header block, ms.
    pub timeout_header_ms: i64,
    /// Budget for reading one request body, ms.
    pub timeout_post_ms: i64,
    /// Lingering-close drain window, ms.
    pub linger_timeout_ms: i64,
    /// Lingering-close drain ceiling, bytes.
    pub linger_max_bytes: u64,
    /// Internal re-dispatch bound per request.
    pub max_respins: u32,
    /// Virtual-host traffic roll-up interval, ms.
    pub traffic_update_ms: u64,
    /// Default outbound cap per connection, bytes/second. 0 disables.
    pub limit_bps: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            workers: 0,
            arena_capacity: 65_536,
            pool_capacity: 1_024,
            keepalive_max: 1_000,
            timeout_header_ms: 15_000,
            timeout_post_ms: 60_000,
            linger_timeout_ms: 2_000,
            linger_max_bytes: 64 * 1024,
            max_respins: 10,
            traffic_update_ms: 1_000,
            limit_bps: 0,
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> RavelResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: ServerConfig = serde_json::from_str(&raw)
            .map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RavelResult<()> {
        if self.arena_capacity == 0 {
            return Err(EngineError::Config("arena_capacity must be > 0".into()));
        }
        if self.pool_capacity == 0 {
            return Err(EngineError::Config("pool_capacity must be > 0".into()));
        }
        if self.keepalive_max == 0 {
            return Err(EngineError::Config("keepalive_max must be > 0".into()));
        }
        if self.linger_max_bytes == 0 {
            return Err(EngineError::Config("linger_max_bytes must be > 0".into()));
        }
        if self.timeout_header_ms <= 0 || self.timeout_post_ms <= 0 || self.linger_timeout_ms <= 0
        {
            return Err(EngineError::Config("timeouts must be positive".into()));
        }
        Ok(())
    }

    /// Worker count with the "0 = all cores" default applied.
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }
}
