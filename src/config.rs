//! Configuration management for querygate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use crate::error::{QuerygateError, Result};
use crate::ratelimit::LimitSettings;

/// Main configuration for the querygate sidecar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerygateConfig {
    /// Relay server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Query rate limiting configuration
    #[serde(default)]
    pub limits: LimitsConfig,
}

impl Default for QuerygateConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

/// Relay server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// UDP address clients send queries to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Address of the game server being protected
    #[serde(default = "default_upstream_addr")]
    pub upstream_addr: SocketAddr,

    /// Seconds of inactivity before a relay session is dropped
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,

    /// Upper bound on concurrent relay sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Skip rate limiting for queries arriving from loopback addresses
    #[serde(default = "default_exempt_loopback")]
    pub exempt_loopback: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            upstream_addr: default_upstream_addr(),
            session_idle_secs: default_session_idle_secs(),
            max_sessions: default_max_sessions(),
            exempt_loopback: default_exempt_loopback(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    "0.0.0.0:27015".parse().unwrap()
}

fn default_upstream_addr() -> SocketAddr {
    "127.0.0.1:27016".parse().unwrap()
}

fn default_session_idle_secs() -> u64 {
    120
}

fn default_max_sessions() -> usize {
    4_096
}

fn default_exempt_loopback() -> bool {
    true
}

/// Query rate limiting configuration.
///
/// All five numeric tunables may be changed at runtime (SIGHUP reload);
/// the limiter reads whatever values are current when a query arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum queries per second to answer from a single source
    #[serde(default = "default_max_queries_per_sec")]
    pub max_queries_per_sec: f64,

    /// Window in seconds over which query rates are averaged
    #[serde(default = "default_averaging_window_secs")]
    pub averaging_window_secs: f64,

    /// Ceiling on tracked sources before flood response kicks in
    #[serde(default = "default_max_tracked_sources")]
    pub max_tracked_sources: usize,

    /// Minimum number of stale sources evicted per query check
    #[serde(default = "default_prune_batch_size")]
    pub prune_batch_size: usize,

    /// Maximum queries per second to answer across all sources
    #[serde(default = "default_global_max_queries_per_sec")]
    pub global_max_queries_per_sec: f64,

    /// Log every blocked query (can produce very large logs under attack)
    #[serde(default)]
    pub log_blocks: bool,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_queries_per_sec: default_max_queries_per_sec(),
            averaging_window_secs: default_averaging_window_secs(),
            max_tracked_sources: default_max_tracked_sources(),
            prune_batch_size: default_prune_batch_size(),
            global_max_queries_per_sec: default_global_max_queries_per_sec(),
            log_blocks: false,
        }
    }
}

fn default_max_queries_per_sec() -> f64 {
    10.0
}

fn default_averaging_window_secs() -> f64 {
    30.0
}

fn default_max_tracked_sources() -> usize {
    50_000
}

fn default_prune_batch_size() -> usize {
    10
}

fn default_global_max_queries_per_sec() -> f64 {
    500.0
}

impl LimitsConfig {
    /// Check the tunables for values the limiter cannot run with.
    ///
    /// The averaging window is the rate denominator, so it must be a
    /// positive finite number. Ceilings of zero are legal: they turn the
    /// corresponding check into a full lockdown.
    pub fn validate(&self) -> Result<()> {
        if !self.averaging_window_secs.is_finite() || self.averaging_window_secs <= 0.0 {
            return Err(QuerygateError::Config(format!(
                "averaging_window_secs must be a positive number, got {}",
                self.averaging_window_secs
            )));
        }
        if !self.max_queries_per_sec.is_finite() || self.max_queries_per_sec < 0.0 {
            return Err(QuerygateError::Config(format!(
                "max_queries_per_sec must be a non-negative number, got {}",
                self.max_queries_per_sec
            )));
        }
        if !self.global_max_queries_per_sec.is_finite() || self.global_max_queries_per_sec < 0.0 {
            return Err(QuerygateError::Config(format!(
                "global_max_queries_per_sec must be a non-negative number, got {}",
                self.global_max_queries_per_sec
            )));
        }
        Ok(())
    }
}

impl From<&LimitsConfig> for LimitSettings {
    fn from(cfg: &LimitsConfig) -> Self {
        LimitSettings {
            max_queries_per_sec: cfg.max_queries_per_sec,
            averaging_window_secs: cfg.averaging_window_secs,
            max_tracked_sources: cfg.max_tracked_sources,
            prune_batch_size: cfg.prune_batch_size,
            global_max_queries_per_sec: cfg.global_max_queries_per_sec,
            log_blocks: cfg.log_blocks,
        }
    }
}

impl QuerygateConfig {
    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: QuerygateConfig =
            serde_yaml::from_str(yaml).map_err(|e| QuerygateError::Config(e.to_string()))?;
        config.limits.validate()?;
        Ok(config)
    }
}
