//! Server configuration parsed from environment variables.
//!
//! Every knob is optional. Numeric values that fail to parse fall back to
//! their defaults; only a storage backend name we do not know is fatal.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_SNAPSHOT_PATH: &str = "./canvas-history.json";
pub const DEFAULT_MAX_STROKES: usize = 2000;
pub const DEFAULT_CANVAS_BOUNDS: f64 = 1_000_000.0;
pub const DEFAULT_MAX_STROKE_POINTS: usize = 10_000;
pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;
pub const DEFAULT_SAVE_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 90;
pub const DEFAULT_INACTIVITY_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_RATE_LIMIT_SWEEP_SECS: u64 = 300;
pub const DEFAULT_CLEAR_COOLDOWN_MS: u64 = 5000;
pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_BATCH_TIMEOUT_MS: u64 = 50;
pub const DEFAULT_PROGRESSIVE_CHUNK_SIZE: usize = 100;
pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown STORAGE_BACKEND: {0} (expected 'file' or 'memory')")]
    UnknownBackend(String),
}

/// Where canvas snapshots go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    /// Pretty JSON file on local disk.
    File(PathBuf),
    /// Kept in process memory only; nothing survives a restart.
    Memory,
}

/// Limits applied while validating inbound payloads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    /// Largest accepted absolute world coordinate.
    pub max_coordinate: f64,
    pub max_stroke_points: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self { max_coordinate: DEFAULT_CANVAS_BOUNDS, max_stroke_points: DEFAULT_MAX_STROKE_POINTS }
    }
}

/// Timers and thresholds used by the hub and its background tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubTuning {
    pub max_strokes: usize,
    pub max_connections: usize,
    pub heartbeat_timeout: Duration,
    pub inactivity_timeout: Duration,
    pub sweep_interval: Duration,
    pub rate_limit_sweep_interval: Duration,
    pub clear_cooldown: Duration,
    pub save_interval: Duration,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub progressive_chunk_size: usize,
}

impl Default for HubTuning {
    fn default() -> Self {
        Self {
            max_strokes: DEFAULT_MAX_STROKES,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            heartbeat_timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
            inactivity_timeout: Duration::from_secs(DEFAULT_INACTIVITY_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            rate_limit_sweep_interval: Duration::from_secs(DEFAULT_RATE_LIMIT_SWEEP_SECS),
            clear_cooldown: Duration::from_millis(DEFAULT_CLEAR_COOLDOWN_MS),
            save_interval: Duration::from_secs(DEFAULT_SAVE_INTERVAL_SECS),
            batch_size: DEFAULT_BATCH_SIZE,
            batch_timeout: Duration::from_millis(DEFAULT_BATCH_TIMEOUT_MS),
            progressive_chunk_size: DEFAULT_PROGRESSIVE_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub storage: StorageBackend,
    pub limits: Limits,
    pub hub: HubTuning,
    /// Directory holding the built client bundle, served as a fallback.
    pub static_dir: Option<PathBuf>,
    pub log_level: String,
}

impl Config {
    /// Build typed config from environment variables.
    ///
    /// Optional:
    /// - `HOST`, `PORT`: listen address (default `0.0.0.0:3000`)
    /// - `STORAGE_BACKEND`: `file` (default) or `memory`
    /// - `SNAPSHOT_PATH`: snapshot file for the `file` backend
    /// - `MAX_STROKES`, `CANVAS_BOUNDS`, `MAX_STROKE_POINTS`, `MAX_CONNECTIONS`
    /// - `SAVE_INTERVAL_SECS`, `SWEEP_INTERVAL_SECS`, `HEARTBEAT_TIMEOUT_SECS`,
    ///   `INACTIVITY_TIMEOUT_SECS`, `RATE_LIMIT_SWEEP_SECS`, `CLEAR_COOLDOWN_MS`
    /// - `BATCH_SIZE`, `BATCH_TIMEOUT_MS`, `PROGRESSIVE_CHUNK_SIZE`
    /// - `STATIC_DIR`: serve the client bundle from this directory
    /// - `LOG_LEVEL`: used when `RUST_LOG` is unset (default `info`)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownBackend` for an unrecognized `STORAGE_BACKEND`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let snapshot_path =
            std::env::var("SNAPSHOT_PATH").map_or_else(|_| PathBuf::from(DEFAULT_SNAPSHOT_PATH), PathBuf::from);
        let storage = parse_backend(std::env::var("STORAGE_BACKEND").ok().as_deref(), snapshot_path)?;

        let limits = Limits {
            max_coordinate: finite_positive(env_parse("CANVAS_BOUNDS", DEFAULT_CANVAS_BOUNDS), DEFAULT_CANVAS_BOUNDS),
            max_stroke_points: env_parse("MAX_STROKE_POINTS", DEFAULT_MAX_STROKE_POINTS).max(1),
        };

        let hub = HubTuning {
            max_strokes: env_parse("MAX_STROKES", DEFAULT_MAX_STROKES).max(1),
            max_connections: env_parse("MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS),
            heartbeat_timeout: secs("HEARTBEAT_TIMEOUT_SECS", DEFAULT_HEARTBEAT_TIMEOUT_SECS),
            inactivity_timeout: secs("INACTIVITY_TIMEOUT_SECS", DEFAULT_INACTIVITY_TIMEOUT_SECS),
            sweep_interval: secs("SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS),
            rate_limit_sweep_interval: secs("RATE_LIMIT_SWEEP_SECS", DEFAULT_RATE_LIMIT_SWEEP_SECS),
            clear_cooldown: Duration::from_millis(env_parse("CLEAR_COOLDOWN_MS", DEFAULT_CLEAR_COOLDOWN_MS)),
            save_interval: secs("SAVE_INTERVAL_SECS", DEFAULT_SAVE_INTERVAL_SECS),
            batch_size: env_parse("BATCH_SIZE", DEFAULT_BATCH_SIZE).max(1),
            batch_timeout: Duration::from_millis(env_parse("BATCH_TIMEOUT_MS", DEFAULT_BATCH_TIMEOUT_MS).max(1)),
            progressive_chunk_size: env_parse("PROGRESSIVE_CHUNK_SIZE", DEFAULT_PROGRESSIVE_CHUNK_SIZE).max(1),
        };

        Ok(Self {
            host: std::env::var("HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string()),
            port: env_parse("PORT", DEFAULT_PORT),
            storage,
            limits,
            hub,
            static_dir: std::env::var("STATIC_DIR").ok().map(PathBuf::from),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string()),
        })
    }

    /// `host:port` string for the listener.
    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            storage: StorageBackend::File(PathBuf::from(DEFAULT_SNAPSHOT_PATH)),
            limits: Limits::default(),
            hub: HubTuning::default(),
            static_dir: None,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// `value` when it is a usable bound, otherwise `default`. Rejects NaN and infinity.
pub(crate) fn finite_positive(value: f64, default: f64) -> f64 {
    if value.is_finite() && value > 0.0 { value } else { default }
}

fn secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_parse(key, default).max(1))
}

fn parse_backend(raw: Option<&str>, snapshot_path: PathBuf) -> Result<StorageBackend, ConfigError> {
    match raw.map(str::trim).unwrap_or("file") {
        "file" | "" => Ok(StorageBackend::File(snapshot_path)),
        "memory" => Ok(StorageBackend::Memory),
        other => Err(ConfigError::UnknownBackend(other.to_string())),
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
