//! Configuration structures for fsev.
//!
//! - [`WatchConfig`] - per-watch latency, stream flags, and batch limits
//! - [`Sensitivity`] - coarse latency presets
//! - [`Config`] - root configuration, loadable from a JSON file
//!
//! All configuration types implement [`Default`] and deserialize with
//! missing fields filled from those defaults.

use std::time::Duration;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::flags::CreateFlags;

/// Smallest accepted `max_chunk_size`.
///
/// Bursts are routinely in the thousands of paths; chunking below this
/// only multiplies forwarding calls.
pub const MIN_CHUNK_SIZE: usize = 10_000;

/// Largest accepted `max_chunk_size`.
///
/// Batch counts travel as a signed 32-bit integer, with a little headroom
/// below its maximum.
#[allow(clippy::cast_sign_loss)]
pub const MAX_CHUNK_LIMIT: usize = (i32::MAX - 2) as usize;

/// Default `max_chunk_size`.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 65_536;

/// Coarse latency presets for a watch.
///
/// # Examples
///
/// ```
/// use fsev_core::Sensitivity;
///
/// assert_eq!(Sensitivity::High.latency_secs(), 0.1);
/// assert_eq!(Sensitivity::default(), Sensitivity::Medium);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    /// 0.1 second latency.
    High,
    /// 0.5 second latency.
    #[default]
    Medium,
    /// 1 second latency.
    Low,
}

impl Sensitivity {
    /// Returns the coalescing latency for this preset, in seconds.
    #[must_use]
    pub const fn latency_secs(self) -> f64 {
        match self {
            Self::High => 0.1,
            Self::Medium => 0.5,
            Self::Low => 1.0,
        }
    }
}

/// Configuration for a single watch.
///
/// # Examples
///
/// ```
/// use fsev_core::{CreateFlags, WatchConfig};
///
/// let config = WatchConfig::default();
/// assert_eq!(config.latency_secs(), 0.5);
/// assert_eq!(config.flags, CreateFlags::WATCH_ROOT);
/// assert_eq!(config.max_chunk_size, 65_536);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Latency preset, used unless `latency_secs` is set.
    pub sensitivity: Sensitivity,

    /// Explicit coalescing latency in seconds, overriding `sensitivity`.
    #[serde(rename = "latency_secs", skip_serializing_if = "Option::is_none")]
    pub latency_override: Option<f64>,

    /// Stream creation flags.
    pub flags: CreateFlags,

    /// Maximum number of events forwarded to a handler in one batch.
    pub max_chunk_size: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            sensitivity: Sensitivity::default(),
            latency_override: None,
            flags: CreateFlags::default(),
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
        }
    }
}

impl WatchConfig {
    /// Returns the effective latency in seconds.
    #[must_use]
    pub fn latency_secs(&self) -> f64 {
        self.latency_override
            .unwrap_or_else(|| self.sensitivity.latency_secs())
    }

    /// Returns the effective latency as a [`Duration`].
    ///
    /// Negative or non-finite values collapse to zero.
    #[must_use]
    pub fn latency(&self) -> Duration {
        Duration::try_from_secs_f64(self.latency_secs()).unwrap_or(Duration::ZERO)
    }

    /// Checks that every field is within its accepted range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let latency = self.latency_secs();
        if !latency.is_finite() || latency < 0.0 {
            return Err(ConfigError::InvalidOption {
                option: "latency_secs".to_owned(),
                reason: format!("must be a non-negative number of seconds, got {latency}"),
            });
        }

        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_LIMIT).contains(&self.max_chunk_size) {
            return Err(ConfigError::InvalidOption {
                option: "max_chunk_size".to_owned(),
                reason: format!(
                    "must be between {MIN_CHUNK_SIZE} and {MAX_CHUNK_LIMIT}, got {}",
                    self.max_chunk_size
                ),
            });
        }

        Ok(())
    }
}

/// Root configuration.
///
/// # Examples
///
/// ```
/// use fsev_core::Config;
///
/// let config: Config = serde_json::from_str(r#"{"trace": true}"#).unwrap();
/// assert!(config.trace);
/// assert_eq!(config.watch.max_chunk_size, 65_536);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Watch settings applied to every watched directory.
    pub watch: WatchConfig,

    /// Enables diagnostic tracing for the process.
    pub trace: bool,
}

impl Config {
    /// Loads and validates a configuration from a JSON file.
    pub fn from_json_file(path: &Utf8Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::InvalidPath {
                path: path.to_owned(),
                reason: "not a readable file".to_owned(),
            });
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every section of the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.watch.validate()
    }
}
