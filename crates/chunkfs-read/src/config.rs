//! Engine configuration
//!
//! [`EngineConfig`] is an immutable value fixed at engine init and shared
//! with every component through an `Arc`. It can be built three ways:
//!
//! - builder-style setters on top of [`EngineConfig::default`]
//! - [`EngineConfig::from_init_args`] for the classic nine-value init tuple
//!   (milliseconds and KiB)
//! - deserialized with serde (durations in milliseconds), then optionally
//!   overlaid with `CHUNKFS_*` environment variables via
//!   [`EngineConfig::with_env_overrides`]
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use chunkfs_read::config::{EngineConfig, XorPrefetchPolicy};
//!
//! let config = EngineConfig::default()
//!     .retries(5)
//!     .wave_timeout(Duration::from_millis(300))
//!     .xor_prefetch(true)
//!     .xor_policy(XorPrefetchPolicy::LatencyRace);
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default chunk size (64 MiB)
pub const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024 * 1024;
/// Default block size (64 KiB); the unit of network transfer and of XOR striping
pub const DEFAULT_BLOCK_SIZE: u32 = 64 * 1024;

/// How the per-attempt data-wait budget relates to the round-trip estimate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum WaveTimeoutModel {
    /// Use the configured wave timeout as is
    #[default]
    Fixed,
    /// Wave timeout plus one round trip
    PlusRoundTrip,
    /// At least `multiplier` round trips, never below the wave timeout
    ScaledRoundTrip { multiplier: u32 },
}

impl WaveTimeoutModel {
    /// Effective data-wait budget for one attempt
    pub fn wave_timeout(&self, wave: Duration, round_trip: Duration) -> Duration {
        match *self {
            WaveTimeoutModel::Fixed => wave,
            WaveTimeoutModel::PlusRoundTrip => wave.saturating_add(round_trip),
            WaveTimeoutModel::ScaledRoundTrip { multiplier } => {
                wave.max(round_trip.saturating_mul(multiplier))
            }
        }
    }
}

/// What XOR parity is fetched for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum XorPrefetchPolicy {
    /// Fetch parity only to rebuild a failed or stalled data part
    #[default]
    Reconstruct,
    /// Race parity with the data parts and finish on the first `level` arrivals
    LatencyRace,
}

/// Read engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum attempts per chunk fetch (at least one is always made)
    pub retries: u32,
    /// Estimated round trip to a chunk server
    #[serde(with = "millis")]
    pub round_trip_estimate: Duration,
    /// Budget for establishing a connection
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    /// Budget for the first data after connecting, before a new wave starts
    #[serde(with = "millis")]
    pub wave_timeout: Duration,
    /// Hard ceiling on one logical read
    #[serde(with = "millis")]
    pub total_read_timeout: Duration,
    /// Lifetime of cached ranges and length of the bandwidth accounting window
    #[serde(with = "millis")]
    pub cache_expiration: Duration,
    /// Largest readahead window in bytes; zero disables readahead
    pub max_readahead_window: u64,
    /// Prefetch XOR parity alongside readahead
    pub xor_prefetch: bool,
    /// Allowed ratio of speculative to demanded bytes
    pub bandwidth_overuse: f64,
    pub wave_timeout_model: WaveTimeoutModel,
    pub xor_policy: XorPrefetchPolicy,
    /// Adapt the readahead cap to observed throughput
    pub adaptive_readahead: bool,
    /// Forward gap still treated as sequential access
    pub sequential_tolerance: u64,
    pub chunk_size: u64,
    pub block_size: u32,
    /// Byte capacity of the built-in read cache; zero means unbounded
    pub cache_capacity: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retries: 30,
            round_trip_estimate: Duration::from_millis(200),
            connect_timeout: Duration::from_millis(2000),
            wave_timeout: Duration::from_millis(500),
            total_read_timeout: Duration::from_millis(2000),
            cache_expiration: Duration::from_millis(1000),
            max_readahead_window: 16 * 1024 * 1024,
            xor_prefetch: false,
            bandwidth_overuse: 1.25,
            wave_timeout_model: WaveTimeoutModel::Fixed,
            xor_policy: XorPrefetchPolicy::Reconstruct,
            adaptive_readahead: true,
            sequential_tolerance: 64 * 1024,
            chunk_size: DEFAULT_CHUNK_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            cache_capacity: 256 * 1024 * 1024,
        }
    }
}

impl EngineConfig {
    /// Build from the classic init tuple (milliseconds and KiB)
    #[allow(clippy::too_many_arguments)]
    pub fn from_init_args(
        retries: u32,
        round_trip_ms: u32,
        connect_timeout_ms: u32,
        wave_timeout_ms: u32,
        total_timeout_ms: u32,
        cache_expiration_ms: u32,
        max_readahead_kb: u32,
        xor_prefetch: bool,
        bandwidth_overuse: f64,
    ) -> Self {
        Self {
            retries,
            round_trip_estimate: Duration::from_millis(u64::from(round_trip_ms)),
            connect_timeout: Duration::from_millis(u64::from(connect_timeout_ms)),
            wave_timeout: Duration::from_millis(u64::from(wave_timeout_ms)),
            total_read_timeout: Duration::from_millis(u64::from(total_timeout_ms)),
            cache_expiration: Duration::from_millis(u64::from(cache_expiration_ms)),
            max_readahead_window: u64::from(max_readahead_kb) * 1024,
            xor_prefetch,
            bandwidth_overuse,
            ..Self::default()
        }
    }

    /// Defaults overlaid with `CHUNKFS_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    /// Overlay `CHUNKFS_*` environment variables on this configuration
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|var| std::env::var(var).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let millis = |var: &str| -> Result<Option<Duration>, ConfigError> {
            parse_var::<u64, _>(&lookup, var).map(|v| v.map(Duration::from_millis))
        };

        if let Some(v) = parse_var(&lookup, "CHUNKFS_RETRIES")? {
            self.retries = v;
        }
        if let Some(v) = millis("CHUNKFS_RTT_MS")? {
            self.round_trip_estimate = v;
        }
        if let Some(v) = millis("CHUNKFS_CONNECT_TIMEOUT_MS")? {
            self.connect_timeout = v;
        }
        if let Some(v) = millis("CHUNKFS_WAVE_TIMEOUT_MS")? {
            self.wave_timeout = v;
        }
        if let Some(v) = millis("CHUNKFS_TOTAL_TIMEOUT_MS")? {
            self.total_read_timeout = v;
        }
        if let Some(v) = millis("CHUNKFS_CACHE_EXPIRATION_MS")? {
            self.cache_expiration = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "CHUNKFS_MAX_READAHEAD_KB")? {
            self.max_readahead_window = v.saturating_mul(1024);
        }
        if let Some(v) = parse_var(&lookup, "CHUNKFS_PREFETCH_XOR")? {
            self.xor_prefetch = v;
        }
        if let Some(v) = parse_var(&lookup, "CHUNKFS_BANDWIDTH_OVERUSE")? {
            self.bandwidth_overuse = v;
        }

        Ok(self)
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size == 0 {
            return Err(ConfigError::invalid("block_size", "must be positive"));
        }
        if self.chunk_size == 0 || self.chunk_size % u64::from(self.block_size) != 0 {
            return Err(ConfigError::invalid(
                "chunk_size",
                format!("{} is not a positive multiple of the block size", self.chunk_size),
            ));
        }
        if self.chunk_size > u64::from(u32::MAX) {
            return Err(ConfigError::invalid("chunk_size", "must fit in 32 bits"));
        }
        if self.total_read_timeout.is_zero() {
            return Err(ConfigError::invalid("total_read_timeout", "must be positive"));
        }
        if self.wave_timeout.is_zero() {
            return Err(ConfigError::invalid("wave_timeout", "must be positive"));
        }
        if self.connect_timeout.is_zero() && self.round_trip_estimate.is_zero() {
            return Err(ConfigError::invalid(
                "connect_timeout",
                "connect timeout and round trip cannot both be zero",
            ));
        }
        if !self.bandwidth_overuse.is_finite() || self.bandwidth_overuse < 0.0 {
            return Err(ConfigError::invalid(
                "bandwidth_overuse",
                format!("{} is not a non-negative ratio", self.bandwidth_overuse),
            ));
        }
        if let WaveTimeoutModel::ScaledRoundTrip { multiplier: 0 } = self.wave_timeout_model {
            return Err(ConfigError::invalid("wave_timeout_model", "multiplier must be positive"));
        }
        Ok(())
    }

    /// Attempts allowed per fetch
    pub fn max_attempts(&self) -> u32 {
        self.retries.max(1)
    }

    /// Connect budget of one attempt
    pub fn connect_budget(&self) -> Duration {
        self.connect_timeout.max(self.round_trip_estimate)
    }

    /// Data-wait budget of one attempt
    pub fn effective_wave_timeout(&self) -> Duration {
        self.wave_timeout_model
            .wave_timeout(self.wave_timeout, self.round_trip_estimate)
    }

    /// Set maximum attempts per fetch
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Set round trip estimate
    pub fn round_trip_estimate(mut self, rtt: Duration) -> Self {
        self.round_trip_estimate = rtt;
        self
    }

    /// Set connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set wave timeout
    pub fn wave_timeout(mut self, timeout: Duration) -> Self {
        self.wave_timeout = timeout;
        self
    }

    /// Set total read timeout
    pub fn total_read_timeout(mut self, timeout: Duration) -> Self {
        self.total_read_timeout = timeout;
        self
    }

    /// Set cache expiration
    pub fn cache_expiration(mut self, expiration: Duration) -> Self {
        self.cache_expiration = expiration;
        self
    }

    /// Set maximum readahead window in bytes
    pub fn max_readahead_window(mut self, bytes: u64) -> Self {
        self.max_readahead_window = bytes;
        self
    }

    /// Enable or disable XOR parity prefetch
    pub fn xor_prefetch(mut self, enable: bool) -> Self {
        self.xor_prefetch = enable;
        self
    }

    /// Set speculative-to-demanded bandwidth ratio
    pub fn bandwidth_overuse(mut self, ratio: f64) -> Self {
        self.bandwidth_overuse = ratio;
        self
    }

    pub fn wave_timeout_model(mut self, model: WaveTimeoutModel) -> Self {
        self.wave_timeout_model = model;
        self
    }

    pub fn xor_policy(mut self, policy: XorPrefetchPolicy) -> Self {
        self.xor_policy = policy;
        self
    }

    pub fn adaptive_readahead(mut self, enable: bool) -> Self {
        self.adaptive_readahead = enable;
        self
    }

    pub fn sequential_tolerance(mut self, bytes: u64) -> Self {
        self.sequential_tolerance = bytes;
        self
    }

    pub fn chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = bytes;
        self
    }

    pub fn block_size(mut self, bytes: u32) -> Self {
        self.block_size = bytes;
        self
    }

    pub fn cache_capacity(mut self, bytes: u64) -> Self {
        self.cache_capacity = bytes;
        self
    }
}

fn parse_var<T, F>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                var: var.to_string(),
                value,
            }),
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
