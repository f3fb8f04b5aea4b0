//! Configuration options for the raster block cache.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::{Error, Result};

/// Budget values below this are taken as megabytes rather than bytes.
const MEGABYTE_THRESHOLD: u64 = 100_000;

/// Environment variable holding the cache budget.
pub const ENV_CACHE_MAX: &str = "RASTERCACHE_CACHEMAX";

/// Environment variable selecting the registry lock strategy.
pub const ENV_LOCK_TYPE: &str = "RASTERCACHE_LOCK_TYPE";

/// Environment variable enabling lock contention tracing.
pub const ENV_DEBUG_CONTENTION: &str = "RASTERCACHE_DEBUG_CONTENTION";

/// Configuration of a [`CacheState`](crate::CacheState).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of bytes kept resident before eviction starts.
    /// Default: 40MB
    pub budget_bytes: usize,

    /// Kind of lock guarding the LRU registry.
    /// Default: LockStrategy::Adaptive
    pub lock_strategy: LockStrategy,

    /// Trace lock hold times and report new maxima at debug level.
    /// Default: false
    pub debug_contention: bool,

    /// Upper bound on blocks evicted by a single allocation.
    /// Default: 64
    pub max_evictions_per_call: usize,

    /// Block directory representation for new bands.
    /// Default: DirectoryMode::Auto
    pub directory_mode: DirectoryMode,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 40 * 1024 * 1024, // 40MB
            lock_strategy: LockStrategy::default(),
            debug_contention: false,
            max_evictions_per_call: 64,
            directory_mode: DirectoryMode::default(),
        }
    }
}

/// Lock used to serialize access to the LRU registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockStrategy {
    /// Parking mutex that spins briefly before sleeping.
    #[default]
    Adaptive,

    /// Reentrant mutex. Registry critical sections never nest, so this only
    /// changes how the owning thread is tracked, not what it may do.
    Recursive,

    /// Pure spin lock. Only sensible when critical sections are tiny.
    Spin,
}

impl FromStr for LockStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ADAPTIVE" => Ok(LockStrategy::Adaptive),
            "RECURSIVE" => Ok(LockStrategy::Recursive),
            "SPIN" => Ok(LockStrategy::Spin),
            other => Err(Error::invalid_argument(format!("unknown lock strategy '{}'", other))),
        }
    }
}

/// How a band's block directory is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectoryMode {
    /// Flat for narrow grids, two-level once a row holds 32 blocks or more.
    #[default]
    Auto,

    /// Always one flat slot array covering the whole grid.
    Flat,

    /// Always lazily allocated 64x64 sub-grids.
    TwoLevel,
}

impl CacheConfig {
    /// Creates a new CacheConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the byte budget.
    pub fn budget_bytes(mut self, bytes: usize) -> Self {
        self.budget_bytes = bytes;
        self
    }

    /// Sets the lock strategy.
    pub fn lock_strategy(mut self, strategy: LockStrategy) -> Self {
        self.lock_strategy = strategy;
        self
    }

    /// Enables or disables lock contention tracing.
    pub fn debug_contention(mut self, value: bool) -> Self {
        self.debug_contention = value;
        self
    }

    /// Sets the per-call eviction cap.
    pub fn max_evictions_per_call(mut self, cap: usize) -> Self {
        self.max_evictions_per_call = cap;
        self
    }

    /// Sets the directory mode.
    pub fn directory_mode(mut self, mode: DirectoryMode) -> Self {
        self.directory_mode = mode;
        self
    }

    /// Parses a cache budget.
    ///
    /// Plain integers are byte counts, except that values below 100000 are
    /// far too small to be a useful byte budget and are read as megabytes.
    pub fn parse_budget(value: &str) -> Result<usize> {
        let raw: u64 = value
            .trim()
            .parse()
            .map_err(|_| Error::invalid_argument(format!("invalid cache budget '{}'", value)))?;

        let bytes = if raw < MEGABYTE_THRESHOLD {
            raw.checked_mul(1024 * 1024)
                .ok_or_else(|| Error::invalid_argument("cache budget overflows"))?
        } else {
            raw
        };

        usize::try_from(bytes).map_err(|_| Error::invalid_argument("cache budget overflows usize"))
    }

    /// Builds a configuration from the process environment.
    ///
    /// Meant for the embedding application; the cache itself never looks at
    /// the environment. Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(value) = std::env::var(ENV_CACHE_MAX) {
            config.budget_bytes = Self::parse_budget(&value)?;
        }
        if let Ok(value) = std::env::var(ENV_LOCK_TYPE) {
            config.lock_strategy = value.parse()?;
        }
        if let Ok(value) = std::env::var(ENV_DEBUG_CONTENTION) {
            config.debug_contention = matches!(
                value.trim().to_ascii_uppercase().as_str(),
                "1" | "YES" | "ON" | "TRUE"
            );
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration and returns an error if it is unusable.
    pub fn validate(&self) -> Result<()> {
        if self.max_evictions_per_call == 0 {
            return Err(Error::invalid_argument("max_evictions_per_call must be > 0"));
        }
        Ok(())
    }
}
