//! Engine configuration: cache memory budget and transaction timeouts.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ConfigError;
use crate::types::{MIN_CACHE_PAGES, PAGE_SIZE};

pub const KB: u64 = 1 << 10;
pub const MB: u64 = 1 << 20;
pub const GB: u64 = 1 << 30;

/// Default page cache budget (64 MB).
pub const DEFAULT_MEMORY: u64 = 64 * MB;

/// Default auto-abort timeout for active transactions.
pub const DEFAULT_TXN_TIMEOUT_MS: u64 = 30_000;

/// Default period of the timeout sweeper.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1_000;

/// Runtime configuration for a database instance.
///
/// ```
/// use tidedb_core::config::EngineConfig;
///
/// let config = EngineConfig::from_json(r#"{ "memory": "16MB", "txn_timeout_ms": null }"#).unwrap();
/// assert_eq!(config.memory, 16 << 20);
/// assert!(config.txn_timeout().is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Page cache budget in bytes. Accepts `"64MB"`-style strings.
    #[serde(deserialize_with = "deserialize_memory")]
    pub memory: u64,
    /// Active transactions older than this are force-aborted. `None` disables
    /// the sweeper.
    pub txn_timeout_ms: Option<u64>,
    pub sweep_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory: DEFAULT_MEMORY,
            txn_timeout_ms: Some(DEFAULT_TXN_TIMEOUT_MS),
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON config. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set the page cache budget in bytes.
    pub fn with_memory(mut self, memory: u64) -> Self {
        self.memory = memory;
        self
    }

    /// Set (or clear) the transaction timeout.
    pub fn with_txn_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.txn_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    /// Set the sweeper period.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn txn_timeout(&self) -> Option<Duration> {
        self.txn_timeout_ms.map(Duration::from_millis)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    /// Number of pages the cache may hold.
    ///
    /// Fails if the budget buys fewer than [`MIN_CACHE_PAGES`] pages.
    pub fn page_capacity(&self) -> Result<usize, ConfigError> {
        let pages = (self.memory / PAGE_SIZE as u64) as usize;
        if pages < MIN_CACHE_PAGES {
            return Err(ConfigError::MemoryTooSmall {
                pages,
                min_pages: MIN_CACHE_PAGES,
            });
        }
        Ok(pages)
    }
}

/// Parse a memory size such as `"64MB"`, `"512KB"` or `"1GB"`.
pub fn parse_memory(s: &str) -> Result<u64, ConfigError> {
    let s = s.trim();
    if s.len() < 3 {
        return Err(ConfigError::InvalidMemory(s.to_string()));
    }
    let (num, unit) = s.split_at(s.len() - 2);
    let multiplier = match unit.to_ascii_uppercase().as_str() {
        "KB" => KB,
        "MB" => MB,
        "GB" => GB,
        _ => return Err(ConfigError::InvalidMemory(s.to_string())),
    };
    let num: u64 = num
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidMemory(s.to_string()))?;
    num.checked_mul(multiplier)
        .ok_or_else(|| ConfigError::InvalidMemory(s.to_string()))
}

fn deserialize_memory<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Memory {
        Bytes(u64),
        Text(String),
    }

    match Memory::deserialize(deserializer)? {
        Memory::Bytes(n) => Ok(n),
        Memory::Text(s) => parse_memory(&s).map_err(serde::de::Error::custom),
    }
}
