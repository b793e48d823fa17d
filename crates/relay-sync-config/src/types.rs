// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Configuration type definitions
//!
//! This module defines all configuration structs that map to sections in
//! `relay_sync.toml`. Every section falls back to the desktop profile for
//! fields the file leaves out; [`DeviceClass::profile`] provides the tighter
//! budgets used on mobile-class and low-memory devices.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::ConfigError;

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncConfig {
    pub device: DeviceConfig,
    pub fetch: FetchConfig,
    pub batch: BatchConfig,
    pub concurrency: ConcurrencyConfig,
    pub entry_cache: EntryCacheConfig,
    pub query_cache: QueryCacheConfig,
    pub environment: EnvironmentConfig,
    pub logging: LoggingConfig,
}

impl SyncConfig {
    /// Configuration with every section set to the profile of `class`
    pub fn for_device(class: DeviceClass) -> Self {
        class.profile()
    }
}

/// Device class driving the resource budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    #[default]
    Desktop,
    Mobile,
    LowMemory,
}

impl DeviceClass {
    /// Low-total-memory heuristic: devices at or below `threshold_mb` are low-memory.
    ///
    /// Mobile cannot be inferred from memory alone, so anything above the
    /// threshold reports `Desktop`.
    pub fn from_total_memory_mb(total_mb: u64, threshold_mb: u64) -> Self {
        if total_mb <= threshold_mb {
            DeviceClass::LowMemory
        } else {
            DeviceClass::Desktop
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Desktop => "desktop",
            DeviceClass::Mobile => "mobile",
            DeviceClass::LowMemory => "low_memory",
        }
    }

    /// Full configuration tuned for this device class
    pub fn profile(self) -> SyncConfig {
        let desktop = SyncConfig {
            device: DeviceConfig { class: self },
            fetch: FetchConfig::default(),
            batch: BatchConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            entry_cache: EntryCacheConfig::default(),
            query_cache: QueryCacheConfig::default(),
            environment: EnvironmentConfig::default(),
            logging: LoggingConfig::default(),
        };

        match self {
            DeviceClass::Desktop => desktop,
            DeviceClass::Mobile => SyncConfig {
                fetch: FetchConfig {
                    seen_cap: 500,
                    ..desktop.fetch
                },
                concurrency: ConcurrencyConfig {
                    list: 3,
                    single: 4,
                    aggregate: 2,
                    batch: 1,
                    max_queue: 30,
                },
                entry_cache: EntryCacheConfig {
                    capacity: 200,
                    ..desktop.entry_cache
                },
                query_cache: QueryCacheConfig {
                    max_entries: 100,
                    sweep_interval_ms: 30_000,
                },
                environment: EnvironmentConfig {
                    memory_sample_interval_ms: 5_000,
                    ..desktop.environment
                },
                ..desktop
            },
            DeviceClass::LowMemory => SyncConfig {
                fetch: FetchConfig {
                    seen_cap: 500,
                    ..desktop.fetch
                },
                concurrency: ConcurrencyConfig {
                    list: 2,
                    single: 3,
                    aggregate: 1,
                    batch: 1,
                    max_queue: 20,
                },
                entry_cache: EntryCacheConfig {
                    capacity: 100,
                    ttl_ms: 30_000,
                    ..desktop.entry_cache
                },
                query_cache: QueryCacheConfig {
                    max_entries: 50,
                    sweep_interval_ms: 15_000,
                },
                environment: EnvironmentConfig {
                    heap_pressure_ratio: 0.75,
                    memory_sample_interval_ms: 5_000,
                    ..desktop.environment
                },
                ..desktop
            },
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceClass {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "desktop" => Ok(DeviceClass::Desktop),
            "mobile" => Ok(DeviceClass::Mobile),
            "low_memory" | "lowmemory" => Ok(DeviceClass::LowMemory),
            other => Err(ConfigError::UnknownDeviceClass(other.to_string())),
        }
    }
}

/// Device selection
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub class: DeviceClass,
}

/// Streaming fetch timings and per-fetch budgets
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Extra wait after the first end-signal so a slower source can still contribute
    pub grace_ms: u64,
    /// Single-item lookup timeout when the item never arrives
    pub single_timeout_ms: u64,
    /// Absolute timeout for aggregate lookups without incremental delivery
    pub aggregate_timeout_ms: u64,
    /// Hard fallback for list fetches that never receive an end-signal
    pub list_timeout_ms: u64,
    /// Capacity of the per-fetch seen set
    pub seen_cap: usize,
    /// Additional connection attempts after the first failure
    pub connect_retries: u32,
    /// Base backoff between connection attempts
    pub retry_backoff_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            grace_ms: 1_000,
            single_timeout_ms: 2_000,
            aggregate_timeout_ms: 8_000,
            list_timeout_ms: 10_000,
            seen_cap: 1_000,
            connect_retries: 2,
            retry_backoff_ms: 250,
        }
    }
}

impl FetchConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn single_timeout(&self) -> Duration {
        Duration::from_millis(self.single_timeout_ms)
    }

    pub fn aggregate_timeout(&self) -> Duration {
        Duration::from_millis(self.aggregate_timeout_ms)
    }

    pub fn list_timeout(&self) -> Duration {
        Duration::from_millis(self.list_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Debounced batch coordination
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchConfig {
    pub debounce_ms: u64,
    /// Interval after which the already-requested set is cleared
    pub requested_reset_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            requested_reset_ms: 30_000,
        }
    }
}

impl BatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn requested_reset(&self) -> Duration {
        Duration::from_millis(self.requested_reset_ms)
    }
}

/// Concurrency caps per resource class
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub list: usize,
    pub single: usize,
    pub aggregate: usize,
    pub batch: usize,
    /// Capacity of each limiter's pending queue
    pub max_queue: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            list: 6,
            single: 8,
            aggregate: 4,
            batch: 2,
            max_queue: 50,
        }
    }
}

/// TTL cache for low-churn aggregates
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EntryCacheConfig {
    pub ttl_ms: u64,
    pub capacity: usize,
    /// Share of entries evicted when a write finds the cache full
    pub evict_fraction: f64,
}

impl Default for EntryCacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 60_000,
            capacity: 500,
            evict_fraction: 0.2,
        }
    }
}

impl EntryCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Application-wide result cache
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct QueryCacheConfig {
    pub max_entries: usize,
    pub sweep_interval_ms: u64,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 200,
            sweep_interval_ms: 60_000,
        }
    }
}

impl QueryCacheConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Stricter cap applied by memory-pressure sweeps
    pub fn pressure_max_entries(&self) -> usize {
        (self.max_entries / 2).max(1)
    }
}

/// Environment signal handling
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Subscriptions older than this are reclaimed as orphans
    pub orphan_max_age_ms: u64,
    /// Heap usage ratio (used / limit) at which memory pressure is raised
    pub heap_pressure_ratio: f64,
    pub memory_sample_interval_ms: u64,
    /// Devices with at most this much total memory are treated as low-memory
    pub low_memory_threshold_mb: u64,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            orphan_max_age_ms: 300_000,
            heap_pressure_ratio: 0.85,
            memory_sample_interval_ms: 10_000,
            low_memory_threshold_mb: 2_048,
        }
    }
}

impl EnvironmentConfig {
    pub fn orphan_max_age(&self) -> Duration {
        Duration::from_millis(self.orphan_max_age_ms)
    }

    pub fn memory_sample_interval(&self) -> Duration {
        Duration::from_millis(self.memory_sample_interval_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desktop_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.device.class, DeviceClass::Desktop);
        assert_eq!(config.fetch.grace(), Duration::from_secs(1));
        assert_eq!(config.fetch.single_timeout(), Duration::from_secs(2));
        assert_eq!(config.fetch.aggregate_timeout(), Duration::from_secs(8));
        assert_eq!(config.batch.debounce(), Duration::from_millis(100));
        assert_eq!(config.concurrency.max_queue, 50);
    }

    #[test]
    fn test_profiles_tighten_budgets() {
        let desktop = DeviceClass::Desktop.profile();
        let mobile = DeviceClass::Mobile.profile();
        let low = DeviceClass::LowMemory.profile();

        assert!(mobile.concurrency.list < desktop.concurrency.list);
        assert!(low.concurrency.list < mobile.concurrency.list);
        assert!(low.query_cache.sweep_interval_ms < desktop.query_cache.sweep_interval_ms);
        assert_eq!(mobile.device.class, DeviceClass::Mobile);
        // Timings are shared across classes
        assert_eq!(low.fetch.grace_ms, desktop.fetch.grace_ms);
    }

    #[test]
    fn test_device_class_parsing() {
        assert_eq!("mobile".parse::<DeviceClass>().unwrap(), DeviceClass::Mobile);
        assert_eq!("Low-Memory".parse::<DeviceClass>().unwrap(), DeviceClass::LowMemory);
        assert!("toaster".parse::<DeviceClass>().is_err());
    }

    #[test]
    fn test_low_memory_heuristic() {
        assert_eq!(DeviceClass::from_total_memory_mb(1_024, 2_048), DeviceClass::LowMemory);
        assert_eq!(DeviceClass::from_total_memory_mb(2_048, 2_048), DeviceClass::LowMemory);
        assert_eq!(DeviceClass::from_total_memory_mb(8_192, 2_048), DeviceClass::Desktop);
    }

    #[test]
    fn test_pressure_cap_is_half() {
        let config = QueryCacheConfig {
            max_entries: 200,
            sweep_interval_ms: 1,
        };
        assert_eq!(config.pressure_max_entries(), 100);

        let tiny = QueryCacheConfig {
            max_entries: 1,
            sweep_interval_ms: 1,
        };
        assert_eq!(tiny.pressure_max_entries(), 1);
    }

    #[test]
    fn test_serde_round_trip_uses_snake_case_class() {
        let config = DeviceClass::LowMemory.profile();
        let json = serde_json::to_string(&config.device).unwrap();
        assert!(json.contains("low_memory"));
    }
}
