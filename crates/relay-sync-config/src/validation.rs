// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Configuration validation
//!
//! This module provides validation logic to ensure configuration values are
//! consistent, within valid ranges, and don't conflict with each other.

use crate::{ConfigError, ConfigResult, SyncConfig};

/// Validation errors that can occur during config validation
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValidationError {
    ZeroCapacity { field: String },
    TimingConflict { field1: String, field2: String },
    OutOfRange { field: String, value: f64 },
    InvalidValue { field: String, reason: String },
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ZeroCapacity { field } => {
                write!(f, "{} must be greater than zero", field)
            }
            Self::TimingConflict { field1, field2 } => {
                write!(f, "{} must be shorter than {}", field1, field2)
            }
            Self::OutOfRange { field, value } => {
                write!(f, "{} = {} is outside the range (0, 1]", field, value)
            }
            Self::InvalidValue { field, reason } => {
                write!(f, "Invalid configuration value for {}: {}", field, reason)
            }
        }
    }
}

/// Validate the complete configuration
///
/// Checks for:
/// - Zero capacities (limiters, seen set, caches)
/// - Timing conflicts (grace period must end before the list fallback timeout)
/// - Ratios outside (0, 1]
/// - Unknown log levels
///
/// # Errors
///
/// Returns `ConfigError::ValidationError` listing every problem found
pub fn validate_config(config: &SyncConfig) -> ConfigResult<()> {
    let errors = collect_errors(config);

    if !errors.is_empty() {
        let error_messages = errors
            .iter()
            .map(|e| format!("  - {}", e))
            .collect::<Vec<_>>()
            .join("\n");

        return Err(ConfigError::ValidationError(format!(
            "Configuration validation failed:\n{}",
            error_messages
        )));
    }

    Ok(())
}

/// Every validation problem in `config`, in section order
pub fn collect_errors(config: &SyncConfig) -> Vec<ConfigValidationError> {
    let mut errors = Vec::new();

    validate_capacities(config, &mut errors);
    validate_timings(config, &mut errors);
    validate_ratios(config, &mut errors);
    validate_logging(config, &mut errors);

    errors
}

fn validate_capacities(config: &SyncConfig, errors: &mut Vec<ConfigValidationError>) {
    let capacities = [
        ("concurrency.list", config.concurrency.list),
        ("concurrency.single", config.concurrency.single),
        ("concurrency.aggregate", config.concurrency.aggregate),
        ("concurrency.batch", config.concurrency.batch),
        ("concurrency.max_queue", config.concurrency.max_queue),
        ("fetch.seen_cap", config.fetch.seen_cap),
        ("entry_cache.capacity", config.entry_cache.capacity),
        ("query_cache.max_entries", config.query_cache.max_entries),
    ];

    for (field, value) in capacities {
        if value == 0 {
            errors.push(ConfigValidationError::ZeroCapacity {
                field: field.to_string(),
            });
        }
    }

    let intervals = [
        ("fetch.single_timeout_ms", config.fetch.single_timeout_ms),
        ("fetch.aggregate_timeout_ms", config.fetch.aggregate_timeout_ms),
        ("fetch.list_timeout_ms", config.fetch.list_timeout_ms),
        ("query_cache.sweep_interval_ms", config.query_cache.sweep_interval_ms),
        (
            "environment.memory_sample_interval_ms",
            config.environment.memory_sample_interval_ms,
        ),
    ];

    for (field, value) in intervals {
        if value == 0 {
            errors.push(ConfigValidationError::ZeroCapacity {
                field: field.to_string(),
            });
        }
    }
}

fn validate_timings(config: &SyncConfig, errors: &mut Vec<ConfigValidationError>) {
    if config.fetch.grace_ms >= config.fetch.list_timeout_ms {
        errors.push(ConfigValidationError::TimingConflict {
            field1: "fetch.grace_ms".to_string(),
            field2: "fetch.list_timeout_ms".to_string(),
        });
    }
}

fn validate_ratios(config: &SyncConfig, errors: &mut Vec<ConfigValidationError>) {
    let ratios = [
        ("entry_cache.evict_fraction", config.entry_cache.evict_fraction),
        (
            "environment.heap_pressure_ratio",
            config.environment.heap_pressure_ratio,
        ),
    ];

    for (field, value) in ratios {
        if !(value > 0.0 && value <= 1.0) {
            errors.push(ConfigValidationError::OutOfRange {
                field: field.to_string(),
                value,
            });
        }
    }
}

fn validate_logging(config: &SyncConfig, errors: &mut Vec<ConfigValidationError>) {
    let level = config.logging.level.to_lowercase();
    if !matches!(
        level.as_str(),
        "trace" | "debug" | "info" | "warn" | "error" | "off"
    ) {
        errors.push(ConfigValidationError::InvalidValue {
            field: "logging.level".to_string(),
            reason: format!("unknown level '{}'", config.logging.level),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeviceClass;

    #[test]
    fn test_profiles_are_valid() {
        for class in [DeviceClass::Desktop, DeviceClass::Mobile, DeviceClass::LowMemory] {
            assert!(validate_config(&class.profile()).is_ok(), "{} profile", class);
        }
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut config = SyncConfig::default();
        config.concurrency.batch = 0;
        config.fetch.seen_cap = 0;

        let errors = collect_errors(&config);
        assert_eq!(errors.len(), 2);
        assert!(errors.contains(&ConfigValidationError::ZeroCapacity {
            field: "concurrency.batch".to_string()
        }));
    }

    #[test]
    fn test_grace_must_be_shorter_than_list_timeout() {
        let mut config = SyncConfig::default();
        config.fetch.grace_ms = config.fetch.list_timeout_ms;

        let result = validate_config(&config);
        let message = result.unwrap_err().to_string();
        assert!(message.contains("fetch.grace_ms must be shorter than fetch.list_timeout_ms"));
    }

    #[test]
    fn test_ratio_bounds() {
        let mut config = SyncConfig::default();
        config.entry_cache.evict_fraction = 0.0;
        config.environment.heap_pressure_ratio = 1.5;
        assert_eq!(collect_errors(&config).len(), 2);

        config.entry_cache.evict_fraction = 1.0;
        config.environment.heap_pressure_ratio = 0.5;
        assert!(collect_errors(&config).is_empty());
    }

    #[test]
    fn test_errors_are_aggregated() {
        let mut config = SyncConfig::default();
        config.query_cache.max_entries = 0;
        config.logging.level = "loud".to_string();

        match validate_config(&config) {
            Err(ConfigError::ValidationError(message)) => {
                assert!(message.starts_with("Configuration validation failed:"));
                assert_eq!(message.matches("\n  - ").count(), 2);
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }
}
