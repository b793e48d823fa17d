// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Configuration file loading with override support
//!
//! This module implements the layered configuration loading system:
//! 1. Device-class profile (base defaults)
//! 2. TOML file (fields present in the file replace the profile values)
//! 3. Environment variables (runtime overrides)
//! 4. CLI arguments (explicit user overrides)

use crate::{validate_config, ConfigError, ConfigResult, DeviceClass, SyncConfig};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Default configuration file name
pub const CONFIG_FILE_NAME: &str = "relay_sync.toml";

/// Environment variable pointing at an explicit configuration file
pub const CONFIG_PATH_ENV: &str = "RELAY_SYNC_CONFIG_PATH";

const DEVICE_CLASS_ENV: &str = "RELAY_SYNC_DEVICE_CLASS";

/// Find the relay-sync configuration file
///
/// Search order:
/// 1. `RELAY_SYNC_CONFIG_PATH` environment variable
/// 2. Current working directory: `./relay_sync.toml`
/// 3. Parent directories (up to 5 levels)
///
/// # Errors
///
/// Returns `ConfigError::FileNotFound` if no config file is found in any location
pub fn find_config_file() -> ConfigResult<PathBuf> {
    if let Ok(env_path) = env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        } else {
            return Err(ConfigError::FileNotFound(format!(
                "Config file specified by {} not found: {}",
                CONFIG_PATH_ENV,
                path.display()
            )));
        }
    }

    let mut search_paths = Vec::new();

    if let Ok(cwd) = env::current_dir() {
        search_paths.push(cwd.join(CONFIG_FILE_NAME));

        let mut current = cwd.clone();
        for _ in 0..5 {
            if let Some(parent) = current.parent() {
                search_paths.push(parent.join(CONFIG_FILE_NAME));
                current = parent.to_path_buf();
            }
        }
    }

    for path in &search_paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    let search_list = search_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    Err(ConfigError::FileNotFound(format!(
        "Configuration file '{}' not found in any of these locations:\n{}\n\nSet {} environment variable to specify custom location.",
        CONFIG_FILE_NAME, search_list, CONFIG_PATH_ENV
    )))
}

/// Load configuration from a TOML file
///
/// # Arguments
///
/// * `config_path` - Optional path to config file. If `None`, will search for config file.
/// * `cli_args` - Optional CLI argument overrides
///
/// # Returns
///
/// Complete, validated `SyncConfig` with all overrides applied
///
/// # Errors
///
/// Returns error if config file is not found, contains invalid TOML, or fails validation
pub fn load_config(
    config_path: Option<&Path>,
    cli_args: Option<&HashMap<String, String>>,
) -> ConfigResult<SyncConfig> {
    let config_file = if let Some(path) = config_path {
        path.to_path_buf()
    } else {
        find_config_file()?
    };

    let content = fs::read_to_string(&config_file)?;
    build_config(Some(&content), cli_args)
}

/// Load configuration, falling back to device-class defaults when no file exists
///
/// Environment and CLI overrides are still applied to the defaults.
pub fn load_config_or_default(
    config_path: Option<&Path>,
    cli_args: Option<&HashMap<String, String>>,
) -> ConfigResult<SyncConfig> {
    match config_path {
        Some(path) => load_config(Some(path), cli_args),
        None => match find_config_file() {
            Ok(path) => load_config(Some(&path), cli_args),
            Err(ConfigError::FileNotFound(_)) => build_config(None, cli_args),
            Err(e) => Err(e),
        },
    }
}

fn build_config(
    file_content: Option<&str>,
    cli_args: Option<&HashMap<String, String>>,
) -> ConfigResult<SyncConfig> {
    let file_value: Option<toml::Value> = match file_content {
        Some(content) => Some(toml::from_str(content)?),
        None => None,
    };

    let class = resolve_device_class(file_value.as_ref(), cli_args)?;

    // Start from the profile so that fields absent from the file keep the
    // class-specific budget instead of the desktop default.
    let mut base = toml::Value::try_from(class.profile())
        .map_err(|e| ConfigError::ParseError(e.to_string()))?;
    if let Some(overlay) = file_value {
        merge_values(&mut base, overlay);
    }

    let mut config: SyncConfig = base
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::ParseError(e.to_string()))?;
    config.device.class = class;

    apply_environment_overrides(&mut config)?;

    if let Some(cli) = cli_args {
        apply_cli_overrides(&mut config, cli)?;
    }

    validate_config(&config)?;
    Ok(config)
}

/// Device class precedence: CLI, then environment, then file, then desktop
fn resolve_device_class(
    file_value: Option<&toml::Value>,
    cli_args: Option<&HashMap<String, String>>,
) -> ConfigResult<DeviceClass> {
    if let Some(value) = cli_args.and_then(|cli| cli.get("device.class")) {
        return value.parse();
    }
    if let Ok(value) = env::var(DEVICE_CLASS_ENV) {
        return value.parse();
    }
    match file_value
        .and_then(|v| v.get("device"))
        .and_then(|d| d.get("class"))
        .and_then(|c| c.as_str())
    {
        Some(class) => class.parse(),
        None => Ok(DeviceClass::default()),
    }
}

/// Recursively overlay `overlay` onto `base`; tables merge, other values replace
fn merge_values(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn parse_into<T: std::str::FromStr>(
    key: &str,
    value: &str,
    target: &mut T,
) -> ConfigResult<()> {
    *target = value.trim().parse::<T>().map_err(|_| {
        ConfigError::InvalidValue(format!("{} = {:?} could not be parsed", key, value))
    })?;
    Ok(())
}

/// Apply environment variable overrides to configuration
///
/// Supported environment variables:
/// - `RELAY_SYNC_DEVICE_CLASS` -> `device.class` (resolved before the profile is chosen)
/// - `RELAY_SYNC_GRACE_MS` -> `fetch.grace_ms`
/// - `RELAY_SYNC_SINGLE_TIMEOUT_MS` -> `fetch.single_timeout_ms`
/// - `RELAY_SYNC_AGGREGATE_TIMEOUT_MS` -> `fetch.aggregate_timeout_ms`
/// - `RELAY_SYNC_LIST_TIMEOUT_MS` -> `fetch.list_timeout_ms`
/// - `RELAY_SYNC_SEEN_CAP` -> `fetch.seen_cap`
/// - `RELAY_SYNC_DEBOUNCE_MS` -> `batch.debounce_ms`
/// - `RELAY_SYNC_MAX_LIST_FETCHES` -> `concurrency.list`
/// - `RELAY_SYNC_MAX_QUEUE` -> `concurrency.max_queue`
/// - `RELAY_SYNC_ENTRY_TTL_MS` -> `entry_cache.ttl_ms`
/// - `RELAY_SYNC_QUERY_CACHE_MAX` -> `query_cache.max_entries`
/// - `RELAY_SYNC_LOG_LEVEL` -> `logging.level`
pub fn apply_environment_overrides(config: &mut SyncConfig) -> ConfigResult<()> {
    // Fetch timings
    if let Ok(value) = env::var("RELAY_SYNC_GRACE_MS") {
        parse_into("RELAY_SYNC_GRACE_MS", &value, &mut config.fetch.grace_ms)?;
    }
    if let Ok(value) = env::var("RELAY_SYNC_SINGLE_TIMEOUT_MS") {
        parse_into("RELAY_SYNC_SINGLE_TIMEOUT_MS", &value, &mut config.fetch.single_timeout_ms)?;
    }
    if let Ok(value) = env::var("RELAY_SYNC_AGGREGATE_TIMEOUT_MS") {
        parse_into("RELAY_SYNC_AGGREGATE_TIMEOUT_MS", &value, &mut config.fetch.aggregate_timeout_ms)?;
    }
    if let Ok(value) = env::var("RELAY_SYNC_LIST_TIMEOUT_MS") {
        parse_into("RELAY_SYNC_LIST_TIMEOUT_MS", &value, &mut config.fetch.list_timeout_ms)?;
    }
    if let Ok(value) = env::var("RELAY_SYNC_SEEN_CAP") {
        parse_into("RELAY_SYNC_SEEN_CAP", &value, &mut config.fetch.seen_cap)?;
    }

    // Batching
    if let Ok(value) = env::var("RELAY_SYNC_DEBOUNCE_MS") {
        parse_into("RELAY_SYNC_DEBOUNCE_MS", &value, &mut config.batch.debounce_ms)?;
    }

    // Concurrency
    if let Ok(value) = env::var("RELAY_SYNC_MAX_LIST_FETCHES") {
        parse_into("RELAY_SYNC_MAX_LIST_FETCHES", &value, &mut config.concurrency.list)?;
    }
    if let Ok(value) = env::var("RELAY_SYNC_MAX_QUEUE") {
        parse_into("RELAY_SYNC_MAX_QUEUE", &value, &mut config.concurrency.max_queue)?;
    }

    // Caches
    if let Ok(value) = env::var("RELAY_SYNC_ENTRY_TTL_MS") {
        parse_into("RELAY_SYNC_ENTRY_TTL_MS", &value, &mut config.entry_cache.ttl_ms)?;
    }
    if let Ok(value) = env::var("RELAY_SYNC_QUERY_CACHE_MAX") {
        parse_into("RELAY_SYNC_QUERY_CACHE_MAX", &value, &mut config.query_cache.max_entries)?;
    }

    if let Ok(value) = env::var("RELAY_SYNC_LOG_LEVEL") {
        config.logging.level = value;
    }
    Ok(())
}

/// Apply CLI argument overrides to configuration
///
/// Keys are dotted `section.field` paths matching `relay_sync.toml`.
/// Unknown keys are ignored; unparseable values are rejected.
///
/// # Arguments
///
/// * `config` - Configuration to modify
/// * `cli_args` - HashMap of CLI arguments (e.g., `{"fetch.grace_ms": "1500", "concurrency.list": "3"}`)
pub fn apply_cli_overrides(
    config: &mut SyncConfig,
    cli_args: &HashMap<String, String>,
) -> ConfigResult<()> {
    for (key, value) in cli_args {
        match key.as_str() {
            "fetch.grace_ms" => parse_into(key, value, &mut config.fetch.grace_ms)?,
            "fetch.single_timeout_ms" => parse_into(key, value, &mut config.fetch.single_timeout_ms)?,
            "fetch.aggregate_timeout_ms" => {
                parse_into(key, value, &mut config.fetch.aggregate_timeout_ms)?
            }
            "fetch.list_timeout_ms" => parse_into(key, value, &mut config.fetch.list_timeout_ms)?,
            "fetch.seen_cap" => parse_into(key, value, &mut config.fetch.seen_cap)?,
            "fetch.connect_retries" => parse_into(key, value, &mut config.fetch.connect_retries)?,
            "fetch.retry_backoff_ms" => parse_into(key, value, &mut config.fetch.retry_backoff_ms)?,
            "batch.debounce_ms" => parse_into(key, value, &mut config.batch.debounce_ms)?,
            "batch.requested_reset_ms" => parse_into(key, value, &mut config.batch.requested_reset_ms)?,
            "concurrency.list" => parse_into(key, value, &mut config.concurrency.list)?,
            "concurrency.single" => parse_into(key, value, &mut config.concurrency.single)?,
            "concurrency.aggregate" => parse_into(key, value, &mut config.concurrency.aggregate)?,
            "concurrency.batch" => parse_into(key, value, &mut config.concurrency.batch)?,
            "concurrency.max_queue" => parse_into(key, value, &mut config.concurrency.max_queue)?,
            "entry_cache.ttl_ms" => parse_into(key, value, &mut config.entry_cache.ttl_ms)?,
            "entry_cache.capacity" => parse_into(key, value, &mut config.entry_cache.capacity)?,
            "entry_cache.evict_fraction" => {
                parse_into(key, value, &mut config.entry_cache.evict_fraction)?
            }
            "query_cache.max_entries" => parse_into(key, value, &mut config.query_cache.max_entries)?,
            "query_cache.sweep_interval_ms" => {
                parse_into(key, value, &mut config.query_cache.sweep_interval_ms)?
            }
            "environment.orphan_max_age_ms" => {
                parse_into(key, value, &mut config.environment.orphan_max_age_ms)?
            }
            "environment.heap_pressure_ratio" => {
                parse_into(key, value, &mut config.environment.heap_pressure_ratio)?
            }
            "environment.memory_sample_interval_ms" => {
                parse_into(key, value, &mut config.environment.memory_sample_interval_ms)?
            }
            "logging.level" => config.logging.level = value.clone(),
            _ => {}
        }
    }
    Ok(())
}
