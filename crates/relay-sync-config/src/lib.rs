// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # relay-sync Configuration System
//!
//! Type-safe configuration loader for the relay-sync engine with support for:
//! - TOML file parsing
//! - Device-class profiles (desktop, mobile, low-memory)
//! - Environment variable overrides
//! - CLI argument overrides
//!
//! ## Usage
//!
//! ```rust,no_run
//! use relay_sync_config::{load_config_or_default, SyncConfig};
//!
//! // Load configuration with automatic file discovery and overrides
//! let config: SyncConfig = load_config_or_default(None, None).expect("Failed to load config");
//!
//! // Access type-safe configuration values
//! println!("Grace period: {:?}", config.fetch.grace());
//! println!("List concurrency: {}", config.concurrency.list);
//! ```
//!
//! Every tunable of the engine lives here: end-signal grace delay, single-item
//! timeout, aggregate timeout, batch debounce window, concurrency caps,
//! seen-set caps, cache TTLs and capacities, and sweep intervals.

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod loader;
pub mod types;
pub mod validation;

pub use loader::{
    apply_cli_overrides, apply_environment_overrides, find_config_file, load_config,
    load_config_or_default, CONFIG_FILE_NAME, CONFIG_PATH_ENV,
};
pub use types::*;
pub use validation::{validate_config, ConfigValidationError};

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found. Searched: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML syntax: {0}")]
    ParseError(String),

    #[error("Validation failed: {0}")]
    ValidationError(String),

    #[error("Unknown device class: {0}")]
    UnknownDeviceClass(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;
