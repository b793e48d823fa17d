// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # relay-sync-observability
//!
//! Logging infrastructure shared by the relay-sync crates.
//!
//! Provides a single `init_logging` entry point and per-crate debug flags
//! (`--debug-relay-sync-engine`, `RELAY_SYNC_DEBUG=all`, ...).
//!
//! ## Features
//! - `file-logging`: JSON log files per crate with run-folder retention

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod cli;
pub mod config;
pub mod init;

pub use cli::*;
pub use config::*;
pub use init::*;

/// Known relay-sync crate names for debug flags
pub const KNOWN_CRATES: &[&str] = &[
    "relay-sync",
    "relay-sync-engine",
    "relay-sync-config",
    "relay-sync-observability",
];
