// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # relay-sync
//!
//! Streaming synchronization and resource-bounded subscriptions for clients of
//! a decentralized pub/sub relay network: live queries merged from racing
//! sources without duplicates, settled exactly once, gated by per-class
//! concurrency limits and reacting to visibility and memory pressure.
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! relay-sync = "0.1"  # Default: engine + config + observability
//! ```
//!
//! ## Feature Flags
//!
//! - **`engine`** (default): fetch controller, registry, limiters, caches,
//!   batching, environment signals
//! - **`config`** (default): TOML loader with device-class profiles
//! - **`observability`** (default): logging initialisation and debug flags
//! - **`file-logging`**: per-run JSON log files with retention
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use relay_sync::prelude::*;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config_or_default(None, None)?;
//! let logging = LoggingConfig::with_level(config.logging.level.clone());
//! let _guard = init_logging(&parse_debug_flags(), &logging)?;
//!
//! let relay = Arc::new(MemoryRelay::new("local"));
//! let engine = SyncEngine::new(config, relay);
//! engine.start_background_tasks(None);
//!
//! let feed = engine.controller().start(
//!     FetchRequest::list(Filter::new().author("alice").kind(1)),
//!     |snapshot| println!("{} notes so far", snapshot.len()),
//!     |settled| println!("settled: {:?}", settled.reason),
//! );
//! # feed.cancel();
//! engine.shutdown();
//! # Ok(())
//! # }
//! ```

#[cfg(feature = "config")]
pub use relay_sync_config as config;

#[cfg(feature = "observability")]
pub use relay_sync_observability as observability;

#[cfg(feature = "engine")]
pub use relay_sync_engine as engine;

/// Prelude - commonly used types and traits
pub mod prelude {
    #[cfg(feature = "config")]
    pub use crate::config::{load_config, load_config_or_default, DeviceClass, SyncConfig};

    #[cfg(feature = "observability")]
    pub use crate::observability::{
        init_logging, parse_debug_flags, CrateDebugFlags, LoggingConfig, LoggingGuard,
    };

    #[cfg(feature = "engine")]
    pub use crate::engine::{
        Event, FetchHandle, FetchRequest, Filter, MemoryRelay, RelayClient, SettleReason,
        Settlement, SyncEngine, Visibility,
    };
}
