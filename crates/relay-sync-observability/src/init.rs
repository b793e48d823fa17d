// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Unified logging initialization
//!
//! Installs a console layer and, with the `file-logging` feature, per-crate
//! JSON log files inside a timestamped run folder with retention cleanup.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::cli::CrateDebugFlags;
use crate::config::{LogFormat, LogOutput, LoggingConfig};

static INSTALLED: AtomicBool = AtomicBool::new(false);

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Logging initialization result
///
/// Dropping the guard flushes any pending file output.
pub struct LoggingGuard {
    #[cfg(feature = "file-logging")]
    _file_guards: Vec<tracing_appender::non_blocking::WorkerGuard>,
    log_dir: Option<PathBuf>,
    installed: bool,
}

impl LoggingGuard {
    fn noop() -> Self {
        LoggingGuard {
            #[cfg(feature = "file-logging")]
            _file_guards: Vec::new(),
            log_dir: None,
            installed: false,
        }
    }

    /// Run folder receiving log files, if file output is active
    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }

    /// False when a subscriber was already installed and this call did nothing
    pub fn installed(&self) -> bool {
        self.installed
    }
}

fn build_filter(debug_flags: &CrateDebugFlags, config: &LoggingConfig) -> Result<EnvFilter> {
    let filter = debug_flags.to_filter_string_with_base(&config.level);
    EnvFilter::try_new(&filter).with_context(|| format!("Invalid log filter: {}", filter))
}

/// Initialize logging
///
/// Only the first call installs a subscriber; later calls return a guard
/// whose [`installed`](LoggingGuard::installed) is false.
///
/// With `LogOutput::File` (requires the `file-logging` feature) a folder
/// structure like this is created:
/// ```text
/// ./logs/
///   └── run_20250101_120000/
///       ├── relay-sync-engine.log
///       ├── relay-sync-config.log
///       └── relay-sync.log (combined)
/// ```
pub fn init_logging(debug_flags: &CrateDebugFlags, config: &LoggingConfig) -> Result<LoggingGuard> {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(LoggingGuard::noop());
    }

    let mut layers: Vec<BoxedLayer> = Vec::new();

    // Console layer
    let console_filter = build_filter(debug_flags, config)?;
    let console_layer = match config.format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_file(false)
            .with_line_number(false)
            .with_filter(console_filter)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_filter(console_filter)
            .boxed(),
    };
    layers.push(console_layer);

    let mut guard = LoggingGuard::noop();

    if config.output == LogOutput::File {
        #[cfg(feature = "file-logging")]
        {
            let (file_layers, file_guards, run_folder) = file::build_file_layers(debug_flags, config)?;
            layers.extend(file_layers);
            guard._file_guards = file_guards;
            guard.log_dir = Some(run_folder);
        }
        #[cfg(not(feature = "file-logging"))]
        {
            eprintln!("Warning: file logging requested but the file-logging feature is disabled");
        }
    }

    match Registry::default().with(layers).try_init() {
        Ok(()) => {
            guard.installed = true;
            Ok(guard)
        }
        // Another subscriber owns the global default
        Err(_) => Ok(LoggingGuard::noop()),
    }
}

/// Initialize console logging at the default level
pub fn init_logging_default(debug_flags: &CrateDebugFlags) -> Result<LoggingGuard> {
    init_logging(debug_flags, &LoggingConfig::default())
}

#[cfg(feature = "file-logging")]
mod file {
    use super::*;
    use chrono::{NaiveDateTime, Utc};
    use tracing_appender::rolling;

    pub(super) fn build_file_layers(
        debug_flags: &CrateDebugFlags,
        config: &LoggingConfig,
    ) -> Result<(
        Vec<BoxedLayer>,
        Vec<tracing_appender::non_blocking::WorkerGuard>,
        PathBuf,
    )> {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let run_folder = config.log_dir.join(format!("run_{}", timestamp));
        std::fs::create_dir_all(&run_folder)
            .with_context(|| format!("Failed to create log directory: {}", run_folder.display()))?;

        cleanup_old_logs(&config.log_dir, config.retention_days, config.retention_runs)?;

        let mut layers: Vec<BoxedLayer> = Vec::new();
        let mut guards = Vec::new();

        // One file per crate
        for crate_name in crate::KNOWN_CRATES {
            let appender = rolling::never(&run_folder, format!("{}.log", crate_name));
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);

            let filter = EnvFilter::try_new(format!("off,{}=debug", crate_name.replace('-', "_")))
                .with_context(|| format!("Invalid log filter for {}", crate_name))?;
            layers.push(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .json()
                    .with_filter(filter)
                    .boxed(),
            );
        }

        // Combined log file (all crates)
        let combined_appender = rolling::never(&run_folder, "relay-sync.log");
        let (combined_non_blocking, combined_guard) = tracing_appender::non_blocking(combined_appender);
        guards.push(combined_guard);
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(combined_non_blocking)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .json()
                .with_filter(build_filter(debug_flags, config)?)
                .boxed(),
        );

        Ok((layers, guards, run_folder))
    }

    /// Remove run folders older than `retention_days`, then keep only the newest `retention_runs`
    pub(crate) fn cleanup_old_logs(
        base_log_dir: &Path,
        retention_days: u64,
        retention_runs: usize,
    ) -> Result<()> {
        if !base_log_dir.exists() {
            return Ok(());
        }

        let cutoff = Utc::now().naive_utc() - chrono::Duration::days(retention_days as i64);

        let mut runs: Vec<(PathBuf, NaiveDateTime)> = Vec::new();
        for entry in std::fs::read_dir(base_log_dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let parsed = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("run_"))
                .and_then(|ts| NaiveDateTime::parse_from_str(ts, "%Y%m%d_%H%M%S").ok());
            if let Some(dt) = parsed {
                runs.push((path, dt));
            }
        }

        // Oldest first
        runs.sort_by_key(|(_, dt)| *dt);

        let (expired, mut kept): (Vec<_>, Vec<_>) =
            runs.into_iter().partition(|(_, dt)| *dt < cutoff);

        let excess = kept.len().saturating_sub(retention_runs);
        let to_remove = expired.into_iter().chain(kept.drain(..excess));

        for (path, _) in to_remove {
            if let Err(e) = std::fs::remove_dir_all(&path) {
                eprintln!(
                    "Warning: Failed to remove old log directory {}: {}",
                    path.display(),
                    e
                );
            }
        }

        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use tempfile::tempdir;

        #[test]
        fn test_cleanup_keeps_recent_runs() {
            let dir = tempdir().unwrap();
            let now = Utc::now().naive_utc();
            for minutes in [1, 2, 3, 4] {
                let ts = (now - chrono::Duration::minutes(minutes)).format("%Y%m%d_%H%M%S");
                std::fs::create_dir_all(dir.path().join(format!("run_{}", ts))).unwrap();
            }
            std::fs::create_dir_all(dir.path().join("run_20000101_000000")).unwrap();
            std::fs::create_dir_all(dir.path().join("unrelated")).unwrap();

            cleanup_old_logs(dir.path(), 30, 2).unwrap();

            let remaining: Vec<String> = std::fs::read_dir(dir.path())
                .unwrap()
                .map(|e| e.unwrap().file_name().into_string().unwrap())
                .filter(|n| n.starts_with("run_"))
                .collect();
            assert_eq!(remaining.len(), 2);
            assert!(!remaining.contains(&"run_20000101_000000".to_string()));
            assert!(dir.path().join("unrelated").exists());
        }
    }
}
