// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Environment signals: visibility, memory pressure and teardown
//!
//! The bus knows nothing about concrete components. Anything that must react
//! implements [`LifecycleParticipant`] and is registered with the bus, which
//! walks the participant list on every transition.
//!
//! | Signal          | Participants                                         |
//! |-----------------|------------------------------------------------------|
//! | hidden          | `on_hidden`, then an orphan sweep is scheduled       |
//! | visible         | `on_visible`; listeners reissue their own fetches    |
//! | memory pressure | `on_memory_pressure` plus an orphan sweep            |
//! | teardown        | `on_teardown`, once                                  |

use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use relay_sync_config::EnvironmentConfig;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::DebouncedBatchCoordinator;
use crate::entry_cache::EntryCache;
use crate::fetch::StreamingFetchController;
use crate::limiter::LimiterPool;
use crate::query_cache::{ApplicationQueryCache, SweepMode};
use crate::registry::SubscriptionRegistry;

const SIGNAL_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Visibility {
    Visible,
    Hidden,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EnvironmentSignal {
    VisibilityChanged(Visibility),
    /// Heap usage ratio when raised by sampling; `None` for explicit reports
    MemoryPressure { used_ratio: Option<f64> },
    Teardown,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HeapSample {
    pub used_bytes: u64,
    pub limit_bytes: u64,
}

impl HeapSample {
    pub fn ratio(&self) -> f64 {
        if self.limit_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.limit_bytes as f64
    }
}

/// Source of heap usage samples
pub trait MemoryProbe: Send + Sync {
    /// Current heap usage; `None` when the platform cannot report it
    fn sample(&self) -> Option<HeapSample>;

    /// Total device memory, used for the low-memory heuristic
    fn total_memory_mb(&self) -> Option<u64> {
        None
    }
}

/// A component reacting to environment transitions
pub trait LifecycleParticipant: Send + Sync {
    fn name(&self) -> &str;

    fn on_hidden(&self) {}

    fn on_visible(&self) {}

    fn on_memory_pressure(&self) {}

    /// Reclaim anything older than `max_age`; returns how much was reclaimed
    fn sweep_orphans(&self, _max_age: Duration) -> usize {
        0
    }

    fn on_teardown(&self) {}
}

impl LifecycleParticipant for SubscriptionRegistry {
    fn name(&self) -> &str {
        "registry"
    }

    fn on_hidden(&self) {
        self.pause_all();
    }

    fn on_visible(&self) {
        self.resume();
    }

    /// Stop live handles without leaving the registry paused
    fn on_memory_pressure(&self) {
        let was_paused = self.is_paused();
        self.pause_all();
        if !was_paused {
            self.resume();
        }
    }

    fn sweep_orphans(&self, max_age: Duration) -> usize {
        self.cleanup_old(max_age)
    }

    fn on_teardown(&self) {
        self.stop_all();
    }
}

impl<K, V> LifecycleParticipant for EntryCache<K, V>
where
    K: Eq + Hash + Clone + Send,
    V: Clone + Send,
{
    fn name(&self) -> &str {
        "entry-cache"
    }

    fn on_hidden(&self) {
        self.clear();
    }

    fn on_memory_pressure(&self) {
        self.clear();
    }

    fn sweep_orphans(&self, _max_age: Duration) -> usize {
        self.purge_expired()
    }

    fn on_teardown(&self) {
        self.clear();
    }
}

impl LifecycleParticipant for LimiterPool {
    fn name(&self) -> &str {
        "limiters"
    }

    fn on_hidden(&self) {
        self.reset_all();
    }

    fn on_memory_pressure(&self) {
        self.reset_all();
    }

    fn on_teardown(&self) {
        self.reset_all();
    }
}

impl<V: Clone + Send + 'static> LifecycleParticipant for ApplicationQueryCache<V> {
    fn name(&self) -> &str {
        "query-cache"
    }

    fn on_visible(&self) {
        self.sweep(SweepMode::Visible);
    }

    fn on_memory_pressure(&self) {
        self.sweep(SweepMode::Pressure);
    }

    fn on_teardown(&self) {
        self.clear();
    }
}

impl LifecycleParticipant for DebouncedBatchCoordinator {
    fn name(&self) -> &str {
        DebouncedBatchCoordinator::name(self)
    }

    fn on_hidden(&self) {
        self.cancel();
    }

    fn on_teardown(&self) {
        self.cancel();
    }
}

impl LifecycleParticipant for StreamingFetchController {
    fn name(&self) -> &str {
        "fetch-controller"
    }

    fn on_teardown(&self) {
        self.shutdown();
    }
}

/// Stops listener delivery when dropped
pub struct ListenerGuard {
    task: JoinHandle<()>,
}

impl fmt::Debug for ListenerGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerGuard")
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Debug)]
struct BusState {
    visibility: Visibility,
    ever_visible: bool,
    under_pressure: bool,
    torn_down: bool,
}

pub struct EnvironmentSignalBus {
    config: EnvironmentConfig,
    state: Mutex<BusState>,
    participants: RwLock<Vec<Arc<dyn LifecycleParticipant>>>,
    signals: broadcast::Sender<EnvironmentSignal>,
    me: Weak<Self>,
}

impl fmt::Debug for EnvironmentSignalBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .participants
            .read()
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        f.debug_struct("EnvironmentSignalBus")
            .field("state", &*self.state.lock())
            .field("participants", &names)
            .finish()
    }
}

impl EnvironmentSignalBus {
    pub fn new(config: EnvironmentConfig, initial: Visibility) -> Arc<Self> {
        let (signals, _) = broadcast::channel(SIGNAL_CHANNEL_CAPACITY);
        Arc::new_cyclic(|me| Self {
            config,
            state: Mutex::new(BusState {
                visibility: initial,
                ever_visible: initial == Visibility::Visible,
                under_pressure: false,
                torn_down: false,
            }),
            participants: RwLock::new(Vec::new()),
            signals,
            me: me.clone(),
        })
    }

    pub fn register(&self, participant: Arc<dyn LifecycleParticipant>) {
        debug!("[ENV] participant {} registered", participant.name());
        self.participants.write().push(participant);
    }

    pub fn participant_names(&self) -> Vec<String> {
        self.participants
            .read()
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Visible, or never yet visible
    ///
    /// A context that starts in the background reports visible until its
    /// first real visible period so it can still perform an initial load.
    pub fn is_visible(&self) -> bool {
        let state = self.state.lock();
        state.visibility == Visibility::Visible || !state.ever_visible
    }

    pub fn has_been_visible(&self) -> bool {
        self.state.lock().ever_visible
    }

    /// Apply a visibility change; false if nothing changed
    pub fn set_visibility(&self, visibility: Visibility) -> bool {
        {
            let mut state = self.state.lock();
            if state.torn_down || state.visibility == visibility {
                return false;
            }
            state.visibility = visibility;
            if visibility == Visibility::Visible {
                state.ever_visible = true;
            }
        }

        let participants = self.participants();
        match visibility {
            Visibility::Hidden => {
                info!("[ENV] hidden: pausing {} participants", participants.len());
                for participant in &participants {
                    participant.on_hidden();
                }
                self.schedule_orphan_sweep();
            }
            Visibility::Visible => {
                info!("[ENV] visible: resuming");
                for participant in &participants {
                    participant.on_visible();
                }
            }
        }
        self.publish(EnvironmentSignal::VisibilityChanged(visibility));
        true
    }

    /// Run the aggressive cleanup regardless of visibility
    pub fn report_memory_pressure(&self) {
        self.raise_memory_pressure(None);
    }

    /// Feed one heap sample; raises pressure when the ratio first crosses
    /// the configured threshold. Returns true if pressure was raised.
    pub fn record_heap_sample(&self, sample: HeapSample) -> bool {
        let ratio = sample.ratio();
        let raise = {
            let mut state = self.state.lock();
            let over = ratio >= self.config.heap_pressure_ratio;
            let raise = over && !state.under_pressure;
            state.under_pressure = over;
            raise
        };
        if raise {
            self.raise_memory_pressure(Some(ratio));
        }
        raise
    }

    /// Sample `probe` every memory sample interval until `token` is cancelled
    ///
    /// Devices at or below the low-memory threshold raise pressure once at
    /// start.
    pub fn start_memory_monitor(
        &self,
        probe: Arc<dyn MemoryProbe>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        if let Some(total_mb) = probe.total_memory_mb() {
            if total_mb <= self.config.low_memory_threshold_mb {
                warn!(
                    "[ENV] low-memory device ({} MB <= {} MB)",
                    total_mb, self.config.low_memory_threshold_mb
                );
                self.report_memory_pressure();
            }
        }

        let me = self.me.clone();
        let interval = self.config.memory_sample_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(bus) = me.upgrade() else { break };
                        if let Some(sample) = probe.sample() {
                            bus.record_heap_sample(sample);
                        }
                    }
                }
            }
            debug!("[ENV] memory monitor stopped");
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EnvironmentSignal> {
        self.signals.subscribe()
    }

    /// Call `callback` on each visibility change until the guard is dropped
    pub fn on_visibility_change<F>(&self, callback: F) -> ListenerGuard
    where
        F: Fn(Visibility) + Send + 'static,
    {
        self.listen(move |signal| {
            if let EnvironmentSignal::VisibilityChanged(visibility) = signal {
                callback(*visibility);
            }
        })
    }

    /// Call `callback` on each memory-pressure signal until the guard is dropped
    pub fn on_memory_pressure<F>(&self, callback: F) -> ListenerGuard
    where
        F: Fn() + Send + 'static,
    {
        self.listen(move |signal| {
            if matches!(signal, EnvironmentSignal::MemoryPressure { .. }) {
                callback();
            }
        })
    }

    /// Synchronous best-effort teardown; only the first call does anything
    pub fn teardown(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.torn_down {
                return false;
            }
            state.torn_down = true;
        }
        let participants = self.participants();
        info!("[ENV] teardown of {} participants", participants.len());
        for participant in &participants {
            participant.on_teardown();
        }
        self.publish(EnvironmentSignal::Teardown);
        true
    }

    pub fn is_torn_down(&self) -> bool {
        self.state.lock().torn_down
    }

    fn participants(&self) -> Vec<Arc<dyn LifecycleParticipant>> {
        self.participants.read().clone()
    }

    fn raise_memory_pressure(&self, used_ratio: Option<f64>) {
        if self.is_torn_down() {
            return;
        }
        match used_ratio {
            Some(ratio) => warn!("[ENV] memory pressure: heap at {:.0}%", ratio * 100.0),
            None => warn!("[ENV] memory pressure reported"),
        }
        let participants = self.participants();
        for participant in &participants {
            participant.on_memory_pressure();
        }
        self.sweep_orphans(&participants);
        self.publish(EnvironmentSignal::MemoryPressure { used_ratio });
    }

    fn schedule_orphan_sweep(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.sweep_orphans(&self.participants());
            return;
        };
        let me = self.me.clone();
        runtime.spawn(async move {
            if let Some(bus) = me.upgrade() {
                bus.sweep_orphans(&bus.participants());
            }
        });
    }

    fn sweep_orphans(&self, participants: &[Arc<dyn LifecycleParticipant>]) -> usize {
        let max_age = self.config.orphan_max_age();
        let reclaimed: usize = participants.iter().map(|p| p.sweep_orphans(max_age)).sum();
        if reclaimed > 0 {
            info!("[ENV] orphan sweep reclaimed {} items", reclaimed);
        }
        reclaimed
    }

    fn publish(&self, signal: EnvironmentSignal) {
        // No receivers is fine
        let _ = self.signals.send(signal);
    }

    fn listen<F>(&self, handler: F) -> ListenerGuard
    where
        F: Fn(&EnvironmentSignal) + Send + 'static,
    {
        let mut rx = self.signals.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(signal) => handler(&signal),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("[ENV] listener lagged, skipped {} signals", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        ListenerGuard { task }
    }
}
