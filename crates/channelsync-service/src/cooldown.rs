//! Windowed deduplication of per-actor side effects, such as view counters.
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use moka::ops::compute::{CompResult, Op};
use tokio::time::Instant;

use crate::types::ResourceKey;
use crate::utils::periodic::PeriodicTask;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CooldownKey {
    actor: String,
    resource: ResourceKey,
}

/// Allows a side effect at most once per window for each actor and resource pair.
///
/// A record is kept for every pair that was last allowed. Records older than the window act as
/// absent whether or not they were swept yet, so the sweeper only bounds memory.
#[derive(Debug)]
pub struct CooldownGate {
    window: Duration,
    records: moka::sync::Cache<CooldownKey, Instant>,
    sweeper: Mutex<Option<PeriodicTask>>,
}

impl CooldownGate {
    /// Creates a gate without a background sweeper.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            records: moka::sync::Cache::builder().name("cooldown").build(),
            sweeper: Mutex::new(None),
        }
    }

    /// Creates a gate and starts sweeping stale records every `sweep_interval`.
    ///
    /// The sweeper holds no strong reference to the gate and ends with it, or earlier through
    /// [`shutdown`](Self::shutdown).
    pub fn start(window: Duration, sweep_interval: Duration) -> Arc<Self> {
        let gate = Arc::new(Self::new(window));

        let weak = Arc::downgrade(&gate);
        let sweeper = PeriodicTask::spawn("cooldown-sweep", sweep_interval, move || {
            if let Some(gate) = weak.upgrade() {
                gate.sweep();
            }
        });
        *gate.lock_sweeper() = Some(sweeper);

        gate
    }

    /// The minimum time between two allowed side effects of one pair.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Returns `true` and records the current time if `actor` has not been allowed for
    /// `resource` within the last window.
    ///
    /// The check and the update are a single atomic step per pair, so concurrent calls for one
    /// pair allow at most one of them.
    pub fn allow(&self, actor: &str, resource: &ResourceKey) -> bool {
        let key = CooldownKey {
            actor: actor.to_owned(),
            resource: resource.clone(),
        };
        let now = Instant::now();

        let result = self.records.entry(key).and_compute_with(|last| match last {
            Some(last) if now.duration_since(*last.value()) <= self.window => Op::Nop,
            _ => Op::Put(now),
        });

        let allowed = matches!(result, CompResult::Inserted(_) | CompResult::ReplacedWith(_));
        if allowed {
            metric!(counter("cooldown.allowed") += 1);
        } else {
            metric!(counter("cooldown.suppressed") += 1);
            tracing::trace!(actor, %resource, "Suppressed by cooldown");
        }
        allowed
    }

    /// Removes every record older than the window. Returns the number of removed records.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        for (key, _) in self.records.iter() {
            // re-checked atomically, the pair may have been allowed again in the meantime
            let result = self.records.entry_by_ref(&*key).and_compute_with(|last| match last {
                Some(last) if now.duration_since(*last.value()) > self.window => Op::Remove,
                _ => Op::Nop,
            });
            if matches!(result, CompResult::Removed(_)) {
                removed += 1;
            }
        }

        self.records.run_pending_tasks();
        metric!(gauge("cooldown.records") = self.records.entry_count());
        tracing::debug!(removed, "Swept cooldown records");
        removed
    }

    /// The number of records currently held.
    pub fn len(&self) -> usize {
        self.records.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the background sweeper is running.
    pub fn is_sweeping(&self) -> bool {
        self.lock_sweeper()
            .as_ref()
            .is_some_and(PeriodicTask::is_running)
    }

    /// Stops the background sweeper. The gate itself keeps working.
    pub fn shutdown(&self) {
        if let Some(sweeper) = self.lock_sweeper().take() {
            sweeper.stop();
        }
    }

    fn lock_sweeper(&self) -> std::sync::MutexGuard<'_, Option<PeriodicTask>> {
        self.sweeper.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
