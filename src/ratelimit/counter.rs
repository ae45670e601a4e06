//! Process-local fixed-window counters used when the shared store is unreachable.
//!
//! Entries live in a sharded [`DashMap`], so concurrent checks only contend
//! when they hash to the same shard. Expired entries stay in the map until
//! the garbage collector sweeps them; a check against an expired entry
//! simply starts a new window in place.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::decision::{Decision, DecisionSource};
use super::identifier::Identifier;
use super::policy::Policy;

/// Default interval between garbage collection sweeps.
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CounterKey {
    policy: String,
    identifier: Identifier,
}

impl CounterKey {
    fn new(policy: &Policy, identifier: &Identifier) -> Self {
        Self {
            policy: policy.name().to_string(),
            identifier: identifier.clone(),
        }
    }
}

/// Count of checks seen in the current fixed window for one (policy, identifier).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterEntry {
    pub count: u64,
    pub window_reset_at: DateTime<Utc>,
}

impl CounterEntry {
    fn fresh(now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            count: 0,
            window_reset_at: reset_after(now, window),
        }
    }

    /// Whether the window this entry counts has elapsed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.window_reset_at
    }
}

// Saturates at the latest representable instant for very long windows.
fn reset_after(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| now.checked_add_signed(window))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// In-memory fixed-window rate limit counter.
///
/// This struct is thread-safe and can be shared across multiple tasks.
#[derive(Debug)]
pub struct LocalWindowCounter {
    entries: DashMap<CounterKey, CounterEntry>,
    clock: Arc<dyn Clock>,
}

impl Default for LocalWindowCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalWindowCounter {
    /// Create a counter driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Record one check and decide whether it is within the policy.
    pub fn check(&self, policy: &Policy, identifier: &Identifier) -> Decision {
        let now = self.clock.now();
        let key = CounterKey::new(policy, identifier);

        let (count, reset_at) = {
            let mut entry = self
                .entries
                .entry(key)
                .or_insert_with(|| CounterEntry::fresh(now, policy.window()));

            if entry.is_expired(now) {
                *entry = CounterEntry::fresh(now, policy.window());
            }

            entry.count += 1;
            (entry.count, entry.window_reset_at)
        };

        trace!(
            policy = policy.name(),
            identifier = %identifier,
            count = count,
            "Local window check"
        );

        Decision::from_count(count, policy.max_requests(), reset_at, DecisionSource::Local)
    }

    /// Report the current quota without recording a check.
    pub fn peek(&self, policy: &Policy, identifier: &Identifier) -> Decision {
        let now = self.clock.now();
        let key = CounterKey::new(policy, identifier);

        let entry = self
            .entries
            .get(&key)
            .map(|entry| *entry)
            .filter(|entry| !entry.is_expired(now))
            .unwrap_or_else(|| CounterEntry::fresh(now, policy.window()));

        Decision::from_peek(
            entry.count,
            policy.max_requests(),
            entry.window_reset_at,
            DecisionSource::Local,
        )
    }

    /// Current entry for a key, including expired-but-unswept ones.
    pub fn entry(&self, policy: &Policy, identifier: &Identifier) -> Option<CounterEntry> {
        let key = CounterKey::new(policy, identifier);
        self.entries.get(&key).map(|entry| *entry)
    }

    /// Remove every entry whose window has elapsed. Returns how many were removed.
    ///
    /// Shards are locked one at a time, so concurrent checks wait at most for
    /// one shard's scan.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());

        if removed > 0 {
            debug!(
                removed = removed,
                remaining = self.entries.len(),
                "Swept expired local counters"
            );
        }
        removed
    }

    /// Number of tracked entries, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all entries.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Start the periodic sweep on the current tokio runtime.
    ///
    /// The task holds only a weak reference and stops once the counter is
    /// dropped; dropping the returned handle stops it immediately.
    pub fn spawn_gc(self: &Arc<Self>, every: Duration) -> GcHandle {
        let counter: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match counter.upgrade() {
                    Some(counter) => {
                        counter.sweep();
                    }
                    None => break,
                }
            }
        });

        GcHandle { handle }
    }
}

/// Owner of the garbage collection task; aborts it on drop.
#[derive(Debug)]
pub struct GcHandle {
    handle: JoinHandle<()>,
}

impl GcHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for GcHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
