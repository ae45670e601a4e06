//! Abstract interface to the shared sliding-window counter store.
//!
//! The store owns cross-instance atomicity: `record` must append the event
//! and count the trailing window as one indivisible operation. Implementations
//! never decide allow/deny; they only report counts.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::StoreError;

/// Events observed inside the trailing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Number of events with a timestamp inside `(now - window, now]`
    pub count: u64,
    /// Timestamp (ms since epoch) of the oldest event still in the window
    pub oldest_ms: Option<u64>,
}

impl WindowCount {
    pub fn empty() -> Self {
        Self {
            count: 0,
            oldest_ms: None,
        }
    }
}

/// A shared store able to record and count events in a trailing window.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically record one event for `key` at `now_ms` and return the
    /// window contents including it.
    ///
    /// `member` uniquely names the event so concurrent writers never merge.
    async fn record(
        &self,
        key: &str,
        window: Duration,
        now_ms: u64,
        member: &str,
    ) -> Result<WindowCount, StoreError>;

    /// Count the events for `key` in the trailing window without mutating anything.
    async fn count(&self, key: &str, window: Duration, now_ms: u64)
        -> Result<WindowCount, StoreError>;
}

fn window_millis(window: Duration) -> u64 {
    u64::try_from(window.as_millis()).unwrap_or(u64::MAX)
}

fn window_start(window: Duration, now_ms: u64) -> u64 {
    now_ms.saturating_sub(window_millis(window))
}

/// Minimum spacing between expiry sweeps of [`MemoryStore`].
const SWEEP_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Default)]
struct EventLog {
    // event timestamps in ms, oldest first
    events: VecDeque<u64>,
    // same lifetime the Redis store gives a key: one window after the last write
    expires_at_ms: u64,
}

#[derive(Debug, Default)]
struct Logs {
    by_key: HashMap<String, EventLog>,
    next_sweep_ms: u64,
}

impl Logs {
    fn sweep(&mut self, now_ms: u64) -> usize {
        let before = self.by_key.len();
        self.by_key.retain(|_, log| log.expires_at_ms > now_ms);
        before - self.by_key.len()
    }
}

/// In-process sliding log.
///
/// Atomic within one process only; suitable for single-instance deployments
/// and tests, not for coordinating several instances. Keys expire one window
/// after their last event and are dropped by a sweep that piggybacks on
/// `record`.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    logs: Arc<Mutex<Logs>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently holding events, expired or not.
    pub fn key_count(&self) -> usize {
        self.logs.lock().by_key.len()
    }

    /// Drop every key whose last event is older than its window.
    /// Returns the number of keys removed.
    pub fn sweep(&self, now_ms: u64) -> usize {
        self.logs.lock().sweep(now_ms)
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn record(
        &self,
        key: &str,
        window: Duration,
        now_ms: u64,
        _member: &str,
    ) -> Result<WindowCount, StoreError> {
        let start = window_start(window, now_ms);
        let mut logs = self.logs.lock();

        if now_ms >= logs.next_sweep_ms {
            logs.sweep(now_ms);
            logs.next_sweep_ms = now_ms.saturating_add(SWEEP_INTERVAL_MS);
        }

        let log = logs.by_key.entry(key.to_string()).or_default();
        while log.events.front().is_some_and(|&ts| ts <= start) {
            log.events.pop_front();
        }
        log.events.push_back(now_ms);
        log.expires_at_ms = now_ms.saturating_add(window_millis(window));

        Ok(WindowCount {
            count: log.events.len() as u64,
            oldest_ms: log.events.front().copied(),
        })
    }

    async fn count(
        &self,
        key: &str,
        window: Duration,
        now_ms: u64,
    ) -> Result<WindowCount, StoreError> {
        let start = window_start(window, now_ms);
        let logs = self.logs.lock();

        let Some(log) = logs.by_key.get(key) else {
            return Ok(WindowCount::empty());
        };

        let mut in_window = log.events.iter().filter(|&&ts| ts > start && ts <= now_ms);
        let oldest_ms = in_window.next().copied();
        let count = oldest_ms.map_or(0, |_| 1 + in_window.count() as u64);

        Ok(WindowCount { count, oldest_ms })
    }
}
