//! Sliding-window rate limiter backed by the shared counter store.
//!
//! This component only shapes requests to the store and interprets its
//! answers; cross-instance atomicity is the store's job. Every store call is
//! bounded by a timeout, and a timeout is reported exactly like any other
//! store failure so the caller can fall back.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, trace};
use uuid::Uuid;

use super::clock::{Clock, SystemClock};
use super::decision::{Decision, DecisionSource};
use super::identifier::Identifier;
use super::policy::Policy;
use super::store::{CounterStore, WindowCount};
use crate::error::StoreError;

/// Default bound on a single round trip to the shared store.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(200);

/// Default namespace for store keys.
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit";

/// A distributed sliding-window rate limiter.
pub struct DistributedWindowLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    key_prefix: String,
}

impl std::fmt::Debug for DistributedWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedWindowLimiter")
            .field("timeout", &self.timeout)
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl DistributedWindowLimiter {
    /// Create a limiter with the default timeout, key prefix and system clock.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            timeout: DEFAULT_STORE_TIMEOUT,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_key_prefix(mut self, prefix: &str) -> Self {
        self.key_prefix = prefix.to_string();
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Composite store key for a (policy, identifier) pair.
    pub fn store_key(&self, policy: &Policy, identifier: &Identifier) -> String {
        format!("{}:{}:{}", self.key_prefix, policy.name(), identifier)
    }

    /// Record one event and decide whether it is within the policy.
    ///
    /// Returns an error instead of guessing when the store cannot answer.
    pub async fn check(
        &self,
        policy: &Policy,
        identifier: &Identifier,
    ) -> Result<Decision, StoreError> {
        let key = self.store_key(policy, identifier);
        let now_ms = self.clock.now_millis();
        let member = format!("{}-{}", now_ms, Uuid::new_v4());

        trace!(key = %key, now_ms = now_ms, "Checking distributed rate limit");

        let seen = self
            .bounded(self.store.record(&key, policy.window(), now_ms, &member))
            .await?;

        let decision = Decision::from_count(
            seen.count,
            policy.max_requests(),
            self.reset_at(policy, &seen, now_ms),
            DecisionSource::Distributed,
        );

        if decision.is_denied() {
            debug!(
                key = %key,
                count = seen.count,
                limit = policy.max_requests(),
                "Distributed rate limit exceeded"
            );
        }

        Ok(decision)
    }

    /// Report the current quota without recording an event.
    ///
    /// The count is read with a non-mutating store query, but concurrent
    /// writers may land between the read and the caller acting on it, so the
    /// result is approximate. Use it for display, never for enforcement.
    pub async fn peek(
        &self,
        policy: &Policy,
        identifier: &Identifier,
    ) -> Result<Decision, StoreError> {
        let key = self.store_key(policy, identifier);
        let now_ms = self.clock.now_millis();

        let seen = self
            .bounded(self.store.count(&key, policy.window(), now_ms))
            .await?;

        Ok(Decision::from_peek(
            seen.count,
            policy.max_requests(),
            self.reset_at(policy, &seen, now_ms),
            DecisionSource::Distributed,
        ))
    }

    async fn bounded<F>(&self, call: F) -> Result<WindowCount, StoreError>
    where
        F: std::future::Future<Output = Result<WindowCount, StoreError>>,
    {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
    }

    // One slot frees when the oldest in-window event ages out.
    fn reset_at(&self, policy: &Policy, seen: &WindowCount, now_ms: u64) -> DateTime<Utc> {
        let window_ms = u64::try_from(policy.window().as_millis()).unwrap_or(u64::MAX);
        let anchor = seen.oldest_ms.unwrap_or(now_ms);
        let reset_ms = anchor.saturating_add(window_ms);

        i64::try_from(reset_ms)
            .ok()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
