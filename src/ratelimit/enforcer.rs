//! Policy enforcement with distributed-first, local-fallback semantics.
//!
//! While the shared store answers, every instance enforces one global
//! sliding window per (policy, identifier). When it does not, each instance
//! enforces the policy on its own fixed-window counter, so the effective
//! global ceiling becomes `max_requests x live instances` until the store
//! recovers. Every such fallback is logged at `warn` and counted in
//! [`EnforcerStats`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::counter::{GcHandle, LocalWindowCounter, DEFAULT_GC_INTERVAL};
use super::decision::Decision;
use super::distributed::{DistributedWindowLimiter, DEFAULT_KEY_PREFIX, DEFAULT_STORE_TIMEOUT};
use super::identifier::{Identifier, IdentifierResolver, RequestMetadata};
use super::policy::{Policy, PolicyRegistry};
use super::redis::RedisStore;
use super::status::StatusInspector;
use super::store::CounterStore;
use crate::config::FloodgateConfig;
use crate::error::Result;

/// Running totals describing how checks were answered.
#[derive(Debug, Default)]
pub struct EnforcerStats {
    distributed_checks: AtomicU64,
    local_checks: AtomicU64,
    fallbacks: AtomicU64,
    rejections: AtomicU64,
}

/// Point-in-time copy of [`EnforcerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Checks answered by the shared store
    pub distributed_checks: u64,
    /// Checks answered by the local counter, including fallbacks
    pub local_checks: u64,
    /// Checks that fell back because the store was unavailable
    pub fallbacks: u64,
    /// Checks that were rejected, on either path
    pub rejections: u64,
}

impl EnforcerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            distributed_checks: self.distributed_checks.load(Ordering::Relaxed),
            local_checks: self.local_checks.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
        }
    }
}

/// The entry point protected operations call before doing any work.
///
/// This struct is thread-safe and can be shared across multiple tasks.
#[derive(Debug)]
pub struct LimitEnforcer {
    registry: Arc<PolicyRegistry>,
    resolver: IdentifierResolver,
    distributed: Option<Arc<DistributedWindowLimiter>>,
    local: Arc<LocalWindowCounter>,
    clock: Arc<dyn Clock>,
    stats: EnforcerStats,
    _gc: Option<GcHandle>,
}

impl LimitEnforcer {
    pub fn builder(registry: PolicyRegistry) -> LimitEnforcerBuilder {
        LimitEnforcerBuilder::new(registry)
    }

    /// Build an enforcer from loaded configuration, connecting to Redis if a
    /// store URL is configured.
    ///
    /// An unreachable store at startup does not fail construction; the
    /// enforcer then runs on the local path only.
    pub async fn from_config(config: &FloodgateConfig) -> Result<Self> {
        let registry = PolicyRegistry::from_configs(config.policies.clone())?;
        let timeout = config.store.timeout();

        let mut builder = Self::builder(registry)
            .store_timeout(timeout)
            .key_prefix(&config.store.key_prefix)
            .gc_interval(config.local.gc_interval())
            .resolver(IdentifierResolver::new(
                &config.identifier.forwarded_header,
                &config.identifier.real_ip_header,
            ));

        match &config.store.url {
            Some(url) => match RedisStore::connect(url, timeout).await {
                Ok(store) => {
                    builder = builder.store(Arc::new(store));
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        "Shared store unreachable at startup; enforcing limits per instance only"
                    );
                }
            },
            None => {
                info!("No shared store configured; enforcing limits per instance only");
            }
        }

        Ok(builder.build())
    }

    /// Check `policy_name` for the caller described by `metadata`.
    ///
    /// `identifier_override` replaces header-based resolution, e.g. with an
    /// authenticated user id. Only an unknown policy name is an error; store
    /// failures are absorbed by the local fallback.
    pub async fn enforce<M>(
        &self,
        policy_name: &str,
        metadata: &M,
        identifier_override: Option<&str>,
    ) -> Result<Decision>
    where
        M: RequestMetadata + ?Sized,
    {
        let policy = self.registry.resolve(policy_name)?;
        let identifier = match identifier_override {
            Some(id) => Identifier::new(id),
            None => self.resolver.resolve(metadata),
        };

        Ok(self.check(policy, &identifier).await)
    }

    /// Check an already-resolved identifier against a named policy.
    pub async fn enforce_identifier(
        &self,
        policy_name: &str,
        identifier: &Identifier,
    ) -> Result<Decision> {
        let policy = self.registry.resolve(policy_name)?;
        Ok(self.check(policy, identifier).await)
    }

    async fn check(&self, policy: &Policy, identifier: &Identifier) -> Decision {
        let decision = match &self.distributed {
            Some(distributed) => match distributed.check(policy, identifier).await {
                Ok(decision) => {
                    self.stats.distributed_checks.fetch_add(1, Ordering::Relaxed);
                    decision
                }
                Err(e) => {
                    self.stats.fallbacks.fetch_add(1, Ordering::Relaxed);
                    self.stats.local_checks.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        policy = policy.name(),
                        identifier = %identifier,
                        error = %e,
                        "Shared store unavailable, falling back to local rate limiting"
                    );
                    self.local.check(policy, identifier)
                }
            },
            None => {
                self.stats.local_checks.fetch_add(1, Ordering::Relaxed);
                self.local.check(policy, identifier)
            }
        };

        if decision.is_denied() {
            self.stats.rejections.fetch_add(1, Ordering::Relaxed);
            debug!(
                policy = policy.name(),
                identifier = %identifier,
                source = ?decision.source,
                reset_at = %decision.reset_at,
                "Rate limit exceeded"
            );
        }

        decision
    }

    /// Read-only view over the same counters for quota display.
    ///
    /// The inspector resolves callers with the same headers as [`Self::enforce`].
    pub fn inspector(&self) -> StatusInspector {
        StatusInspector::new(
            self.registry.clone(),
            self.distributed.clone(),
            self.local.clone(),
            self.resolver.clone(),
        )
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether a shared store is configured at all.
    pub fn has_store(&self) -> bool {
        self.distributed.is_some()
    }

    /// The enforcer's notion of "now", for computing retry-after values.
    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// The process-local fallback counter.
    pub fn local_counter(&self) -> &LocalWindowCounter {
        &self.local
    }
}

/// Builder for [`LimitEnforcer`].
pub struct LimitEnforcerBuilder {
    registry: PolicyRegistry,
    store: Option<Arc<dyn CounterStore>>,
    store_timeout: Duration,
    key_prefix: String,
    gc_interval: Option<Duration>,
    clock: Arc<dyn Clock>,
    resolver: IdentifierResolver,
}

impl LimitEnforcerBuilder {
    fn new(registry: PolicyRegistry) -> Self {
        Self {
            registry,
            store: None,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            gc_interval: Some(DEFAULT_GC_INTERVAL),
            clock: Arc::new(SystemClock),
            resolver: IdentifierResolver::default(),
        }
    }

    /// Use a shared store as the primary path.
    pub fn store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Bound on each store round trip before falling back.
    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn key_prefix(mut self, prefix: &str) -> Self {
        self.key_prefix = prefix.to_string();
        self
    }

    /// Interval of the local garbage collector, `None` to disable it.
    pub fn gc_interval(mut self, interval: impl Into<Option<Duration>>) -> Self {
        self.gc_interval = interval.into();
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn resolver(mut self, resolver: IdentifierResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Build the enforcer.
    ///
    /// The garbage collector is spawned on the current tokio runtime; outside
    /// a runtime it is skipped and expired entries are only replaced in place.
    pub fn build(self) -> LimitEnforcer {
        let local = Arc::new(LocalWindowCounter::with_clock(self.clock.clone()));

        let distributed = self.store.map(|store| {
            Arc::new(
                DistributedWindowLimiter::new(store)
                    .with_timeout(self.store_timeout)
                    .with_clock(self.clock.clone())
                    .with_key_prefix(&self.key_prefix),
            )
        });

        let gc = match (self.gc_interval, tokio::runtime::Handle::try_current()) {
            (Some(every), Ok(_)) => Some(local.spawn_gc(every)),
            (Some(_), Err(_)) => {
                warn!("No tokio runtime available; local counter garbage collection disabled");
                None
            }
            (None, _) => None,
        };

        let store_timeout_ms = u64::try_from(self.store_timeout.as_millis()).unwrap_or(u64::MAX);
        info!(
            policies = self.registry.len(),
            distributed = distributed.is_some(),
            store_timeout_ms,
            "Rate limit enforcer initialized"
        );

        LimitEnforcer {
            registry: Arc::new(self.registry),
            resolver: self.resolver,
            distributed,
            local,
            clock: self.clock,
            stats: EnforcerStats::default(),
            _gc: gc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FloodgateError, StoreError};
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::decision::DecisionSource;
    use crate::ratelimit::policy::PolicyConfig;
    use crate::ratelimit::store::{MemoryStore, WindowCount};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::AtomicBool;
    use tokio_test::assert_ok;

    /// A memory store that can be switched off mid-test.
    #[derive(Debug, Default)]
    struct SwitchableStore {
        inner: MemoryStore,
        down: AtomicBool,
    }

    impl SwitchableStore {
        fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        fn check_up(&self) -> std::result::Result<(), StoreError> {
            if self.down.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable("store switched off".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl CounterStore for SwitchableStore {
        async fn record(
            &self,
            key: &str,
            window: Duration,
            now_ms: u64,
            member: &str,
        ) -> std::result::Result<WindowCount, StoreError> {
            self.check_up()?;
            self.inner.record(key, window, now_ms, member).await
        }

        async fn count(
            &self,
            key: &str,
            window: Duration,
            now_ms: u64,
        ) -> std::result::Result<WindowCount, StoreError> {
            self.check_up()?;
            self.inner.count(key, window, now_ms).await
        }
    }

    fn clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 15, 9, 30, 0).unwrap())
    }

    fn headers(ip: &str) -> [(&str, &str); 1] {
        [("x-forwarded-for", ip)]
    }

    #[tokio::test]
    async fn test_unknown_policy_is_an_error() {
        let enforcer = LimitEnforcer::builder(PolicyRegistry::defaults()).build();
        let err = enforcer
            .enforce("does-not-exist", &headers("1.2.3.4"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FloodgateError::UnknownPolicy(_)));
    }

    #[tokio::test]
    async fn test_distributed_path_used_when_available() {
        let store = Arc::new(SwitchableStore::default());
        let enforcer = LimitEnforcer::builder(PolicyRegistry::defaults())
            .store(store)
            .clock(Arc::new(clock()))
            .build();

        let decision = assert_ok!(enforcer.enforce("auth", &headers("1.2.3.4"), None).await);
        assert_eq!(decision.source, DecisionSource::Distributed);
        assert_eq!(decision.remaining, 9);
        assert_eq!(enforcer.stats().distributed_checks, 1);
        assert!(enforcer.local_counter().is_empty());
    }

    #[tokio::test]
    async fn test_auth_scenario_end_to_end() {
        let clock = clock();
        let enforcer = LimitEnforcer::builder(PolicyRegistry::defaults())
            .store(Arc::new(MemoryStore::new()))
            .clock(Arc::new(clock.clone()))
            .build();

        for expected in (1..=9).rev() {
            let decision = enforcer
                .enforce("auth", &headers("1.2.3.4"), None)
                .await
                .unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected);
        }

        let tenth = enforcer.enforce("auth", &headers("1.2.3.4"), None).await.unwrap();
        assert!(tenth.allowed);
        assert_eq!(tenth.remaining, 0);

        let eleventh = enforcer.enforce("auth", &headers("1.2.3.4"), None).await.unwrap();
        assert!(!eleventh.allowed);
        assert_eq!(eleventh.remaining, 0);
        assert_eq!(eleventh.retry_after_secs(enforcer.now()), 60);
        assert_eq!(enforcer.stats().rejections, 1);

        // Another caller is unaffected
        let other = enforcer.enforce("auth", &headers("5.6.7.8"), None).await.unwrap();
        assert_eq!(other.remaining, 9);
    }

    #[tokio::test]
    async fn test_store_outage_mid_run_falls_back() {
        let store = Arc::new(SwitchableStore::default());
        let clock = clock();
        let enforcer = LimitEnforcer::builder(PolicyRegistry::defaults())
            .store(store.clone())
            .clock(Arc::new(clock.clone()))
            .build();

        for _ in 0..4 {
            let decision = enforcer
                .enforce("standard", &headers("9.9.9.9"), None)
                .await
                .unwrap();
            assert_eq!(decision.source, DecisionSource::Distributed);
        }

        store.set_down(true);

        // The fifth request must not raise; the local counter starts its own window
        let fifth = assert_ok!(enforcer.enforce("standard", &headers("9.9.9.9"), None).await);
        assert!(fifth.allowed);
        assert_eq!(fifth.source, DecisionSource::Local);
        assert_eq!(fifth.remaining, 99);
        assert_eq!(fifth.reset_at, clock.now() + chrono::Duration::seconds(60));

        let stats = enforcer.stats();
        assert_eq!(stats.distributed_checks, 4);
        assert_eq!(stats.fallbacks, 1);
        assert_eq!(stats.local_checks, 1);

        store.set_down(false);
        let recovered = enforcer
            .enforce("standard", &headers("9.9.9.9"), None)
            .await
            .unwrap();
        assert_eq!(recovered.source, DecisionSource::Distributed);
        assert_eq!(recovered.remaining, 95);
    }

    #[tokio::test]
    async fn test_fallback_keeps_fixed_window_invariants() {
        let store = Arc::new(SwitchableStore::default());
        store.set_down(true);
        let clock = clock();
        let enforcer = LimitEnforcer::builder(PolicyRegistry::defaults())
            .store(store)
            .clock(Arc::new(clock.clone()))
            .build();

        for _ in 0..10 {
            assert!(enforcer.enforce("auth", &headers("a"), None).await.unwrap().allowed);
        }
        assert!(!enforcer.enforce("auth", &headers("a"), None).await.unwrap().allowed);

        clock.advance(Duration::from_secs(60));
        let fresh = enforcer.enforce("auth", &headers("a"), None).await.unwrap();
        assert!(fresh.allowed);
        assert_eq!(fresh.remaining, 9);
        assert_eq!(enforcer.stats().fallbacks, 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_store_triggers_fallback() {
        #[derive(Debug)]
        struct Hanging;

        #[async_trait]
        impl CounterStore for Hanging {
            async fn record(
                &self,
                _: &str,
                _: Duration,
                _: u64,
                _: &str,
            ) -> std::result::Result<WindowCount, StoreError> {
                std::future::pending().await
            }

            async fn count(
                &self,
                _: &str,
                _: Duration,
                _: u64,
            ) -> std::result::Result<WindowCount, StoreError> {
                std::future::pending().await
            }
        }

        let enforcer = LimitEnforcer::builder(PolicyRegistry::defaults())
            .store(Arc::new(Hanging))
            .store_timeout(Duration::from_millis(100))
            .build();

        let decision = enforcer.enforce("upload", &headers("a"), None).await.unwrap();
        assert_eq!(decision.source, DecisionSource::Local);
        assert_eq!(enforcer.stats().fallbacks, 1);
    }

    #[tokio::test]
    async fn test_identifier_override() {
        let enforcer = LimitEnforcer::builder(PolicyRegistry::defaults())
            .clock(Arc::new(clock()))
            .build();

        enforcer
            .enforce("sensitive", &headers("1.1.1.1"), Some("user:42"))
            .await
            .unwrap();
        let by_ip = enforcer
            .enforce("sensitive", &headers("1.1.1.1"), None)
            .await
            .unwrap();
        assert_eq!(by_ip.remaining, 19);

        let by_user = enforcer
            .enforce_identifier("sensitive", &Identifier::new("user:42"))
            .await
            .unwrap();
        assert_eq!(by_user.remaining, 18);
    }

    #[tokio::test]
    async fn test_without_store_runs_locally() {
        let enforcer = LimitEnforcer::builder(PolicyRegistry::defaults()).build();
        assert!(!enforcer.has_store());

        let empty: [(&str, &str); 0] = [];
        let decision = enforcer.enforce("webhook", &empty, None).await.unwrap();
        assert_eq!(decision.source, DecisionSource::Local);
        assert_eq!(decision.limit, 1000);

        let stats = enforcer.stats();
        assert_eq!(stats.local_checks, 1);
        assert_eq!(stats.fallbacks, 0);
        assert!(enforcer
            .local_counter()
            .entry(
                enforcer.registry().resolve("webhook").unwrap(),
                &Identifier::unknown()
            )
            .is_some());
    }

    #[tokio::test]
    async fn test_inspector_uses_configured_headers() {
        let enforcer = LimitEnforcer::builder(PolicyRegistry::defaults())
            .resolver(IdentifierResolver::new("cf-connecting-ip", "fly-client-ip"))
            .build();
        let headers = [("cf-connecting-ip", "7.7.7.7")];

        let decision = enforcer.enforce("auth", &headers, None).await.unwrap();
        assert_eq!(decision.remaining, 9);

        let status = enforcer
            .inspector()
            .status_for("auth", &headers, None)
            .await
            .unwrap();
        assert_eq!(status.remaining, 9);
    }

    #[tokio::test]
    async fn test_huge_window_policy_does_not_panic() {
        let registry =
            PolicyRegistry::from_configs(vec![PolicyConfig::new("forever", u64::MAX / 1000, 5)])
                .unwrap();
        let enforcer = LimitEnforcer::builder(registry)
            .store_timeout(Duration::MAX)
            .build();

        let decision = enforcer.enforce("forever", &headers("a"), None).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
        assert_eq!(decision.source, DecisionSource::Local);
    }

    #[test]
    fn test_build_outside_runtime() {
        let enforcer = LimitEnforcer::builder(PolicyRegistry::defaults()).build();
        let decision = tokio_test::block_on(enforcer.enforce("auth", &headers("a"), None));
        assert!(decision.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_from_config_without_store() {
        let config = FloodgateConfig::default();
        let enforcer = LimitEnforcer::from_config(&config).await.unwrap();
        assert!(!enforcer.has_store());
        assert_eq!(enforcer.registry().len(), 5);
    }

    #[tokio::test]
    async fn test_from_config_unreachable_store_runs_locally() {
        let mut config = FloodgateConfig::default();
        config.store.url = Some("redis://127.0.0.1:1".to_string());
        config.store.timeout_ms = 300;

        let enforcer = LimitEnforcer::from_config(&config).await.unwrap();
        assert!(!enforcer.has_store());
        let decision = enforcer.enforce("auth", &headers("a"), None).await.unwrap();
        assert_eq!(decision.source, DecisionSource::Local);
    }
}
