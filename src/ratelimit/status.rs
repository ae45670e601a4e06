//! Non-consuming quota lookups for display purposes.

use std::sync::Arc;

use tracing::debug;

use super::counter::LocalWindowCounter;
use super::decision::Decision;
use super::distributed::DistributedWindowLimiter;
use super::identifier::{Identifier, IdentifierResolver, RequestMetadata};
use super::policy::PolicyRegistry;
use crate::error::Result;

/// Reports remaining quota without spending any of it.
///
/// Results from the distributed path are approximate under concurrent
/// traffic. They are meant for "N requests remaining" displays only and must
/// not feed enforcement decisions.
#[derive(Debug, Clone)]
pub struct StatusInspector {
    registry: Arc<PolicyRegistry>,
    distributed: Option<Arc<DistributedWindowLimiter>>,
    local: Arc<LocalWindowCounter>,
    resolver: IdentifierResolver,
}

impl StatusInspector {
    pub(crate) fn new(
        registry: Arc<PolicyRegistry>,
        distributed: Option<Arc<DistributedWindowLimiter>>,
        local: Arc<LocalWindowCounter>,
        resolver: IdentifierResolver,
    ) -> Self {
        Self {
            registry,
            distributed,
            local,
            resolver,
        }
    }

    /// Use a custom resolver for [`StatusInspector::status_for`].
    pub fn with_resolver(mut self, resolver: IdentifierResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Current quota for `identifier` under `policy_name`.
    pub async fn status(&self, policy_name: &str, identifier: &Identifier) -> Result<Decision> {
        let policy = self.registry.resolve(policy_name)?;

        if let Some(distributed) = &self.distributed {
            match distributed.peek(policy, identifier).await {
                Ok(decision) => return Ok(decision),
                Err(e) => {
                    debug!(
                        policy = policy.name(),
                        identifier = %identifier,
                        error = %e,
                        "Shared store unavailable for status, reading local counter"
                    );
                }
            }
        }

        Ok(self.local.peek(policy, identifier))
    }

    /// Current quota for the caller described by `metadata`.
    pub async fn status_for<M>(
        &self,
        policy_name: &str,
        metadata: &M,
        identifier_override: Option<&str>,
    ) -> Result<Decision>
    where
        M: RequestMetadata + ?Sized,
    {
        let identifier = match identifier_override {
            Some(id) => Identifier::new(id),
            None => self.resolver.resolve(metadata),
        };
        self.status(policy_name, &identifier).await
    }
}

#[cfg(test)]
mod tests {
    use crate::error::{FloodgateError, StoreError};
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::decision::DecisionSource;
    use crate::ratelimit::enforcer::LimitEnforcer;
    use crate::ratelimit::identifier::Identifier;
    use crate::ratelimit::policy::PolicyRegistry;
    use crate::ratelimit::store::{CounterStore, MemoryStore, WindowCount};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;

    struct RefusingStore;

    #[async_trait]
    impl CounterStore for RefusingStore {
        async fn record(
            &self,
            _: &str,
            _: Duration,
            _: u64,
            _: &str,
        ) -> Result<WindowCount, StoreError> {
            Err(StoreError::Unavailable("refused".into()))
        }

        async fn count(&self, _: &str, _: Duration, _: u64) -> Result<WindowCount, StoreError> {
            Err(StoreError::Unavailable("refused".into()))
        }
    }

    #[tokio::test]
    async fn test_status_does_not_consume_distributed_quota() {
        let enforcer = LimitEnforcer::builder(PolicyRegistry::defaults())
            .store(Arc::new(MemoryStore::new()))
            .clock(Arc::new(ManualClock::new(Utc::now())))
            .build();
        let inspector = enforcer.inspector();
        let id = Identifier::new("1.2.3.4");

        enforcer.enforce_identifier("upload", &id).await.unwrap();
        enforcer.enforce_identifier("upload", &id).await.unwrap();

        for _ in 0..5 {
            let status = inspector.status("upload", &id).await.unwrap();
            assert_eq!(status.source, DecisionSource::Distributed);
            assert_eq!(status.remaining, 28);
            assert!(status.allowed);
        }

        let next = enforcer.enforce_identifier("upload", &id).await.unwrap();
        assert_eq!(next.remaining, 27);
    }

    #[tokio::test]
    async fn test_status_reads_local_counter_when_store_down() {
        let enforcer = LimitEnforcer::builder(PolicyRegistry::defaults())
            .store(Arc::new(RefusingStore))
            .build();
        let inspector = enforcer.inspector();

        let headers = [("x-real-ip", "10.1.1.1")];
        enforcer.enforce("auth", &headers, None).await.unwrap();

        let status = inspector.status_for("auth", &headers, None).await.unwrap();
        assert_eq!(status.source, DecisionSource::Local);
        assert_eq!(status.remaining, 9);
        assert_eq!(enforcer.local_counter().len(), 1);
    }

    #[tokio::test]
    async fn test_status_exhausted_reports_not_allowed() {
        let enforcer = LimitEnforcer::builder(PolicyRegistry::defaults()).build();
        let inspector = enforcer.inspector();
        let id = Identifier::new("x");

        for _ in 0..10 {
            enforcer.enforce_identifier("auth", &id).await.unwrap();
        }

        let status = inspector.status("auth", &id).await.unwrap();
        assert!(!status.allowed);
        assert_eq!(status.remaining, 0);
    }

    #[tokio::test]
    async fn test_status_unknown_policy() {
        let enforcer = LimitEnforcer::builder(PolicyRegistry::defaults()).build();
        let err = enforcer
            .inspector()
            .status("missing", &Identifier::new("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, FloodgateError::UnknownPolicy(_)));
    }
}
