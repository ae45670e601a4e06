//! Rate limiting logic and state management.

mod clock;
mod counter;
mod decision;
mod distributed;
mod enforcer;
mod identifier;
mod policy;
mod redis;
mod status;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{CounterEntry, GcHandle, LocalWindowCounter, DEFAULT_GC_INTERVAL};
pub use decision::{Decision, DecisionSource, Rejection};
pub use distributed::{DistributedWindowLimiter, DEFAULT_KEY_PREFIX, DEFAULT_STORE_TIMEOUT};
pub use enforcer::{EnforcerStats, LimitEnforcer, LimitEnforcerBuilder, StatsSnapshot};
pub use identifier::{
    Identifier, IdentifierResolver, RequestMetadata, FORWARDED_FOR_HEADER, REAL_IP_HEADER,
    UNKNOWN_IDENTIFIER,
};
pub use policy::{default_policies, Policy, PolicyConfig, PolicyRegistry};
pub use self::redis::RedisStore;
pub use status::StatusInspector;
pub use store::{CounterStore, MemoryStore, WindowCount};
