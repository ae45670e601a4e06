//! The result of a rate limit check and the "too many requests" shape built from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which enforcement path produced a [`Decision`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionSource {
    /// The shared store answered.
    Distributed,
    /// The process-local fallback counter answered.
    Local,
}

/// Allow/deny result plus quota metadata. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub source: DecisionSource,
}

impl Decision {
    /// Build a decision from a post-increment count.
    ///
    /// The increment that pushes `count` past `limit` is itself rejected.
    pub fn from_count(
        count: u64,
        limit: u64,
        reset_at: DateTime<Utc>,
        source: DecisionSource,
    ) -> Self {
        Self {
            allowed: count <= limit,
            limit,
            remaining: limit.saturating_sub(count),
            reset_at,
            source,
        }
    }

    /// Build a decision from a count observed without incrementing.
    ///
    /// `allowed` reports whether a check issued now would pass.
    pub fn from_peek(
        count: u64,
        limit: u64,
        reset_at: DateTime<Utc>,
        source: DecisionSource,
    ) -> Self {
        Self {
            allowed: count < limit,
            limit,
            remaining: limit.saturating_sub(count),
            reset_at,
            source,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    pub fn is_denied(&self) -> bool {
        !self.allowed
    }

    /// Whole seconds until the window resets, rounded up.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.reset_at - now).num_milliseconds();
        if millis <= 0 {
            return 0;
        }
        (millis as u64).div_ceil(1000)
    }

    /// Standard rate limit response headers.
    ///
    /// `Retry-After` is only present on rejections.
    pub fn headers(&self, now: DateTime<Utc>) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_at.timestamp().to_string()),
        ];
        if self.is_denied() {
            headers.push(("Retry-After", self.retry_after_secs(now).to_string()));
        }
        headers
    }

    /// The rejection body for a denied decision, `None` if allowed.
    pub fn rejection(&self, now: DateTime<Utc>) -> Option<Rejection> {
        if self.allowed {
            return None;
        }
        Some(Rejection::new(self.retry_after_secs(now)))
    }
}

/// Body of a 429 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub error: String,
    pub message: String,
    pub retry_after: u64,
}

impl Rejection {
    pub const STATUS_CODE: u16 = 429;

    pub fn new(retry_after: u64) -> Self {
        Self {
            error: "Too many requests".to_string(),
            message: format!("Rate limit exceeded. Try again in {} seconds.", retry_after),
            retry_after,
        }
    }
}
