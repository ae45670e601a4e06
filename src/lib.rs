//! Floodgate - Distributed Request Rate Limiting
//!
//! This crate bounds how often a caller may invoke protected operations,
//! consistently across many stateless service instances. Checks run against
//! a shared sliding-window store (Redis) and degrade to a per-instance
//! fixed-window counter when that store is unreachable, so an outage
//! loosens the global limit instead of failing requests.

pub mod config;
pub mod error;
pub mod ratelimit;
