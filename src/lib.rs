//! Form submission rate limiter
//!
//! Caps how many submissions a single caller may make to a resource within a
//! fixed time window. Counters live in a pluggable store (in-process moka cache
//! or Redis); a failing store never blocks submissions.

pub mod cache;
pub mod config;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod redis;
pub mod service;
pub mod utils;

// Re-export main types
pub use cache::{CounterStore, Increment, MemoryCounterStore};
pub use config::RateLimitConfig;
pub use error::{RateLimitError, Result};
pub use limiter::{Outcome, RateLimiter, Verdict, LIMIT_EXCEEDED_REASON};
pub use service::RateLimitService;
