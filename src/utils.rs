use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Default namespace for counter keys
pub const DEFAULT_KEY_PREFIX: &str = "form_ratelimit";

/// Source of the current time for expiry decisions
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> Instant;
}

/// Wall clock used outside of tests
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
///
/// Public so that integrators can drive window expiry in their own tests;
/// production code should use [`SystemClock`]. Clones share the same time,
/// so a test can hand one clone to a store and advance another.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            current: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Move the clock forward by `by`
    pub fn advance(&self, by: Duration) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        *current += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One-way, fixed-length digest of a caller identity (64 hex chars)
pub fn hash_identity(identity: &str) -> String {
    hex::encode(blake3::hash(identity.as_bytes()).as_bytes())
}

/// Generate the counter key for a resource and caller identity.
///
/// The identity digest always has the same length and sits at the end of the
/// key, so two different pairs can only collide through a digest collision.
pub fn generate_counter_key(prefix: &str, resource_id: &str, identity: &str) -> String {
    let digest = hash_identity(identity);
    if prefix.is_empty() {
        format!("{}:{}", resource_id, digest)
    } else {
        format!("{}:{}:{}", prefix, resource_id, digest)
    }
}

/// Convert a window length in seconds to a store TTL, where zero means the
/// counter never expires
pub fn window_ttl(time_limit_secs: u64) -> Option<Duration> {
    if time_limit_secs == 0 {
        None
    } else {
        Some(Duration::from_secs(time_limit_secs))
    }
}
