use async_trait::async_trait;
use moka::{
    future::Cache,
    ops::compute::Op,
    Expiry,
};
use std::{
    future::ready,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, trace};

use crate::{
    error::Result,
    utils::{Clock, SystemClock},
};

/// Outcome of an atomic increment request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Increment {
    /// The key was absent or expired and now holds 1
    Created,
    /// The counter was below the maximum and now holds this value
    Incremented(u64),
    /// The counter was already at or above the maximum and was left alone
    Saturated(u64),
}

impl Increment {
    /// Counter value after the operation
    pub fn count(&self) -> u64 {
        match self {
            Increment::Created => 1,
            Increment::Incremented(count) | Increment::Saturated(count) => *count,
        }
    }

    /// Whether the event was counted
    pub fn admitted(&self) -> bool {
        !matches!(self, Increment::Saturated(_))
    }
}

/// Key-value store of counters that expire a fixed time after creation
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Current count, or `None` when the key is absent or expired
    async fn get(&self, key: &str) -> Result<Option<u64>>;

    /// Unconditionally write `count`, restarting the expiry at now + `ttl`.
    /// A `None` ttl never expires.
    async fn set_with_expiry(&self, key: &str, count: u64, ttl: Option<Duration>) -> Result<()>;

    /// Create the counter at 1 when absent, or increment it when below `max`,
    /// as one indivisible step per key. Incrementing never moves the expiry.
    async fn increment_if_below(
        &self,
        key: &str,
        max: u64,
        ttl: Option<Duration>,
    ) -> Result<Increment>;

    /// Health check for the store
    async fn health_check(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    count: u64,
    expires_at: Option<Instant>,
    ttl: Option<Duration>,
    /// Set when the entry starts a new window so the cache restarts its timer
    fresh: bool,
}

impl CounterEntry {
    fn new_window(count: u64, now: Instant, ttl: Option<Duration>) -> Self {
        Self {
            count,
            expires_at: ttl.map(|ttl| now + ttl),
            ttl,
            fresh: true,
        }
    }

    fn incremented(self) -> Self {
        Self {
            count: self.count.saturating_add(1),
            fresh: false,
            ..self
        }
    }

    fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

/// Reclaims entries once their window is over. Updates inside a window keep
/// the remaining time instead of extending it.
struct WindowExpiry;

impl Expiry<String, CounterEntry> for WindowExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CounterEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CounterEntry,
        _updated_at: Instant,
        duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        if value.fresh {
            value.ttl
        } else {
            duration_until_expiry
        }
    }
}

/// In-process counter store backed by a moka cache.
///
/// Expiry decisions use the injected [`Clock`]; the cache's own timer only
/// bounds memory by evicting entries whose window has passed.
pub struct MemoryCounterStore {
    counters: Cache<String, CounterEntry>,
    clock: Arc<dyn Clock>,
    writes: AtomicU64,
}

impl MemoryCounterStore {
    /// Create a store holding at most `max_capacity` counters
    pub fn new(max_capacity: u64) -> Self {
        Self::with_clock(max_capacity, Arc::new(SystemClock))
    }

    pub fn with_clock(max_capacity: u64, clock: Arc<dyn Clock>) -> Self {
        let counters = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(WindowExpiry)
            .build();

        Self {
            counters,
            clock,
            writes: AtomicU64::new(0),
        }
    }

    /// Number of writes performed since creation
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of counters currently held, including expired ones not yet reclaimed
    pub async fn counter_count(&self) -> u64 {
        self.counters.run_pending_tasks().await;
        self.counters.entry_count()
    }

    /// Remove every counter whose window has passed. Returns how many were found.
    pub async fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<String> = self
            .counters
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key.to_string())
            .collect();

        for key in &expired {
            self.remove_if_expired(key, now).await;
        }
        self.counters.run_pending_tasks().await;

        expired.len()
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `every` on the tokio runtime
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = self.sweep_expired().await;
                if removed > 0 {
                    debug!(removed, "Swept expired counters");
                }
            }
        })
    }

    async fn remove_if_expired(&self, key: &str, now: Instant) {
        self.counters
            .entry(key.to_owned())
            .and_compute_with(|current| {
                let op = match current {
                    Some(entry) if entry.value().is_expired_at(now) => Op::Remove,
                    _ => Op::Nop,
                };
                ready(op)
            })
            .await;
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> Result<Option<u64>> {
        let now = self.clock.now();
        match self.counters.get(key).await {
            Some(entry) if entry.is_expired_at(now) => {
                self.remove_if_expired(key, now).await;
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.count)),
            None => Ok(None),
        }
    }

    async fn set_with_expiry(&self, key: &str, count: u64, ttl: Option<Duration>) -> Result<()> {
        let entry = CounterEntry::new_window(count, self.clock.now(), ttl);
        self.counters
            .entry(key.to_owned())
            .and_compute_with(|_| ready(Op::Put(entry)))
            .await;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn increment_if_below(
        &self,
        key: &str,
        max: u64,
        ttl: Option<Duration>,
    ) -> Result<Increment> {
        let now = self.clock.now();
        let mut outcome = Increment::Saturated(0);

        self.counters
            .entry(key.to_owned())
            .and_compute_with(|current| {
                let live = current
                    .map(|entry| entry.into_value())
                    .filter(|entry| !entry.is_expired_at(now));

                let op = match live {
                    None => {
                        outcome = Increment::Created;
                        Op::Put(CounterEntry::new_window(1, now, ttl))
                    }
                    Some(entry) if entry.count < max => {
                        let next = entry.incremented();
                        outcome = Increment::Incremented(next.count);
                        Op::Put(next)
                    }
                    Some(entry) => {
                        outcome = Increment::Saturated(entry.count);
                        Op::Nop
                    }
                };
                ready(op)
            })
            .await;

        if outcome.admitted() {
            self.writes.fetch_add(1, Ordering::Relaxed);
        }
        trace!(key, ?outcome, "Counter updated");
        Ok(outcome)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
