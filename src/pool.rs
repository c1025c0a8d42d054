//! Bounded pool of reusable keyed handles with an idle timeout.

use crate::clock::{Clock, MonotonicClock};
use crate::error::Rejection;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug)]
struct PoolEntry<H> {
    handle: H,
    created_at_millis: u64,
}

/// Pool occupancy for the health snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolUtilization {
    /// Handles currently occupying slots.
    pub active: usize,
    /// Configured capacity.
    pub max: usize,
}

/// Bounded map of reusable handles, keyed by caller-chosen strings.
///
/// A handle older than the idle timeout is treated as absent and replaced
/// lazily on the next access to its key. When the pool is full, idle-expired
/// entries in *other* slots are reclaimed before exhaustion is declared, so a
/// dead handle never blocks a live request. Clones share the same slots via
/// `Arc`.
#[derive(Debug)]
pub struct HandlePool<H> {
    entries: Arc<Mutex<HashMap<String, PoolEntry<H>>>>,
    max_handles: usize,
    idle_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl<H> Clone for HandlePool<H> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            max_handles: self.max_handles,
            idle_timeout: self.idle_timeout,
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<H: Clone> HandlePool<H> {
    /// Create a pool holding at most `max_handles` entries. Panics if
    /// `max_handles` is zero.
    pub fn new(max_handles: usize, idle_timeout: Duration) -> Self {
        assert!(max_handles > 0, "pool capacity must be > 0");
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            max_handles,
            idle_timeout,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(self, clock: C) -> Self {
        self.with_clock_arc(Arc::new(clock))
    }

    pub(crate) fn with_clock_arc(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Return the live handle for `key`, or create one with `create`.
    ///
    /// An idle-expired entry under `key` is replaced in place. A brand-new key
    /// needs a free slot; if none exists even after reclaiming idle entries,
    /// the call fails with [`Rejection::PoolExhausted`].
    pub fn get_or_create<F>(&self, key: &str, create: F) -> Result<H, Rejection>
    where
        F: FnOnce() -> H,
    {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().expect("pool slots poisoned");

        if let Some(entry) = entries.get_mut(key) {
            if !idle(entry.created_at_millis, now, self.idle_timeout) {
                return Ok(entry.handle.clone());
            }
            tracing::debug!(key, "pooled handle idle-expired; replacing in place");
            entry.handle = create();
            entry.created_at_millis = now;
            return Ok(entry.handle.clone());
        }

        if entries.len() >= self.max_handles {
            let idle_timeout = self.idle_timeout;
            let before = entries.len();
            entries.retain(|_, entry| !idle(entry.created_at_millis, now, idle_timeout));
            let reclaimed = before - entries.len();
            if reclaimed > 0 {
                tracing::debug!(reclaimed, "reclaimed idle handles under capacity pressure");
            }
        }
        if entries.len() >= self.max_handles {
            return Err(Rejection::PoolExhausted { active: entries.len(), max: self.max_handles });
        }

        let handle = create();
        entries.insert(
            key.to_string(),
            PoolEntry { handle: handle.clone(), created_at_millis: now },
        );
        Ok(handle)
    }

    /// Drop the entry for `key`, if any.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().expect("pool slots poisoned").remove(key).is_some()
    }

    /// Remove every idle-expired entry, returning how many were dropped.
    pub fn purge_idle(&self) -> usize {
        let now = self.clock.now_millis();
        let idle_timeout = self.idle_timeout;
        let mut entries = self.entries.lock().expect("pool slots poisoned");
        let before = entries.len();
        entries.retain(|_, entry| !idle(entry.created_at_millis, now, idle_timeout));
        before - entries.len()
    }

    /// Occupancy snapshot, idle stragglers included.
    pub fn utilization(&self) -> PoolUtilization {
        PoolUtilization {
            active: self.entries.lock().expect("pool slots poisoned").len(),
            max: self.max_handles,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("pool slots poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn idle(created_at_millis: u64, now_millis: u64, idle_timeout: Duration) -> bool {
    let idle_millis = u64::try_from(idle_timeout.as_millis()).unwrap_or(u64::MAX);
    now_millis.saturating_sub(created_at_millis) >= idle_millis
}
