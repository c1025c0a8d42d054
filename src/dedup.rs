//! Request deduplication inside a sliding time window.
//!
//! A record is keyed by a fingerprint of the logical request. While a record
//! is live, a second request with the same fingerprint either replays the
//! completed response or is rejected as an in-flight duplicate. Stale records
//! are purged on every admission through a min-heap of expiration deadlines,
//! so the purge is O(log n) per expired record rather than a scan of the whole
//! table.

use crate::clock::{Clock, MonotonicClock};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Outcome of admitting a request to the guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission<V> {
    /// No live record existed; one was inserted and the request may proceed.
    Fresh,
    /// A record with a completed response exists; replay it without executing.
    Replay(V),
    /// A record exists but its request has not completed yet.
    InFlight {
        /// How long ago the original request was admitted.
        age: Duration,
        /// The configured dedup window.
        window: Duration,
    },
}

#[derive(Debug)]
struct DedupRecord<V> {
    inserted_at_millis: u64,
    response: Option<V>,
}

/// Heap entries are ordered by deadline; the insertion timestamp disambiguates
/// a fingerprint that expired and was re-admitted, so a stale deadline never
/// evicts the successor record.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Expiration {
    deadline_millis: u64,
    fingerprint: u64,
    inserted_at_millis: u64,
}

#[derive(Debug)]
struct DedupState<V> {
    records: HashMap<u64, DedupRecord<V>>,
    expirations: BinaryHeap<Reverse<Expiration>>,
}

/// Suppresses repeated identical requests inside a time window.
///
/// Clones share the same record table via `Arc`.
#[derive(Debug)]
pub struct DedupGuard<V> {
    state: Arc<Mutex<DedupState<V>>>,
    window: Duration,
    clock: Arc<dyn Clock>,
}

impl<V> Clone for DedupGuard<V> {
    fn clone(&self) -> Self {
        Self { state: Arc::clone(&self.state), window: self.window, clock: Arc::clone(&self.clock) }
    }
}

impl<V: Clone> DedupGuard<V> {
    /// Create a guard with the given dedup window.
    pub fn new(window: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(DedupState {
                records: HashMap::new(),
                expirations: BinaryHeap::new(),
            })),
            window,
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

    /// Admit a request, purging stale records first.
    ///
    /// Inserts an in-flight record when no live one exists; the caller must
    /// later call [`complete`](Self::complete) or [`remove`](Self::remove) for
    /// the same fingerprint once the request settles.
    pub fn begin(&self, fingerprint: u64) -> Admission<V> {
        let now = self.clock.now_millis();
        let window_millis = self.window_millis();
        let mut state = self.state.lock().expect("dedup state poisoned");
        Self::purge(&mut state, now);

        match state.records.get(&fingerprint) {
            Some(record) => {
                let age = Duration::from_millis(now.saturating_sub(record.inserted_at_millis));
                match &record.response {
                    Some(response) => {
                        tracing::debug!(fingerprint, "replaying completed duplicate");
                        Admission::Replay(response.clone())
                    }
                    None => {
                        tracing::debug!(fingerprint, ?age, "rejecting in-flight duplicate");
                        Admission::InFlight { age, window: self.window }
                    }
                }
            }
            None => {
                state
                    .records
                    .insert(fingerprint, DedupRecord { inserted_at_millis: now, response: None });
                state.expirations.push(Reverse(Expiration {
                    deadline_millis: now.saturating_add(window_millis),
                    fingerprint,
                    inserted_at_millis: now,
                }));
                Admission::Fresh
            }
        }
    }

    /// Attach the completed response to a live record so later duplicates can
    /// replay it. A no-op if the record already expired.
    pub fn complete(&self, fingerprint: u64, response: V) {
        let mut state = self.state.lock().expect("dedup state poisoned");
        if let Some(record) = state.records.get_mut(&fingerprint) {
            record.response = Some(response);
        }
    }

    /// Drop a record outright, letting the next identical request re-execute.
    pub fn remove(&self, fingerprint: u64) {
        let mut state = self.state.lock().expect("dedup state poisoned");
        state.records.remove(&fingerprint);
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.state.lock().expect("dedup state poisoned").records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Purge every record past its deadline, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().expect("dedup state poisoned");
        Self::purge(&mut state, now)
    }

    fn purge(state: &mut DedupState<V>, now_millis: u64) -> usize {
        let mut removed = 0;
        while let Some(Reverse(next)) = state.expirations.peek() {
            if next.deadline_millis > now_millis {
                break;
            }
            let fingerprint = next.fingerprint;
            let inserted_at_millis = next.inserted_at_millis;
            state.expirations.pop();
            // Only evict if the record still belongs to this deadline; a
            // re-admitted fingerprint has a newer insertion timestamp.
            if let Some(record) = state.records.get(&fingerprint) {
                if record.inserted_at_millis == inserted_at_millis {
                    state.records.remove(&fingerprint);
                    removed += 1;
                }
            }
        }
        removed
    }

    fn window_millis(&self) -> u64 {
        u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX)
    }
}
