//! Rejection types produced by the pipeline gates.

use std::time::Duration;

/// A request turned away by one of the pipeline gates, or a batch that aborted.
///
/// Rejections are control-flow signals, not process failures: the pipeline
/// translates every variant into a `Response` carrying a machine-readable
/// reason code, and the host decides how to surface it. A cache miss is *not*
/// a rejection; it is `Option::None` on the cache API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    /// An identical request is still executing inside the dedup window.
    #[error("duplicate request still in flight ({age:?} into a {window:?} window)")]
    DuplicateInFlight {
        /// How long ago the original request was admitted.
        age: Duration,
        /// The configured dedup window.
        window: Duration,
    },
    /// The circuit breaker is open and the recovery timeout has not elapsed.
    #[error("circuit open after {failure_count} failures; retry in {retry_after:?}")]
    CircuitOpen {
        /// Consecutive failures observed when the circuit opened.
        failure_count: usize,
        /// Time remaining until a trial request will be admitted.
        retry_after: Duration,
    },
    /// The resource pool has no free slot for a new handle.
    #[error("resource pool exhausted ({active}/{max} handles live)")]
    PoolExhausted {
        /// Handles currently occupying pool slots.
        active: usize,
        /// Configured pool capacity.
        max: usize,
    },
    /// A batch aborted mid-flush; operations after the failing one never ran.
    #[error("batch aborted after {completed} completed operation(s): {reason}")]
    BatchFailed {
        /// Operations that finished before the failure.
        completed: usize,
        /// Stringified error from the failing operation.
        reason: String,
    },
}

impl Rejection {
    /// Stable reason code for machine consumption.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::DuplicateInFlight { .. } => "duplicate_in_flight",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::PoolExhausted { .. } => "pool_exhausted",
            Self::BatchFailed { .. } => "batch_failed",
        }
    }

    /// Retry hint, where one applies.
    ///
    /// Duplicates may be retried once the remainder of the window has passed;
    /// an open circuit once the recovery timeout elapses. Pool exhaustion and
    /// batch failures carry no hint.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::DuplicateInFlight { age, window } => Some(window.saturating_sub(*age)),
            Self::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Check if this rejection came from the dedup guard.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateInFlight { .. })
    }

    /// Check if this rejection came from the circuit breaker.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if this rejection came from the resource pool.
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. })
    }

    /// Check if this rejection reports an aborted batch.
    pub fn is_batch_failed(&self) -> bool {
        matches!(self, Self::BatchFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_display_and_hint() {
        let rejection = Rejection::DuplicateInFlight {
            age: Duration::from_secs(1),
            window: Duration::from_secs(5),
        };
        let msg = rejection.to_string();
        assert!(msg.contains("duplicate"));
        assert_eq!(rejection.reason_code(), "duplicate_in_flight");
        assert_eq!(rejection.retry_after(), Some(Duration::from_secs(4)));
        assert!(rejection.is_duplicate());
        assert!(!rejection.is_circuit_open());
    }

    #[test]
    fn circuit_open_carries_remaining_timeout() {
        let rejection =
            Rejection::CircuitOpen { failure_count: 5, retry_after: Duration::from_secs(30) };
        assert!(rejection.to_string().contains("circuit open"));
        assert_eq!(rejection.retry_after(), Some(Duration::from_secs(30)));
        assert!(rejection.is_circuit_open());
    }

    #[test]
    fn pool_exhausted_has_no_retry_hint() {
        let rejection = Rejection::PoolExhausted { active: 10, max: 10 };
        assert_eq!(rejection.reason_code(), "pool_exhausted");
        assert!(rejection.retry_after().is_none());
        assert!(rejection.is_pool_exhausted());
    }

    #[test]
    fn batch_failed_reports_progress() {
        let rejection = Rejection::BatchFailed { completed: 2, reason: "boom".into() };
        let msg = rejection.to_string();
        assert!(msg.contains("2 completed"));
        assert!(msg.contains("boom"));
        assert!(rejection.is_batch_failed());
        assert!(rejection.retry_after().is_none());
    }
}
