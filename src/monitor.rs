//! Memory and latency sampling around the request lifecycle.
//!
//! Purely observational: the monitor never rejects a request or alters
//! control flow. It samples resident-set size and monotonic wall time at
//! request entry and completion, warns through `tracing` when a single
//! request grows the process beyond a threshold, and keeps the latest memory
//! sample for the health snapshot.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Point-in-time resident memory reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemorySample {
    /// Resident-set size in bytes.
    pub rss_bytes: u64,
}

/// Open measurement for one request; closed by [`UsageMonitor::finish`].
#[derive(Debug)]
pub struct RequestSpan {
    path: String,
    started: Instant,
    rss_before: Option<u64>,
}

impl RequestSpan {
    /// Wall time since the request entered the pipeline.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Closed measurement handed back by [`UsageMonitor::finish`].
#[derive(Debug, Clone)]
pub struct UsageReport {
    pub path: String,
    pub duration: Duration,
    /// RSS growth over the request; `None` where sampling is unsupported.
    pub memory_delta_bytes: Option<i64>,
}

/// Samples memory and latency per request.
///
/// Clones share the latest-sample slot via `Arc`.
#[derive(Debug, Clone)]
pub struct UsageMonitor {
    growth_warn_bytes: u64,
    last_sample: Arc<Mutex<Option<MemorySample>>>,
}

impl UsageMonitor {
    /// Create a monitor that warns when one request grows RSS by more than
    /// `growth_warn_bytes`.
    pub fn new(growth_warn_bytes: u64) -> Self {
        Self { growth_warn_bytes, last_sample: Arc::new(Mutex::new(None)) }
    }

    /// Open a span at request entry.
    pub fn begin(&self, path: &str) -> RequestSpan {
        RequestSpan { path: path.to_string(), started: Instant::now(), rss_before: resident_bytes() }
    }

    /// Close a span, record the latest memory sample, and warn on excessive
    /// growth. Never fails.
    pub fn finish(&self, span: RequestSpan) -> UsageReport {
        let duration = span.started.elapsed();
        let rss_after = resident_bytes();

        if let Some(rss) = rss_after {
            *self.last_sample.lock().expect("monitor sample poisoned") =
                Some(MemorySample { rss_bytes: rss });
        }

        let memory_delta_bytes = match (span.rss_before, rss_after) {
            (Some(before), Some(after)) => Some(after as i64 - before as i64),
            _ => None,
        };

        if let Some(delta) = memory_delta_bytes {
            if delta > self.growth_warn_bytes as i64 {
                tracing::warn!(
                    path = %span.path,
                    duration_ms = duration.as_millis() as u64,
                    memory_delta_bytes = delta,
                    "request grew resident memory beyond threshold"
                );
            }
        }

        UsageReport { path: span.path, duration, memory_delta_bytes }
    }

    /// Most recent memory sample, if the platform supports sampling.
    pub fn last_sample(&self) -> Option<MemorySample> {
        *self.last_sample.lock().expect("monitor sample poisoned")
    }
}

/// Resident-set size of the current process.
///
/// Reads `/proc/self/statm` on Linux (field 2, resident pages; 4 KiB pages
/// assumed). Other platforms report `None` and the monitor degrades to
/// latency-only.
#[cfg(target_os = "linux")]
fn resident_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096)
}

#[cfg(not(target_os = "linux"))]
fn resident_bytes() -> Option<u64> {
    None
}
