#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Breakwater
//!
//! Resilience and efficiency interceptors for async request pipelines:
//! TTL caching, request deduplication, circuit breaking, handle pooling,
//! batch coalescing, and usage monitoring, composed as an ordered chain a
//! request flows through before reaching your handler.
//!
//! ## Features
//!
//! - **TTL cache** with lazy eviction for opted-in reads
//! - **Dedup guard** that replays completed responses and rejects in-flight
//!   duplicates inside a window
//! - **Circuit breaker** with CAS-fenced half-open recovery
//! - **Bounded handle pool** with idle-timeout reclamation
//! - **Batch coalescer** flushing on timer, threshold, or demand
//! - **Memory/latency monitor** and allow-list response projection
//! - **Deterministic tests** via an injectable clock
//!
//! ## Quick Start
//!
//! ```rust
//! use breakwater::{Pipeline, PipelineConfig, Request};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let pipeline: Pipeline<()> =
//!         Pipeline::new(PipelineConfig::default(), |_key| ()).unwrap();
//!
//!     let request = Request::new("GET", "/messages").cacheable();
//!     let response = pipeline
//!         .execute(request, || async {
//!             // Your business handler here
//!             Ok::<_, std::io::Error>(json!({ "messages": [] }))
//!         })
//!         .await;
//!
//!     assert!(response.is_success());
//! }
//! ```

pub mod batch;
pub mod cache;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod error;
pub mod monitor;
pub mod pipeline;
pub mod pool;
pub mod project;
pub mod sweep;

// Re-exports
pub use batch::{BatchCoalescer, BatchConfig, BatchFailure, BatchOp, BatchResult, Submission};
pub use cache::TtlCache;
pub use circuit_breaker::{BreakerConfig, BreakerConfigError, CircuitBreaker, CircuitState};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{ConfigError, PipelineConfig};
pub use dedup::{Admission, DedupGuard};
pub use error::Rejection;
pub use monitor::{MemorySample, RequestSpan, UsageMonitor, UsageReport};
pub use pipeline::{
    batch_response, InterceptOutcome, Interceptor, Origin, Pipeline, PipelineStatus, Request,
    Response, ResponseKind,
};
pub use pool::{HandlePool, PoolUtilization};
pub use project::ResponseProjector;
pub use sweep::SweeperHandle;
