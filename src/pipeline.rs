//! The interceptor chain wiring every guard around a business handler.
//!
//! A request flows through the ordered gates (circuit breaker, dedup guard,
//! cache, pool) and reaches the handler only if every gate continues. After
//! the response is known (produced, replayed, served from cache, or rejected),
//! every gate's completion hook fires so the breaker counters, dedup records
//! and cache entries stay consistent, the monitor samples the request, and the
//! projector optionally trims the outgoing payload.

use crate::batch::BatchResult;
use crate::cache::TtlCache;
use crate::circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use crate::clock::{Clock, MonotonicClock};
use crate::config::{ConfigError, PipelineConfig};
use crate::dedup::{Admission, DedupGuard};
use crate::error::Rejection;
use crate::monitor::{MemorySample, UsageMonitor};
use crate::pool::{HandlePool, PoolUtilization};
use crate::project::ResponseProjector;
use crate::sweep::{self, SweeperHandle};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

/// A logical request entering the pipeline.
///
/// The crate never parses HTTP; the host maps whatever transport it speaks
/// into this shape. `method`, `path`, `body` and `principal` feed the dedup
/// fingerprint; `principal` also scopes the cache key.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub principal: Option<String>,
    pub body: Value,
    /// Opt-in: serve and store this read through the TTL cache.
    pub cacheable: bool,
    /// Opt-in: trim the successful response body to the projector allow-list.
    pub project: bool,
    /// When set, the pool gate ensures a live handle for this key before the
    /// handler runs.
    pub pool_key: Option<String>,
}

impl Request {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            principal: None,
            body: Value::Null,
            cacheable: false,
            project: false,
            pool_key: None,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }

    pub fn projected(mut self) -> Self {
        self.project = true;
        self
    }

    pub fn with_pool_key(mut self, key: impl Into<String>) -> Self {
        self.pool_key = Some(key.into());
        self
    }

    /// Deterministic hash identifying the logical request for deduplication.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.method.hash(&mut hasher);
        self.path.hash(&mut hasher);
        // `Value` maps are ordered, so the rendering is canonical.
        self.body.to_string().hash(&mut hasher);
        self.principal.hash(&mut hasher);
        hasher.finish()
    }

    /// Cache key: principal scope plus the normalized path.
    pub fn cache_key(&self) -> String {
        let scope = self.principal.as_deref().unwrap_or("global");
        format!("{}:{}", scope, normalize_path(&self.path))
    }
}

/// Collapse duplicate slashes and strip a trailing one so `/messages/` and
/// `//messages` cache under the same key as `/messages`.
fn normalize_path(path: &str) -> String {
    let mut normalized = String::with_capacity(path.len());
    let mut last_was_slash = false;
    for ch in path.chars() {
        if ch == '/' {
            if !last_was_slash {
                normalized.push('/');
            }
            last_was_slash = true;
        } else {
            normalized.push(ch);
            last_was_slash = false;
        }
    }
    if normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

/// Semantic outcome of a request, independent of any transport status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    Success,
    DuplicateInFlight,
    CircuitOpen,
    PoolExhausted,
    BatchFailed,
    HandlerError,
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Produced by the business handler this request.
    Handler,
    /// Served from the TTL cache; the handler never ran.
    Cache,
    /// Replayed from a completed dedup record; the handler never ran.
    Replay,
    /// Rejected by a gate before the handler.
    Gate,
}

/// A response leaving the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub kind: ResponseKind,
    pub origin: Origin,
    pub body: Value,
    pub retry_after: Option<Duration>,
}

impl Response {
    pub fn ok(body: Value) -> Self {
        Self { kind: ResponseKind::Success, origin: Origin::Handler, body, retry_after: None }
    }

    pub(crate) fn cached(body: Value) -> Self {
        Self { kind: ResponseKind::Success, origin: Origin::Cache, body, retry_after: None }
    }

    pub(crate) fn replayed(body: Value) -> Self {
        Self { kind: ResponseKind::Success, origin: Origin::Replay, body, retry_after: None }
    }

    pub(crate) fn handler_error(message: String) -> Self {
        Self {
            kind: ResponseKind::HandlerError,
            origin: Origin::Handler,
            body: json!({ "error": "handler_failed", "message": message }),
            retry_after: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind == ResponseKind::Success
    }

    /// Machine-readable reason code for non-success responses.
    pub fn reason_code(&self) -> Option<&'static str> {
        match self.kind {
            ResponseKind::Success => None,
            ResponseKind::DuplicateInFlight => Some("duplicate_in_flight"),
            ResponseKind::CircuitOpen => Some("circuit_open"),
            ResponseKind::PoolExhausted => Some("pool_exhausted"),
            ResponseKind::BatchFailed => Some("batch_failed"),
            ResponseKind::HandlerError => Some("handler_failed"),
        }
    }
}

impl From<Rejection> for Response {
    fn from(rejection: Rejection) -> Self {
        let kind = match &rejection {
            Rejection::DuplicateInFlight { .. } => ResponseKind::DuplicateInFlight,
            Rejection::CircuitOpen { .. } => ResponseKind::CircuitOpen,
            Rejection::PoolExhausted { .. } => ResponseKind::PoolExhausted,
            Rejection::BatchFailed { .. } => ResponseKind::BatchFailed,
        };
        let retry_after = rejection.retry_after();
        let mut body = json!({
            "error": rejection.reason_code(),
            "message": rejection.to_string(),
        });
        if let (Some(retry), Value::Object(fields)) = (retry_after, &mut body) {
            fields.insert("retry_after_secs".into(), json!(retry.as_secs_f64().ceil() as u64));
        }
        Self { kind, origin: Origin::Gate, body, retry_after }
    }
}

/// Translate a finished batch submission into a response body.
///
/// Batch traffic bypasses the request gates (the coalescer is independent of
/// them), but hosts still answer callers in the pipeline's response shape.
pub fn batch_response<V: Serialize>(result: &BatchResult<V>) -> Response {
    match result {
        Ok(results) => Response::ok(json!({
            "status": "success",
            "results": serde_json::to_value(results.as_slice()).unwrap_or(Value::Null),
        })),
        Err(failure) => Response::from(Rejection::from(failure.clone())),
    }
}

/// Decision made by a gate before the handler runs.
#[derive(Debug)]
pub enum InterceptOutcome {
    /// Let the request continue down the chain.
    Continue,
    /// Stop here and answer with this response.
    ShortCircuit(Response),
}

/// One stage of the pipeline.
///
/// `intercept` runs in chain order before the handler; `on_complete` runs for
/// every interceptor (reverse order) once the response is known, regardless of
/// which stage produced it. Hooks inspect the response's [`Origin`] and
/// [`ResponseKind`] to decide whether the downstream was actually exercised.
#[async_trait]
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn intercept(&self, request: &Request) -> InterceptOutcome;

    async fn on_complete(&self, request: &Request, response: &Response, elapsed: Duration);
}

/// Gate 1: circuit breaker.
struct BreakerGate {
    breaker: CircuitBreaker,
}

#[async_trait]
impl Interceptor for BreakerGate {
    fn name(&self) -> &'static str {
        "circuit_breaker"
    }

    async fn intercept(&self, _request: &Request) -> InterceptOutcome {
        match self.breaker.try_acquire() {
            Ok(()) => InterceptOutcome::Continue,
            Err(rejection) => InterceptOutcome::ShortCircuit(Response::from(rejection)),
        }
    }

    async fn on_complete(&self, _request: &Request, response: &Response, _elapsed: Duration) {
        match (response.origin, response.kind) {
            (Origin::Handler, ResponseKind::Success) => self.breaker.record_success(),
            (Origin::Handler, _) => self.breaker.record_failure(),
            // Our own rejection: the request was never admitted.
            (Origin::Gate, ResponseKind::CircuitOpen) => {}
            // Admitted but short-circuited downstream of us: no verdict.
            _ => self.breaker.abandon(),
        }
    }
}

/// Gate 2: dedup guard.
struct DedupGate {
    dedup: DedupGuard<Value>,
}

#[async_trait]
impl Interceptor for DedupGate {
    fn name(&self) -> &'static str {
        "dedup"
    }

    async fn intercept(&self, request: &Request) -> InterceptOutcome {
        match self.dedup.begin(request.fingerprint()) {
            Admission::Fresh => InterceptOutcome::Continue,
            Admission::Replay(body) => InterceptOutcome::ShortCircuit(Response::replayed(body)),
            Admission::InFlight { age, window } => InterceptOutcome::ShortCircuit(Response::from(
                Rejection::DuplicateInFlight { age, window },
            )),
        }
    }

    async fn on_complete(&self, request: &Request, response: &Response, _elapsed: Duration) {
        let fingerprint = request.fingerprint();
        match (response.origin, response.kind) {
            // A produced or cache-served payload completes our record so
            // later duplicates replay it.
            (Origin::Handler | Origin::Cache, ResponseKind::Success) => {
                self.dedup.complete(fingerprint, response.body.clone());
            }
            // Failures clear the record: a client retry should re-execute.
            (Origin::Handler, _) => self.dedup.remove(fingerprint),
            // The pool gate sits after us, so its rejection orphaned the
            // record we just inserted.
            (Origin::Gate, ResponseKind::PoolExhausted) => self.dedup.remove(fingerprint),
            _ => {}
        }
    }
}

/// Gate 3: TTL cache for opted-in reads.
struct CacheGate {
    cache: TtlCache<Value>,
}

#[async_trait]
impl Interceptor for CacheGate {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn intercept(&self, request: &Request) -> InterceptOutcome {
        if !request.cacheable {
            return InterceptOutcome::Continue;
        }
        match self.cache.get(&request.cache_key()) {
            Some(body) => InterceptOutcome::ShortCircuit(Response::cached(body)),
            None => InterceptOutcome::Continue,
        }
    }

    async fn on_complete(&self, request: &Request, response: &Response, _elapsed: Duration) {
        if request.cacheable
            && response.origin == Origin::Handler
            && response.kind == ResponseKind::Success
        {
            self.cache.insert(request.cache_key(), response.body.clone());
        }
    }
}

/// Gate 4: resource pool, for requests that declare a pool key.
struct PoolGate<H: Clone + Send + 'static> {
    pool: HandlePool<H>,
    factory: Arc<dyn Fn(&str) -> H + Send + Sync>,
}

#[async_trait]
impl<H: Clone + Send + 'static> Interceptor for PoolGate<H> {
    fn name(&self) -> &'static str {
        "pool"
    }

    async fn intercept(&self, request: &Request) -> InterceptOutcome {
        let Some(key) = request.pool_key.as_deref() else {
            return InterceptOutcome::Continue;
        };
        match self.pool.get_or_create(key, || (self.factory)(key)) {
            Ok(_) => InterceptOutcome::Continue,
            Err(rejection) => InterceptOutcome::ShortCircuit(Response::from(rejection)),
        }
    }

    async fn on_complete(&self, _request: &Request, _response: &Response, _elapsed: Duration) {
        // Handles are reclaimed by idle timeout, not per request.
    }
}

/// Health snapshot for an operational dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    /// Entries currently held by the cache.
    pub cache_entries: usize,
    /// Pool occupancy.
    pub pool: PoolUtilization,
    /// Current circuit state.
    pub breaker: CircuitState,
    /// Latest resident-set sample, if the platform supports sampling.
    pub memory: Option<MemorySample>,
}

/// The composed interceptor chain.
///
/// Built once per process from a [`PipelineConfig`]; clones share all
/// component state. `H` is the pooled handle type produced by the factory
/// given to [`Pipeline::new`].
#[derive(Clone)]
pub struct Pipeline<H: Clone + Send + 'static> {
    cache: TtlCache<Value>,
    dedup: DedupGuard<Value>,
    breaker: CircuitBreaker,
    pool: HandlePool<H>,
    monitor: UsageMonitor,
    projector: ResponseProjector,
    interceptors: Vec<Arc<dyn Interceptor>>,
    config: PipelineConfig,
    factory: Arc<dyn Fn(&str) -> H + Send + Sync>,
}

impl<H: Clone + Send + 'static> Pipeline<H> {
    /// Build the pipeline with the default projector allow-list.
    ///
    /// `factory` creates a pooled handle for a key the first time the pool
    /// gate sees it (and again when an idle handle is replaced).
    pub fn new<F>(config: PipelineConfig, factory: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> H + Send + Sync + 'static,
    {
        Self::build(
            config,
            Arc::new(factory),
            ResponseProjector::default(),
            Arc::new(MonotonicClock::default()),
        )
    }

    /// Replace the projector allow-list.
    pub fn with_projector(mut self, projector: ResponseProjector) -> Self {
        self.projector = projector;
        self
    }

    /// Rebuild every component against `clock` (useful for deterministic
    /// tests). Component state is fresh afterwards, so call this before the
    /// pipeline serves traffic.
    pub fn with_clock<C: Clock + 'static>(self, clock: C) -> Self {
        Self::build(self.config, self.factory, self.projector, Arc::new(clock))
            .expect("config was validated when the pipeline was first built")
    }

    fn build(
        config: PipelineConfig,
        factory: Arc<dyn Fn(&str) -> H + Send + Sync>,
        projector: ResponseProjector,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let cache = TtlCache::new(config.cache_ttl).with_clock_arc(Arc::clone(&clock));
        let dedup = DedupGuard::new(config.dedup_window).with_clock_arc(Arc::clone(&clock));
        let breaker_config = BreakerConfig::new(
            config.failure_threshold,
            config.recovery_timeout,
            config.half_open_max_probes,
        )?;
        let breaker = CircuitBreaker::with_config(breaker_config).with_clock_arc(Arc::clone(&clock));
        let pool =
            HandlePool::new(config.max_handles, config.idle_timeout).with_clock_arc(clock);
        let monitor = UsageMonitor::new(config.memory_growth_warn_bytes);

        let interceptors: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(BreakerGate { breaker: breaker.clone() }),
            Arc::new(DedupGate { dedup: dedup.clone() }),
            Arc::new(CacheGate { cache: cache.clone() }),
            Arc::new(PoolGate { pool: pool.clone(), factory: Arc::clone(&factory) }),
        ];

        Ok(Self {
            cache,
            dedup,
            breaker,
            pool,
            monitor,
            projector,
            interceptors,
            config,
            factory,
        })
    }

    /// Drive a request through the chain and the handler.
    ///
    /// The handler runs only if every gate continues; its error is caught,
    /// counted as a breaker failure, and turned into a `handler_failed`
    /// response; nothing here is fatal to the process.
    pub async fn execute<E, Fut, Op>(&self, request: Request, handler: Op) -> Response
    where
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, E>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let span = self.monitor.begin(&request.path);

        let mut short_circuit = None;
        for interceptor in &self.interceptors {
            if let InterceptOutcome::ShortCircuit(response) =
                interceptor.intercept(&request).await
            {
                tracing::debug!(
                    gate = interceptor.name(),
                    path = %request.path,
                    reason = response.reason_code().unwrap_or("served"),
                    "request short-circuited"
                );
                short_circuit = Some(response);
                break;
            }
        }

        let mut response = match short_circuit {
            Some(response) => response,
            None => match handler().await {
                Ok(body) => Response::ok(body),
                Err(error) => {
                    tracing::error!(path = %request.path, %error, "handler failed");
                    Response::handler_error(error.to_string())
                }
            },
        };

        let elapsed = span.elapsed();
        for interceptor in self.interceptors.iter().rev() {
            interceptor.on_complete(&request, &response, elapsed).await;
        }
        self.monitor.finish(span);

        if request.project && response.is_success() {
            response.body = self.projector.project(&response.body);
        }
        response
    }

    /// Snapshot of the pipeline's health for an operational dashboard.
    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            cache_entries: self.cache.len(),
            pool: self.pool.utilization(),
            breaker: self.breaker.state(),
            memory: self.monitor.last_sample(),
        }
    }

    /// Spawn a background task purging expired cache, dedup and pool entries
    /// every `interval`.
    pub fn spawn_sweeper(&self, interval: Duration) -> SweeperHandle {
        sweep::spawn(self.cache.clone(), self.dedup.clone(), self.pool.clone(), interval)
    }

    /// The shared response cache.
    pub fn cache(&self) -> &TtlCache<Value> {
        &self.cache
    }

    /// The shared dedup guard.
    pub fn dedup(&self) -> &DedupGuard<Value> {
        &self.dedup
    }

    /// The shared circuit breaker (e.g. for an operational reset).
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// The shared handle pool.
    pub fn pool(&self) -> &HandlePool<H> {
        &self.pool
    }

    /// The shared usage monitor.
    pub fn monitor(&self) -> &UsageMonitor {
        &self.monitor
    }
}
