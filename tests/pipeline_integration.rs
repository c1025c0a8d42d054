use breakwater::{
    BatchCoalescer, BatchConfig, BatchOp, CircuitState, ManualClock, Origin, Pipeline,
    PipelineConfig, Request, ResponseKind, Submission,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn pipeline(clock: &ManualClock) -> Pipeline<String> {
    Pipeline::new(PipelineConfig::default(), |key: &str| key.to_string())
        .unwrap()
        .with_clock(clock.clone())
}

#[tokio::test]
async fn cached_read_expires_after_five_minutes() {
    let clock = ManualClock::new();
    let pipeline = pipeline(&clock);
    let calls = Arc::new(AtomicUsize::new(0));

    let read = |n: u64| {
        let calls = calls.clone();
        let pipeline = pipeline.clone();
        async move {
            pipeline
                .execute(Request::new("GET", "/messages").cacheable(), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, std::io::Error>(json!({ "generation": n }))
                })
                .await
        }
    };

    let first = read(1).await;
    assert_eq!(first.body, json!({"generation": 1}));

    // Within the TTL (and outside the dedup window): served from cache.
    clock.advance(10_000);
    let hit = read(2).await;
    assert_eq!(hit.origin, Origin::Cache);
    assert_eq!(hit.body, json!({"generation": 1}));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Five minutes later the entry is gone and the handler runs again.
    clock.advance(300_000);
    let refreshed = read(3).await;
    assert_eq!(refreshed.origin, Origin::Handler);
    assert_eq!(refreshed.body, json!({"generation": 3}));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn identical_posts_one_second_apart_replay_the_first_response() {
    let clock = ManualClock::new();
    let pipeline = pipeline(&clock);
    let request = Request::new("POST", "/messages")
        .with_body(json!({"text": "hello", "room": "general"}))
        .with_principal("user-1");

    let first = pipeline
        .execute(request.clone(), || async { Ok::<_, std::io::Error>(json!({"id": 41})) })
        .await;
    assert_eq!(first.origin, Origin::Handler);

    clock.advance(1_000);
    let second = pipeline
        .execute(request, || async { Ok::<_, std::io::Error>(json!({"id": 42})) })
        .await;

    assert_eq!(second.origin, Origin::Replay);
    assert_eq!(second.body, first.body, "the duplicate must observe the original response");
}

#[tokio::test]
async fn concurrent_duplicate_is_rejected_while_first_is_in_flight() {
    let clock = ManualClock::new();
    let pipeline = pipeline(&clock);
    let request = Request::new("POST", "/messages").with_body(json!({"text": "hi"}));

    let (started_tx, started_rx) = tokio::sync::oneshot::channel();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel();

    let slow = {
        let pipeline = pipeline.clone();
        let request = request.clone();
        tokio::spawn(async move {
            pipeline
                .execute(request, move || async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    Ok::<_, std::io::Error>(json!({"id": 1}))
                })
                .await
        })
    };

    started_rx.await.expect("first request must reach its handler");

    let duplicate = pipeline
        .execute(request, || async { Ok::<_, std::io::Error>(json!({"id": 2})) })
        .await;
    assert_eq!(duplicate.kind, ResponseKind::DuplicateInFlight);
    assert_eq!(duplicate.origin, Origin::Gate);
    assert_eq!(duplicate.body["error"], json!("duplicate_in_flight"));

    let _ = release_tx.send(());
    let first = slow.await.unwrap();
    assert!(first.is_success());
}

#[tokio::test]
async fn breaker_trips_recovers_and_closes() {
    let clock = ManualClock::new();
    let pipeline = pipeline(&clock);
    let calls = Arc::new(AtomicUsize::new(0));

    // Five consecutive failures trip the breaker.
    for i in 0..5 {
        let calls = calls.clone();
        let response = pipeline
            .execute(Request::new("POST", "/messages").with_body(json!({ "n": i })), move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<Value, _>(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "downstream down",
                    ))
                }
            })
            .await;
        assert_eq!(response.kind, ResponseKind::HandlerError);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    // The sixth call is rejected without reaching the handler, with a ~30s hint.
    let rejected = {
        let calls = calls.clone();
        pipeline
            .execute(Request::new("POST", "/messages").with_body(json!({"n": 6})), move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, std::io::Error>(json!({})) }
            })
            .await
    };
    assert_eq!(rejected.kind, ResponseKind::CircuitOpen);
    assert_eq!(rejected.body["retry_after_secs"], json!(30));
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    // After 31 simulated seconds, the trial passes and the circuit closes.
    clock.advance(31_000);
    let trial = pipeline
        .execute(Request::new("POST", "/messages").with_body(json!({"n": 7})), || async {
            Ok::<_, std::io::Error>(json!({"id": 1}))
        })
        .await;
    assert!(trial.is_success());
    assert_eq!(pipeline.breaker().state(), CircuitState::Closed);
    assert_eq!(pipeline.breaker().failure_count(), 0);
}

#[tokio::test]
async fn pool_serves_ten_keys_and_rejects_the_eleventh() {
    let clock = ManualClock::new();
    let pipeline = pipeline(&clock);

    for key in ["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"] {
        let response = pipeline
            .execute(
                Request::new("GET", "/locations")
                    .with_body(json!({ "key": key }))
                    .with_pool_key(key),
                || async { Ok::<_, std::io::Error>(json!({})) },
            )
            .await;
        assert!(response.is_success(), "key {key} should acquire a handle");
    }

    let overflow = pipeline
        .execute(
            Request::new("GET", "/locations").with_body(json!({"key": "k"})).with_pool_key("k"),
            || async { Ok::<_, std::io::Error>(json!({})) },
        )
        .await;
    assert_eq!(overflow.kind, ResponseKind::PoolExhausted);

    let status = pipeline.status();
    assert_eq!(status.pool.active, 10);
    assert_eq!(status.pool.max, 10);
}

fn op(value: i64) -> BatchOp<i64, std::io::Error> {
    Box::new(move || Box::pin(async move { Ok(value) }))
}

#[tokio::test(start_paused = true)]
async fn small_batch_flushes_at_the_timer() {
    let coalescer: BatchCoalescer<i64, std::io::Error> =
        BatchCoalescer::new(BatchConfig::default());
    let started = tokio::time::Instant::now();

    let mut waiters = Vec::new();
    for i in 0..3 {
        tokio::time::advance(Duration::from_millis(15)).await;
        match coalescer.submit("room-1", op(i), false).await {
            Submission::Queued { pending, done } => {
                assert_eq!(pending as i64, i + 1);
                waiters.push(done);
            }
            other => panic!("expected Queued, got {:?}", other),
        }
    }

    for done in waiters {
        let results = done.await.unwrap().unwrap();
        assert_eq!(*results, vec![0, 1, 2]);
    }
    assert_eq!(
        started.elapsed(),
        Duration::from_millis(115),
        "flush happens 100ms after the first submission"
    );
}

#[tokio::test(start_paused = true)]
async fn full_batch_flushes_immediately() {
    let coalescer: BatchCoalescer<i64, std::io::Error> =
        BatchCoalescer::new(BatchConfig::default());

    for i in 0..9 {
        assert!(matches!(
            coalescer.submit("room-2", op(i), false).await,
            Submission::Queued { .. }
        ));
    }
    let tenth = coalescer.submit("room-2", op(9), false).await;

    match tenth {
        Submission::Flushed(Ok(results)) => {
            assert_eq!(*results, (0..10).collect::<Vec<_>>());
        }
        other => panic!("expected immediate flush, got {:?}", other),
    }
}

#[tokio::test]
async fn status_snapshot_serializes_for_dashboards() {
    let clock = ManualClock::new();
    let pipeline = pipeline(&clock);

    let _ = pipeline
        .execute(Request::new("GET", "/messages").cacheable().with_pool_key("conn"), || async {
            Ok::<_, std::io::Error>(json!([]))
        })
        .await;

    let status = serde_json::to_value(pipeline.status()).unwrap();
    assert_eq!(status["cache_entries"], json!(1));
    assert_eq!(status["pool"]["active"], json!(1));
    assert_eq!(status["pool"]["max"], json!(10));
    assert_eq!(status["breaker"], json!("closed"));
}
