//! Behavior of `execute`, `acquire`, `wrap`, and lifecycle, ported against
//! the public API: retry accounting, slot attempt numbering, predicate
//! filtering, closed/drain semantics.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gentlify::{
    BackoffKind, BoxError, CircuitBreakerConfig, RetryConfig, Throttle, ThrottleConfig,
    ThrottleError, ThrottleState, TokenBudget,
};

fn quiet() -> ThrottleConfig {
    ThrottleConfig::builder()
        .min_dispatch_interval(0.0)
        .jitter_fraction(0.0)
        .build()
        .unwrap()
}

fn with_retry(max_attempts: u32) -> ThrottleConfig {
    ThrottleConfig::builder()
        .min_dispatch_interval(0.0)
        .jitter_fraction(0.0)
        .retry(RetryConfig {
            max_attempts,
            backoff: BackoffKind::Fixed,
            base_delay: 0.0,
            max_delay: 0.0,
            retryable: None,
        })
        .build()
        .unwrap()
}

#[tokio::test]
async fn execute_returns_the_value() {
    let throttle = Throttle::new(quiet()).unwrap();
    let out = throttle
        .execute(|_slot| async { Ok::<_, BoxError>(42) })
        .await
        .unwrap();
    assert_eq!(out, 42);
    assert_eq!(throttle.snapshot().completed_tasks, 1);
}

#[tokio::test]
async fn execute_propagates_user_faults_unchanged() {
    let throttle = Throttle::new(quiet()).unwrap();
    let err = throttle
        .execute(|_slot| async { Err::<(), BoxError>("user fault".into()) })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "user fault");
    assert!(err.downcast_ref::<ThrottleError>().is_none());
    assert_eq!(throttle.snapshot().failure_count, 1);
}

#[tokio::test]
async fn tokens_reported_through_the_slot_are_committed() {
    let throttle = Throttle::new(
        ThrottleConfig::builder()
            .min_dispatch_interval(0.0)
            .jitter_fraction(0.0)
            .token_budget(TokenBudget {
                max_tokens: 1000,
                window_seconds: 60.0,
            })
            .build()
            .unwrap(),
    )
    .unwrap();

    throttle
        .execute(|slot| async move {
            slot.record_tokens(50);
            Ok::<_, BoxError>("done")
        })
        .await
        .unwrap();
    assert_eq!(throttle.snapshot().tokens_used, 50);
}

#[tokio::test]
async fn retry_succeeds_on_a_later_attempt() {
    let throttle = Throttle::new(with_retry(3)).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let out = {
        let calls = calls.clone();
        throttle
            .execute(move |_slot| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err::<&str, BoxError>("transient".into())
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await
            .unwrap()
    };
    assert_eq!(out, "ok");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn exhausted_retries_propagate_the_final_fault() {
    let throttle = Throttle::new(with_retry(3)).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let err = {
        let calls = calls.clone();
        throttle
            .execute(move |_slot| {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    Err::<(), BoxError>(format!("fail-{n}").into())
                }
            })
            .await
            .unwrap_err()
    };
    assert_eq!(err.to_string(), "fail-3");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // Only the final failure lands in the adaptive window.
    assert_eq!(throttle.snapshot().failure_count, 1);
}

#[tokio::test]
async fn slot_attempt_indexes_each_try() {
    let throttle = Throttle::new(with_retry(3)).unwrap();
    let attempts = Arc::new(Mutex::new(Vec::new()));
    {
        let attempts = attempts.clone();
        throttle
            .execute(move |slot| {
                let attempts = attempts.clone();
                async move {
                    let mut seen = attempts.lock().unwrap();
                    seen.push(slot.attempt());
                    if seen.len() < 3 {
                        Err::<(), BoxError>("transient".into())
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();
    }
    assert_eq!(*attempts.lock().unwrap(), vec![0, 1, 2]);
}

#[tokio::test]
async fn non_retryable_faults_fail_immediately() {
    let throttle = Throttle::new(
        ThrottleConfig::builder()
            .min_dispatch_interval(0.0)
            .jitter_fraction(0.0)
            .retry(RetryConfig {
                max_attempts: 3,
                backoff: BackoffKind::Fixed,
                base_delay: 0.0,
                max_delay: 0.0,
                retryable: Some(Arc::new(|err: &BoxError| {
                    err.to_string().contains("transient")
                })),
            })
            .build()
            .unwrap(),
    )
    .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let err = {
        let calls = calls.clone();
        throttle
            .execute(move |_slot| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), BoxError>("permanent".into())
                }
            })
            .await
            .unwrap_err()
    };
    assert_eq!(err.to_string(), "permanent");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn breaker_tripping_mid_retry_abandons_the_loop() {
    let throttle = Throttle::new(
        ThrottleConfig::builder()
            .min_dispatch_interval(0.0)
            .jitter_fraction(0.0)
            .retry(RetryConfig {
                max_attempts: 5,
                backoff: BackoffKind::Fixed,
                base_delay: 0.0,
                max_delay: 0.0,
                retryable: None,
            })
            .circuit_breaker(CircuitBreakerConfig {
                consecutive_failures: 2,
                open_duration: 30.0,
                half_open_max_calls: 1,
            })
            .build()
            .unwrap(),
    )
    .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let err = {
        let calls = calls.clone();
        throttle
            .execute(move |_slot| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), BoxError>("fail".into())
                }
            })
            .await
            .unwrap_err()
    };
    // Two attempts, then the breaker opened and the loop abandoned.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(matches!(
        err.downcast_ref::<ThrottleError>(),
        Some(ThrottleError::CircuitOpen { .. })
    ));
}

#[tokio::test]
async fn single_attempt_retry_behaves_like_no_retry() {
    let throttle = Throttle::new(with_retry(1)).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let err = {
        let calls = calls.clone();
        throttle
            .execute(move |_slot| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), BoxError>("fail".into())
                }
            })
            .await
            .unwrap_err()
    };
    assert_eq!(err.to_string(), "fail");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn wrap_runs_the_callable_through_the_throttle() {
    let throttle = Arc::new(Throttle::new(quiet()).unwrap());
    let wrapped = throttle.wrap(|| async { Ok::<_, BoxError>("wrapped") });
    assert_eq!(wrapped().await.unwrap(), "wrapped");
    assert_eq!(wrapped().await.unwrap(), "wrapped");
    assert_eq!(throttle.snapshot().completed_tasks, 2);
}

#[tokio::test]
async fn wrap_records_failures_too() {
    let throttle = Arc::new(Throttle::new(quiet()).unwrap());
    let wrapped = throttle.wrap(|| async { Err::<(), BoxError>("boom".into()) });
    assert!(wrapped().await.is_err());
    assert_eq!(throttle.snapshot().failure_count, 1);
}

#[tokio::test]
async fn acquire_scope_records_one_outcome() {
    let throttle = Throttle::new(quiet()).unwrap();

    let permit = throttle.acquire().await.unwrap();
    permit.slot().record_tokens(5);
    permit.complete();
    assert_eq!(throttle.snapshot().completed_tasks, 1);

    let permit = throttle.acquire().await.unwrap();
    let err: BoxError = "boom".into();
    permit.complete_err(&err);
    assert_eq!(throttle.snapshot().failure_count, 1);
}

#[tokio::test(start_paused = true)]
async fn permit_duration_spans_dispatch_wait() {
    let throttle = Throttle::new(
        ThrottleConfig::builder()
            .max_concurrency(1)
            .min_dispatch_interval(1.0)
            .jitter_fraction(0.0)
            .total_tasks(3)
            .build()
            .unwrap(),
    )
    .unwrap();

    // First completion stamps the dispatch gate; instantaneous.
    let permit = throttle.acquire().await.unwrap();
    permit.complete();

    // The second admission sits out the full 1s interval, which counts
    // toward its measured duration.
    let permit = throttle.acquire().await.unwrap();
    permit.complete();

    // Durations 0s and 1s: average 0.5s for the one remaining task at
    // concurrency 1.
    let snap = throttle.snapshot();
    assert_eq!(snap.eta_seconds, Some(0.5));
}

#[tokio::test]
async fn closed_throttle_rejects_admission() {
    let throttle = Throttle::new(quiet()).unwrap();
    throttle.close();

    let err = throttle
        .execute(|_slot| async { Ok::<_, BoxError>(()) })
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ThrottleError>(),
        Some(ThrottleError::Closed)
    ));

    let err = throttle.acquire().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ThrottleError>(),
        Some(ThrottleError::Closed)
    ));
}

#[tokio::test(start_paused = true)]
async fn drain_waits_for_in_flight_work() {
    let throttle = Arc::new(Throttle::new(quiet()).unwrap());

    let worker = {
        let throttle = throttle.clone();
        tokio::spawn(async move {
            throttle
                .execute(|_slot| async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, BoxError>(())
                })
                .await
                .unwrap();
        })
    };
    // Let the worker get admitted before draining.
    tokio::time::sleep(Duration::from_millis(10)).await;

    throttle.drain().await;
    assert_eq!(throttle.snapshot().state, ThrottleState::Closed);
    worker.await.unwrap();
    assert_eq!(throttle.snapshot().completed_tasks, 1);

    let err = throttle
        .execute(|_slot| async { Ok::<_, BoxError>(()) })
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ThrottleError>(),
        Some(ThrottleError::Closed)
    ));
}

#[tokio::test]
async fn drain_is_immediate_with_nothing_in_flight() {
    let throttle = Throttle::new(quiet()).unwrap();
    throttle.drain().await;
    assert_eq!(throttle.snapshot().state, ThrottleState::Closed);
}

#[tokio::test(start_paused = true)]
async fn cancellation_releases_the_concurrency_slot() {
    let throttle = Arc::new(
        Throttle::new(
            ThrottleConfig::builder()
                .max_concurrency(1)
                .min_dispatch_interval(0.0)
                .jitter_fraction(0.0)
                .build()
                .unwrap(),
        )
        .unwrap(),
    );

    let hung = {
        let throttle = throttle.clone();
        tokio::spawn(async move {
            throttle
                .execute(|_slot| async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok::<_, BoxError>(())
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    hung.abort();
    let _ = hung.await;

    // The aborted task's permit is back; cancellation moved no counters.
    throttle
        .execute(|_slot| async { Ok::<_, BoxError>(()) })
        .await
        .unwrap();
    let snap = throttle.snapshot();
    assert_eq!(snap.completed_tasks, 1);
    assert_eq!(snap.failure_count, 0);
}
