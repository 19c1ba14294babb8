mod common;

use chrono::Utc;
use common::{runtime, runtime_with_stores};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use waterflow_core::{
    EngineError, ErrorKind, FlowContext, FlowContextRepo, FlowContextStatus, FlowError,
    FlowRetryRecord, FlowRetryRepo, InvokeError,
};
use waterflow_nodes::LocalFitables;
use waterflow_runtime::{RetryPolicy, RetryScheduler, RuntimeConfig};

fn charge_flow() -> Value {
    json!({
        "metaId": "order",
        "nodes": [
            {"metaId": "start", "type": "start"},
            {"metaId": "charge", "name": "charge card", "type": "state",
             "jober": {"fitables": ["charge"], "converter": "key:receipt"}},
            {"metaId": "end", "type": "end"}
        ],
        "events": [
            {"from": "start", "to": "charge"},
            {"from": "charge", "to": "end"}
        ]
    })
}

/// Retries due immediately so a tick right after the failure picks them up
fn immediate(max_retries: u32) -> RuntimeConfig {
    RuntimeConfig::default().with_retry_policy(RetryPolicy::fixed(Duration::ZERO, max_retries))
}

#[tokio::test]
async fn test_transient_failure_parks_context_as_retryable() {
    let fitables = LocalFitables::new();
    let healthy = Arc::new(AtomicBool::new(false));
    {
        let healthy = healthy.clone();
        fitables.register_fn("charge", move |_| {
            if healthy.load(Ordering::SeqCst) {
                Ok(json!("r-1"))
            } else {
                Err(InvokeError::transient("Timeout", "gateway did not answer"))
            }
        });
    }
    let runtime = runtime(&fitables, immediate(3));
    let stream = runtime.register_json(&charge_flow().to_string()).await.unwrap();
    let trace = runtime.start(&stream, json!({"amount": 10}), None).await.unwrap();

    let charge = runtime.contexts_by_position(trace, "charge").await.unwrap().remove(0);
    assert_eq!(charge.status, FlowContextStatus::Retryable);
    assert!(charge
        .error
        .as_deref()
        .unwrap()
        .ends_with("cause: Timeout: gateway did not answer"));

    let record = runtime.retry_record(charge.id).await.unwrap().unwrap();
    assert_eq!(record.retry_count, 0);
    assert_eq!(record.last_retry_time, None);
    assert!(record.next_retry_time.is_some());

    healthy.store(true, Ordering::SeqCst);
    let report = RetryScheduler::new(runtime.clone()).tick().await;
    assert_eq!(report.due, 1);
    assert_eq!(report.retried, 1);

    let charge = runtime.context(charge.id).await.unwrap();
    assert_eq!(charge.status, FlowContextStatus::Archived);
    assert!(runtime.retry_record(charge.id).await.unwrap().is_none());

    let end = runtime.contexts_by_position(trace, "end").await.unwrap();
    assert_eq!(end[0].data, json!({"amount": 10, "receipt": "r-1"}));
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let fitables = LocalFitables::new();
    let calls = Arc::new(AtomicUsize::new(0));
    {
        let calls = calls.clone();
        fitables.register_fn("charge", move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(InvokeError::transient("Unavailable", "503"))
        });
    }
    let runtime = runtime(&fitables, immediate(2));
    let stream = runtime.register_json(&charge_flow().to_string()).await.unwrap();
    let trace = runtime.start(&stream, json!({}), None).await.unwrap();
    let id = runtime.contexts_by_position(trace, "charge").await.unwrap()[0].id;

    let scheduler = RetryScheduler::new(runtime.clone());
    scheduler.tick().await;
    let record = runtime.retry_record(id).await.unwrap().unwrap();
    assert_eq!(record.retry_count, 1);
    assert!(record.last_retry_time.is_some());
    assert_eq!(runtime.context(id).await.unwrap().status, FlowContextStatus::Retryable);

    scheduler.tick().await;
    assert_eq!(runtime.context(id).await.unwrap().status, FlowContextStatus::Error);
    assert!(runtime.retry_record(id).await.unwrap().is_none());

    let report = scheduler.tick().await;
    assert_eq!(report.due, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 3, "first attempt plus two retries");
}

#[tokio::test]
async fn test_fatal_failure_goes_straight_to_error() {
    let fitables = LocalFitables::new();
    fitables.register_fn("charge", |_| {
        Err(InvokeError::fatal("IllegalState", "card declined"))
    });
    let runtime = runtime(&fitables, immediate(3));
    let stream = runtime.register_json(&charge_flow().to_string()).await.unwrap();
    let trace = runtime.start(&stream, json!({}), None).await.unwrap();

    let charge = runtime.contexts_by_position(trace, "charge").await.unwrap().remove(0);
    assert_eq!(charge.status, FlowContextStatus::Error);
    assert_eq!(
        charge.error.as_deref(),
        Some("execute jober failed, stream id: order-1.0.0, node id: charge, task name: charge card, cause: IllegalState: card declined")
    );
    assert!(runtime.retry_record(charge.id).await.unwrap().is_none());
    assert!(runtime.contexts_by_position(trace, "end").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_nested_flow_error_is_embedded_verbatim() {
    let inner = FlowError::from_invoke(
        "inventory-1.0.0",
        "reserve",
        "reserve stock",
        InvokeError::fatal("OutOfStock", "sku 42"),
    );
    let inner_text = inner.to_string();

    let fitables = LocalFitables::new();
    {
        let inner = inner.clone();
        fitables.register_fn("charge", move |_| Err(InvokeError::nested(inner.clone())));
    }
    let runtime = runtime(&fitables, immediate(3));
    let stream = runtime.register_json(&charge_flow().to_string()).await.unwrap();
    let trace = runtime.start(&stream, json!({}), None).await.unwrap();

    let charge = runtime.contexts_by_position(trace, "charge").await.unwrap().remove(0);
    assert_eq!(charge.status, FlowContextStatus::Error);
    let error = charge.error.unwrap();
    assert!(error.starts_with("execute jober failed, stream id: order-1.0.0, node id: charge"));
    assert!(error.ends_with(&inner_text));
    assert_eq!(inner.kind, ErrorKind::Fatal);
}

#[tokio::test]
async fn test_scheduler_loop_stops_on_cancel() {
    let fitables = LocalFitables::new();
    let healthy = Arc::new(AtomicBool::new(false));
    {
        let healthy = healthy.clone();
        fitables.register_fn("charge", move |_| {
            if healthy.swap(true, Ordering::SeqCst) {
                Ok(Value::Null)
            } else {
                Err(InvokeError::transient("Timeout", "slow"))
            }
        });
    }
    let runtime = runtime(&fitables, immediate(3));
    let stream = runtime.register_json(&charge_flow().to_string()).await.unwrap();
    let trace = runtime.start(&stream, json!({}), None).await.unwrap();

    let (cancel, handle) = RetryScheduler::new(runtime.clone())
        .with_interval(Duration::from_millis(10))
        .spawn();

    let mut finished = false;
    for _ in 0..100 {
        let end = runtime.contexts_by_position(trace, "end").await.unwrap();
        if !end.is_empty() {
            finished = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cancel.cancel();
    handle.await.unwrap();
    assert!(finished, "scheduler should have retried the charge");
}

#[tokio::test]
async fn test_recover_releases_claim_lost_in_a_crash() {
    let fitables = LocalFitables::new();
    let healthy = Arc::new(AtomicBool::new(false));
    {
        let healthy = healthy.clone();
        fitables.register_fn("charge", move |_| {
            if healthy.load(Ordering::SeqCst) {
                Ok(json!("r-2"))
            } else {
                Err(InvokeError::transient("Timeout", "gateway did not answer"))
            }
        });
    }
    let runtime = runtime(&fitables, immediate(3));
    let stream = runtime.register_json(&charge_flow().to_string()).await.unwrap();
    let trace = runtime.start(&stream, json!({}), None).await.unwrap();
    let id = runtime.contexts_by_position(trace, "charge").await.unwrap()[0].id;

    // Claimed, then the process died before the re-run
    let claimed = runtime.retry_store().claim(id, Utc::now()).await.unwrap();
    assert!(claimed.is_some());

    let scheduler = RetryScheduler::new(runtime.clone());
    assert_eq!(scheduler.tick().await.due, 0);

    runtime.recover().await.unwrap();
    let record = runtime.retry_record(id).await.unwrap().unwrap();
    assert!(record.next_retry_time.is_some());
    assert_eq!(record.retry_count, 1);

    healthy.store(true, Ordering::SeqCst);
    let report = scheduler.tick().await;
    assert_eq!(report.due, 1);
    assert_eq!(report.retried, 1);
    assert_eq!(runtime.context(id).await.unwrap().status, FlowContextStatus::Archived);
    assert!(runtime.retry_record(id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_aborted_retry_keeps_record_due() {
    let (runtime, contexts, retries) = runtime_with_stores(&LocalFitables::new(), immediate(3));
    let context = FlowContext::new("gone-1.0.0", Uuid::new_v4(), "charge", json!({}))
        .with_status(FlowContextStatus::Retryable);
    let id = context.id;
    contexts.save(context).await.unwrap();
    retries.save(FlowRetryRecord::first(id, Utc::now())).await.unwrap();

    let err = runtime.retry(id).await.unwrap_err();
    assert!(matches!(err, EngineError::StreamNotFound(ref s) if s == "gone-1.0.0"));

    let record = runtime.retry_record(id).await.unwrap().unwrap();
    assert_eq!(record.retry_count, 1);
    assert!(record.next_retry_time.is_some());
    assert_eq!(retries.find_due(Utc::now()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_zero_intervals_do_not_panic() {
    let config = RuntimeConfig {
        event_buffer_size: 0,
        scheduler_interval: Duration::ZERO,
        ..immediate(3)
    };
    let fitables = LocalFitables::new();
    fitables.register_fn("charge", |_| Ok(json!("r-3")));
    let runtime = runtime(&fitables, config);
    let _events = runtime.subscribe_events();
    let stream = runtime.register_json(&charge_flow().to_string()).await.unwrap();
    let trace = runtime.start(&stream, json!({}), None).await.unwrap();
    let end = runtime.contexts_by_position(trace, "end").await.unwrap();
    assert_eq!(end[0].status, FlowContextStatus::Archived);

    let (cancel, handle) = RetryScheduler::new(runtime.clone())
        .with_interval(Duration::ZERO)
        .spawn();
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();
    handle.await.unwrap();
}
