mod common;

use common::{at, count, runtime};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use waterflow_core::{parser, FlowContext, FlowContextStatus, NodeExecutor, NodeInput, NodeOutcome, Phase};
use waterflow_nodes::{FanInExecutor, LocalFitables};
use waterflow_runtime::RuntimeConfig;

fn pricing_flow(min_batch: usize) -> Value {
    json!({
        "metaId": "pricing",
        "nodes": [
            {"metaId": "start", "type": "start"},
            {"metaId": "split", "type": "fanOut",
             "fanOut": {"items": "order.lines", "itemKey": "line"}},
            {"metaId": "price", "type": "state",
             "jober": {"fitables": ["price"], "converter": "key:price"}},
            {"metaId": "join", "type": "fanIn",
             "fanIn": {"minBatch": min_batch, "collectInto": "priced"}},
            {"metaId": "end", "type": "end"}
        ],
        "events": [
            {"from": "start", "to": "split"},
            {"from": "split", "to": "price"},
            {"from": "price", "to": "join"},
            {"from": "join", "to": "end"}
        ]
    })
}

fn price_fitables() -> LocalFitables {
    let fitables = LocalFitables::new();
    fitables.register("price", |args: Value| async move {
        let qty = args["line"]["qty"].as_u64().unwrap_or(0);
        // Later lanes finish first
        tokio::time::sleep(Duration::from_millis(5 * (4 - qty.min(4)))).await;
        Ok(json!(qty * 10))
    });
    fitables
}

#[tokio::test]
async fn test_fan_out_then_fan_in_rejoins_once() {
    let runtime = runtime(&price_fitables(), RuntimeConfig::default());
    let stream = runtime.register_json(&pricing_flow(3).to_string()).await.unwrap();
    let data = json!({"order": {"lines": [{"qty": 1}, {"qty": 2}, {"qty": 3}]}});
    let trace = runtime.start(&stream, data, None).await.unwrap();

    let contexts = runtime.contexts_by_trace(trace).await.unwrap();
    let priced = at(&contexts, "price");
    assert_eq!(priced.len(), 3);
    let batch = priced[0].to_batch.unwrap();
    assert!(priced.iter().all(|c| c.to_batch == Some(batch)));
    let mut lanes: Vec<u32> = priced.iter().filter_map(|c| c.lane).collect();
    lanes.sort();
    assert_eq!(lanes, vec![0, 1, 2]);

    let joined = at(&contexts, "join");
    assert_eq!(joined.len(), 3);
    assert!(joined.iter().all(|c| c.status == FlowContextStatus::Archived));

    let end = at(&contexts, "end");
    assert_eq!(end.len(), 1, "exactly one merged successor");
    let end = end[0];
    assert_eq!(end.contributors.len(), 3);
    assert!(joined.iter().all(|c| end.contributors.contains(&c.id)));
    assert_eq!(end.to_batch, None);
    assert_eq!(end.lane, None);

    let prices: Vec<u64> = end.data["priced"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v["price"].as_u64().unwrap())
        .collect();
    assert_eq!(prices, vec![10, 20, 30], "merged in lane order");
    assert_eq!(count(&contexts, FlowContextStatus::Archived), contexts.len());
}

#[tokio::test]
async fn test_fan_in_below_threshold_holds() {
    let runtime = runtime(&price_fitables(), RuntimeConfig::default());
    let stream = runtime.register_json(&pricing_flow(3).to_string()).await.unwrap();
    let data = json!({"order": {"lines": [{"qty": 1}, {"qty": 2}]}});
    let trace = runtime.start(&stream, data, None).await.unwrap();

    let held = runtime.contexts_by_position(trace, "join").await.unwrap();
    assert_eq!(held.len(), 2);
    assert!(held.iter().all(|c| c.status == FlowContextStatus::Pending));
    assert!(runtime.contexts_by_position(trace, "end").await.unwrap().is_empty());

    // Replaying held members must not complete the batch
    runtime.recover().await.unwrap();
    assert!(runtime.contexts_by_position(trace, "end").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_fan_out_passes_data_through() {
    let runtime = runtime(&price_fitables(), RuntimeConfig::default());
    let stream = runtime.register_json(&pricing_flow(2).to_string()).await.unwrap();
    let trace = runtime
        .start(&stream, json!({"order": {"lines": []}}), None)
        .await
        .unwrap();

    let end = runtime.contexts_by_position(trace, "end").await.unwrap();
    assert_eq!(end.len(), 1);
    assert_eq!(end[0].data["priced"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_fan_out_without_array_fails() {
    let runtime = runtime(&price_fitables(), RuntimeConfig::default());
    let stream = runtime.register_json(&pricing_flow(2).to_string()).await.unwrap();
    let trace = runtime
        .start(&stream, json!({"order": {"lines": "none"}}), None)
        .await
        .unwrap();

    let split = runtime.contexts_by_position(trace, "split").await.unwrap();
    assert_eq!(split[0].status, FlowContextStatus::Error);
    assert!(split[0]
        .error
        .as_deref()
        .unwrap()
        .starts_with("produce batch failed"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_fan_in_emits_once() {
    let definition = Arc::new(parser::parse_value(pricing_flow(8)).unwrap());
    let executor = Arc::new(FanInExecutor::new());
    let trace = Uuid::new_v4();
    let batch = Uuid::new_v4();

    let handles: Vec<_> = (0..8u32)
        .map(|lane| {
            let definition = definition.clone();
            let executor = executor.clone();
            tokio::spawn(async move {
                let context = FlowContext::new(
                    definition.stream_id(),
                    trace,
                    "join",
                    json!({"line": lane}),
                )
                .with_batch(batch, lane);
                let node = definition.node("join").unwrap();
                executor
                    .execute(NodeInput::new(&definition, node, &context, Phase::Arrival))
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut joins = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            NodeOutcome::Hold => {}
            NodeOutcome::Join { members, emissions } => joins.push((members, emissions)),
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    assert_eq!(joins.len(), 1);
    let (members, emissions) = &joins[0];
    assert_eq!(members.len(), 8);
    assert_eq!(emissions.len(), 1);
    assert_eq!(emissions[0].contributors.len(), 8);
    assert_eq!(executor.open_batches(), 0);
}

#[tokio::test]
async fn test_replayed_member_is_counted_once() {
    let definition = parser::parse_value(pricing_flow(2)).unwrap();
    let node = definition.node("join").unwrap();
    let executor = FanInExecutor::new();
    let trace = Uuid::new_v4();
    let batch = Uuid::new_v4();

    let first = FlowContext::new(definition.stream_id(), trace, "join", json!({"line": 0}))
        .with_batch(batch, 0);
    for _ in 0..2 {
        let outcome = executor
            .execute(NodeInput::new(&definition, node, &first, Phase::Arrival))
            .await
            .unwrap();
        assert!(matches!(outcome, NodeOutcome::Hold));
    }
    assert_eq!(executor.open_batches(), 1);

    let second = FlowContext::new(definition.stream_id(), trace, "join", json!({"line": 1}))
        .with_batch(batch, 1);
    let outcome = executor
        .execute(NodeInput::new(&definition, node, &second, Phase::Arrival))
        .await
        .unwrap();
    match outcome {
        NodeOutcome::Join { members, .. } => assert_eq!(members, vec![first.id, second.id]),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(executor.open_batches(), 0);
}
