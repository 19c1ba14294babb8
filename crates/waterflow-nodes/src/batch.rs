//! Fan-out (produce) and fan-in (join) nodes

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use uuid::Uuid;
use waterflow_core::{
    rule, BatchId, ContextId, Emission, ErrorCode, FlowError, NodeExecutor, NodeInput, NodeKind,
    NodeOutcome, NodeType,
};

/// Look up a dotted path (`order.items`) in the context data
fn lookup<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(data, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// `data` with `key` set to `value`; non-object data is wrapped
fn with_key(data: &Value, key: &str, value: Value) -> Value {
    let mut map = match data {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    map.insert(key.to_string(), value);
    Value::Object(map)
}

/// Splits the array at `items` into one context per element, all sharing a
/// fresh batch id. Lane `i` carries element `i` under `itemKey`.
pub struct FanOutExecutor;

#[async_trait]
impl NodeExecutor for FanOutExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::FanOut
    }

    fn description(&self) -> &str {
        "Produce one context per array element"
    }

    async fn execute(&self, input: NodeInput<'_>) -> Result<NodeOutcome, FlowError> {
        let NodeKind::FanOut(spec) = &input.node.kind else {
            return Err(input
                .error(ErrorCode::FanOutInvalidItems)
                .with_reason("IllegalState", "node is not a fan-out"));
        };
        let data = &input.context.data;
        let Some(event) = input.node.events.first() else {
            return Err(input
                .error(ErrorCode::FanOutInvalidItems)
                .with_reason("IllegalState", "fan-out has no outgoing event"));
        };

        let items = match lookup(data, &spec.items) {
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(input.error(ErrorCode::FanOutInvalidItems).with_reason(
                    "InvalidItems",
                    format!("'{}' is not an array: {}", spec.items, other),
                ))
            }
            None => {
                return Err(input.error(ErrorCode::FanOutInvalidItems).with_reason(
                    "InvalidItems",
                    format!("'{}' is missing from the context data", spec.items),
                ))
            }
        };

        if items.is_empty() {
            return Ok(NodeOutcome::Advance(vec![Emission::to(
                &event.to,
                data.clone(),
            )]));
        }

        let batch = Uuid::new_v4();
        tracing::debug!(
            trace_id = %input.context.trace_id,
            "Fan-out {} produced batch {} of {}",
            input.node.meta_id,
            batch,
            items.len()
        );
        let emissions = items
            .iter()
            .enumerate()
            .map(|(lane, item)| {
                Emission::to(&event.to, with_key(data, &spec.item_key, item.clone()))
                    .in_batch(batch, lane as u32)
            })
            .collect();
        Ok(NodeOutcome::Advance(emissions))
    }
}

#[derive(Debug, Clone)]
struct Member {
    id: ContextId,
    lane: Option<u32>,
    data: Value,
    /// Passed the fan-in filter
    included: bool,
}

/// Joins the contexts of one batch once `minBatch` of them have arrived.
///
/// Arrivals are accumulated per `(batch, node)` under the map's entry lock,
/// so a member is counted once and a full batch is handed out to exactly one
/// caller even when members arrive concurrently. Members beyond `minBatch`
/// start a new round.
///
/// Waiting entries shadow held members that stay PENDING in the context
/// store; after a restart `recover` rebuilds them from there.
#[derive(Default)]
pub struct FanInExecutor {
    batches: DashMap<(BatchId, String), Vec<Member>>,
}

impl FanInExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of batches with members waiting
    pub fn open_batches(&self) -> usize {
        self.batches.len()
    }

    fn join(
        input: &NodeInput<'_>,
        collect_into: &str,
        mut members: Vec<Member>,
    ) -> NodeOutcome {
        members.sort_by_key(|m| m.lane);
        let collected: Vec<Value> = members
            .iter()
            .filter(|m| m.included)
            .map(|m| m.data.clone())
            .collect();
        let ids: Vec<ContextId> = members.iter().map(|m| m.id).collect();
        let merged = with_key(&input.context.data, collect_into, Value::Array(collected));

        let emissions = input
            .follow_all(merged)
            .into_iter()
            .map(|emission| emission.joined(ids.clone()))
            .collect();
        NodeOutcome::Join {
            members: ids,
            emissions,
        }
    }
}

#[async_trait]
impl NodeExecutor for FanInExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::FanIn
    }

    fn description(&self) -> &str {
        "Merge the contexts of a batch"
    }

    async fn execute(&self, input: NodeInput<'_>) -> Result<NodeOutcome, FlowError> {
        let NodeKind::FanIn(spec) = &input.node.kind else {
            return Err(input
                .error(ErrorCode::UnknownNode)
                .with_reason("IllegalState", "node is not a fan-in"));
        };
        let context = input.context;

        let included = rule::holds(spec.filter.as_deref(), &context.data).map_err(|e| {
            input
                .error(ErrorCode::ConditionEvalFailed)
                .with_reason("RuleError", e.to_string())
        })?;
        let member = Member {
            id: context.id,
            lane: context.lane,
            data: context.data.clone(),
            included,
        };

        let Some(batch) = context.to_batch else {
            return Ok(Self::join(&input, &spec.collect_into, vec![member]));
        };

        let key = (batch, input.node.meta_id.clone());
        let ready = {
            let mut waiting = self.batches.entry(key.clone()).or_default();
            if waiting.iter().any(|m| m.id == member.id) {
                // Held member re-driven by `recover`; already counted
                return Ok(NodeOutcome::Hold);
            }
            waiting.push(member);
            if waiting.len() >= spec.min_batch {
                Some(std::mem::take(&mut *waiting))
            } else {
                tracing::debug!(
                    trace_id = %context.trace_id,
                    "Batch {} at {} has {}/{} members",
                    batch,
                    input.node.meta_id,
                    waiting.len(),
                    spec.min_batch
                );
                None
            }
        };

        match ready {
            Some(members) => {
                self.batches.remove_if(&key, |_, waiting| waiting.is_empty());
                tracing::info!(
                    trace_id = %context.trace_id,
                    "Joining {} members of batch {} at {}",
                    members.len(),
                    batch,
                    input.node.meta_id
                );
                Ok(Self::join(&input, &spec.collect_into, members))
            }
            None => Ok(NodeOutcome::Hold),
        }
    }
}
