use async_trait::async_trait;
use waterflow_core::{
    rule, Emission, ErrorCode, FlowError, FlowEvent, NodeExecutor, NodeInput, NodeOutcome,
    NodeType,
};

/// Exclusive gateway: takes the first outgoing event, by priority, whose
/// rule holds for the context data.
pub struct ConditionExecutor;

#[async_trait]
impl NodeExecutor for ConditionExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::Condition
    }

    fn description(&self) -> &str {
        "Route to exactly one branch"
    }

    async fn execute(&self, input: NodeInput<'_>) -> Result<NodeOutcome, FlowError> {
        let data = &input.context.data;
        let mut events: Vec<&FlowEvent> = input.node.events.iter().collect();
        events.sort_by_key(|e| e.priority);

        for event in events {
            let taken = rule::holds(event.condition_rule.as_deref(), data).map_err(|e| {
                input
                    .error(ErrorCode::ConditionEvalFailed)
                    .with_reason("RuleError", e.to_string())
            })?;
            if taken {
                tracing::debug!(
                    trace_id = %input.context.trace_id,
                    "Condition {} took branch to {} (priority {})",
                    input.node.meta_id,
                    event.to,
                    event.priority
                );
                return Ok(NodeOutcome::Advance(vec![Emission::to(
                    &event.to,
                    data.clone(),
                )]));
            }
        }

        Err(input.error(ErrorCode::InvalidEventSize).with_reason(
            "InvalidEventSize",
            format!("no branch of condition {} matched", input.node.meta_id),
        ))
    }
}
