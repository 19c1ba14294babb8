use async_trait::async_trait;
use std::sync::Arc;
use waterflow_core::{
    rule, ErrorCode, FitableInvoker, FlowError, NodeExecutor, NodeInput, NodeKind, NodeOutcome,
    NodeType,
};

/// Automatic task: runs the node's fitables through the broker and folds
/// the result into the context data.
pub struct JoberExecutor {
    invoker: Arc<dyn FitableInvoker>,
}

impl JoberExecutor {
    pub fn new(invoker: Arc<dyn FitableInvoker>) -> Self {
        Self { invoker }
    }
}

#[async_trait]
impl NodeExecutor for JoberExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::State
    }

    fn description(&self) -> &str {
        "Invoke fitables and merge their output"
    }

    async fn execute(&self, input: NodeInput<'_>) -> Result<NodeOutcome, FlowError> {
        let NodeKind::State(jober) = &input.node.kind else {
            return Err(input
                .error(ErrorCode::JoberInvokeFailed)
                .with_reason("IllegalState", "node is not an automatic task"));
        };
        let data = &input.context.data;

        let run = rule::holds(jober.filter.as_deref(), data).map_err(|e| {
            input
                .error(ErrorCode::ConditionEvalFailed)
                .with_reason("RuleError", e.to_string())
        })?;
        if !run {
            tracing::debug!(
                trace_id = %input.context.trace_id,
                "Filter skipped task {}",
                input.node.meta_id
            );
            return Ok(NodeOutcome::Advance(input.follow_all(data.clone())));
        }

        let output = self
            .invoker
            .invoke(&jober.fitables, data)
            .await
            .map_err(|err| {
                FlowError::from_invoke(
                    input.definition.stream_id(),
                    &input.node.meta_id,
                    &input.node.name,
                    err,
                )
            })?;

        Ok(NodeOutcome::Advance(
            input.follow_all(jober.converter.apply(data, output)),
        ))
    }
}
