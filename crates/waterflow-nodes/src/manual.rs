use async_trait::async_trait;
use waterflow_core::{
    rule, ErrorCode, FlowError, NodeExecutor, NodeInput, NodeKind, NodeOutcome, NodeType, Phase,
};

/// Human task: waits on arrival until an external resume completes it
pub struct ManualTaskExecutor;

#[async_trait]
impl NodeExecutor for ManualTaskExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::ManualTask
    }

    fn description(&self) -> &str {
        "Wait for an external completion signal"
    }

    async fn execute(&self, input: NodeInput<'_>) -> Result<NodeOutcome, FlowError> {
        let NodeKind::ManualTask(task) = &input.node.kind else {
            return Err(input
                .error(ErrorCode::ManualTaskFailed)
                .with_reason("IllegalState", "node is not a manual task"));
        };
        let data = &input.context.data;

        match input.phase {
            Phase::Arrival => {
                let wait = rule::holds(task.filter.as_deref(), data).map_err(|e| {
                    input
                        .error(ErrorCode::ManualTaskFailed)
                        .with_reason("RuleError", e.to_string())
                })?;
                if wait {
                    tracing::info!(
                        trace_id = %input.context.trace_id,
                        "Task {} waiting at {}",
                        task.task_id,
                        input.node.meta_id
                    );
                    Ok(NodeOutcome::Suspend)
                } else {
                    Ok(NodeOutcome::Advance(input.follow_all(data.clone())))
                }
            }
            Phase::Resume | Phase::Retry => {
                Ok(NodeOutcome::Advance(input.follow_all(data.clone())))
            }
        }
    }
}
