use async_trait::async_trait;
use waterflow_core::{FlowError, NodeExecutor, NodeInput, NodeOutcome, NodeType};

/// Entry node: hands the business data to every outgoing event
pub struct StartExecutor;

#[async_trait]
impl NodeExecutor for StartExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::Start
    }

    fn description(&self) -> &str {
        "Entry point of a trace"
    }

    async fn execute(&self, input: NodeInput<'_>) -> Result<NodeOutcome, FlowError> {
        Ok(NodeOutcome::Advance(
            input.follow_all(input.context.data.clone()),
        ))
    }
}

/// Terminal node: the context is archived and the trace ends here
pub struct EndExecutor;

#[async_trait]
impl NodeExecutor for EndExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::End
    }

    fn description(&self) -> &str {
        "Terminal node"
    }

    async fn execute(&self, _input: NodeInput<'_>) -> Result<NodeOutcome, FlowError> {
        Ok(NodeOutcome::Finish)
    }
}
