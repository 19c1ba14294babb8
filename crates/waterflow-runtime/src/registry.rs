use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use waterflow_core::{
    FlowError, FlowNode, NodeExecutor, NodeInput, NodeOutcome, NodeType, Phase,
};

/// Registry of executors, one per node kind
pub struct ExecutorRegistry {
    executors: HashMap<NodeType, Arc<dyn NodeExecutor>>,
    gated: HashMap<NodeType, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
            gated: HashMap::new(),
        }
    }

    /// Register an executor, replacing any previous one for the same kind
    pub fn register(&mut self, executor: Arc<dyn NodeExecutor>) {
        let node_type = executor.node_type();
        tracing::info!("Registering executor for node type: {}", node_type);
        self.gated
            .insert(node_type, Arc::new(ManualTrigger::new(executor.clone())));
        self.executors.insert(node_type, executor);
    }

    /// Resolve the executor for a node by its kind and trigger mode
    pub fn resolve(&self, node: &FlowNode) -> Option<Arc<dyn NodeExecutor>> {
        let node_type = node.node_type();
        // Manual tasks decide themselves when to wait
        if node.is_manual() && node_type != NodeType::ManualTask {
            self.gated.get(&node_type).cloned()
        } else {
            self.executors.get(&node_type).cloned()
        }
    }

    pub fn get(&self, node_type: NodeType) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(&node_type).cloned()
    }

    /// Get all registered node types
    pub fn list_node_types(&self) -> Vec<NodeType> {
        let mut types: Vec<NodeType> = self.executors.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Wraps an executor so that contexts pause on arrival and run the wrapped
/// logic only once resumed.
struct ManualTrigger {
    inner: Arc<dyn NodeExecutor>,
}

impl ManualTrigger {
    fn new(inner: Arc<dyn NodeExecutor>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl NodeExecutor for ManualTrigger {
    fn node_type(&self) -> NodeType {
        self.inner.node_type()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    async fn execute(&self, input: NodeInput<'_>) -> Result<NodeOutcome, FlowError> {
        match input.phase {
            Phase::Arrival => Ok(NodeOutcome::Suspend),
            Phase::Resume | Phase::Retry => self.inner.execute(input).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use waterflow_core::{parser, FlowContext};

    struct Passthrough;

    #[async_trait]
    impl NodeExecutor for Passthrough {
        fn node_type(&self) -> NodeType {
            NodeType::End
        }

        async fn execute(&self, _input: NodeInput<'_>) -> Result<NodeOutcome, FlowError> {
            Ok(NodeOutcome::Finish)
        }
    }

    #[tokio::test]
    async fn manual_trigger_suspends_on_arrival() {
        let def = parser::parse_value(json!({
            "metaId": "m",
            "nodes": [
                {"metaId": "start", "type": "start"},
                {"metaId": "end", "type": "end", "triggerMode": "manual"}
            ],
            "events": [{"from": "start", "to": "end"}]
        }))
        .unwrap();
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(Passthrough));

        let node = def.node("end").unwrap();
        let executor = registry.resolve(node).unwrap();
        let ctx = FlowContext::new(def.stream_id(), uuid::Uuid::new_v4(), "end", json!({}));

        let arrival = executor
            .execute(NodeInput::new(&def, node, &ctx, Phase::Arrival))
            .await
            .unwrap();
        assert_eq!(arrival, NodeOutcome::Suspend);

        let resumed = executor
            .execute(NodeInput::new(&def, node, &ctx, Phase::Resume))
            .await
            .unwrap();
        assert_eq!(resumed, NodeOutcome::Finish);
        assert!(registry.resolve(def.node("start").unwrap()).is_none());
    }
}
