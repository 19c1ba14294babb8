use crate::{BatchId, ContextId, FlowContext, FlowDefinition, FlowError, FlowNode, NodeType};
use async_trait::async_trait;
use serde_json::Value;

/// Why the executor is being invoked for this context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// First time the context reaches the node.
    Arrival,
    /// External completion signal for a suspended context.
    Resume,
    /// Re-injected by the retry scheduler.
    Retry,
}

/// Core trait implemented by every node kind
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Node kind handled by this executor
    fn node_type(&self) -> NodeType;

    /// Short human-readable description
    fn description(&self) -> &str {
        ""
    }

    /// Run the node logic for one context
    async fn execute(&self, input: NodeInput<'_>) -> Result<NodeOutcome, FlowError>;
}

/// Everything an executor may look at. The context is RUNNING while it executes.
#[derive(Clone, Copy)]
pub struct NodeInput<'a> {
    pub definition: &'a FlowDefinition,
    pub node: &'a FlowNode,
    pub context: &'a FlowContext,
    pub phase: Phase,
}

impl<'a> NodeInput<'a> {
    pub fn new(
        definition: &'a FlowDefinition,
        node: &'a FlowNode,
        context: &'a FlowContext,
        phase: Phase,
    ) -> Self {
        Self {
            definition,
            node,
            context,
            phase,
        }
    }

    /// Error pre-filled with this node's identity.
    pub fn error(&self, code: crate::ErrorCode) -> FlowError {
        FlowError::new(
            self.definition.stream_id(),
            &self.node.meta_id,
            &self.node.name,
            code,
        )
    }

    /// Emit `data` along every outgoing event.
    pub fn follow_all(&self, data: Value) -> Vec<Emission> {
        self.node
            .events
            .iter()
            .map(|event| Emission::to(&event.to, data.clone()))
            .collect()
    }
}

/// A successor to create at `to`.
#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    pub to: String,
    pub data: Value,
    /// Fan-out slot `(batch, lane)`; `None` keeps the parent's slot.
    pub batch: Option<(BatchId, u32)>,
    /// Set when the successor leaves its batch (fan-in).
    pub leave_batch: bool,
    pub contributors: Vec<ContextId>,
}

impl Emission {
    pub fn to(to: impl Into<String>, data: Value) -> Self {
        Self {
            to: to.into(),
            data,
            batch: None,
            leave_batch: false,
            contributors: Vec::new(),
        }
    }

    pub fn in_batch(mut self, batch: BatchId, lane: u32) -> Self {
        self.batch = Some((batch, lane));
        self
    }

    pub fn joined(mut self, contributors: Vec<ContextId>) -> Self {
        self.leave_batch = true;
        self.contributors = contributors;
        self
    }

    /// Materialize the successor context of `parent`.
    pub fn into_context(self, parent: &FlowContext) -> FlowContext {
        let mut next = parent.successor(self.to, self.data);
        if let Some((batch, lane)) = self.batch {
            next.to_batch = Some(batch);
            next.lane = Some(lane);
        }
        if self.leave_batch {
            next.to_batch = None;
            next.lane = None;
        }
        next.contributors = self.contributors;
        next
    }
}

/// Result of running a node for one context.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    /// Archive the context and create these successors.
    Advance(Vec<Emission>),
    /// Park the context as PENDING until it is resumed.
    Suspend,
    /// Park the context as PENDING until its batch peers arrive.
    Hold,
    /// Archive the context and every other member, then create the merged successors.
    Join {
        members: Vec<ContextId>,
        emissions: Vec<Emission>,
    },
    /// Archive the context; the trace ends here.
    Finish,
}
