use crate::{ContextId, FlowContextStatus, TraceId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// How a failure should be treated, decided once at the broker boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Infrastructure hiccup; the context is parked as RETRYABLE.
    Transient,
    /// Business or logic failure; the context goes straight to ERROR.
    Fatal,
    /// The graph itself is malformed.
    Structural,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

/// Stable codes attached to node failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidEventSize,
    JoberInvokeFailed,
    ConditionEvalFailed,
    FanOutInvalidItems,
    ManualTaskFailed,
    UnknownNode,
    ExecutorNotFound,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidEventSize => "INVALID_EVENT_SIZE",
            ErrorCode::JoberInvokeFailed => "JOBER_INVOKE_FAILED",
            ErrorCode::ConditionEvalFailed => "CONDITION_EVAL_FAILED",
            ErrorCode::FanOutInvalidItems => "FAN_OUT_INVALID_ITEMS",
            ErrorCode::ManualTaskFailed => "MANUAL_TASK_FAILED",
            ErrorCode::UnknownNode => "UNKNOWN_NODE",
            ErrorCode::ExecutorNotFound => "EXECUTOR_NOT_FOUND",
        }
    }

    /// Verb phrase used as the head of the rendered message.
    fn action(&self) -> &'static str {
        match self {
            ErrorCode::JoberInvokeFailed => "execute jober",
            ErrorCode::InvalidEventSize | ErrorCode::ConditionEvalFailed => "evaluate condition",
            ErrorCode::FanOutInvalidItems => "produce batch",
            ErrorCode::ManualTaskFailed => "complete manual task",
            ErrorCode::UnknownNode | ErrorCode::ExecutorNotFound => "dispatch node",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a broker while invoking fitables.
#[derive(Error, Debug, Clone)]
#[error("{error_type}: {message}")]
pub struct InvokeError {
    pub kind: ErrorKind,
    /// Short type name of the failure (e.g. `Timeout`, `HttpStatus`).
    pub error_type: String,
    pub message: String,
    /// Set when the fitable itself failed inside another flow.
    pub cause: Option<Box<FlowError>>,
}

impl InvokeError {
    pub fn new(kind: ErrorKind, error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            error_type: error_type.into(),
            message: message.into(),
            cause: None,
        }
    }

    pub fn transient(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, error_type, message)
    }

    pub fn fatal(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, error_type, message)
    }

    /// Wrap a failure that happened in a nested flow. The kind follows the inner failure.
    pub fn nested(cause: FlowError) -> Self {
        Self {
            kind: cause.kind,
            error_type: "FlowError".to_string(),
            message: cause.message.clone(),
            cause: Some(Box::new(cause)),
        }
    }
}

/// Structured failure of a single node.
///
/// Rendered to text only at the boundary. When `cause` is set the inner
/// failure's rendering is embedded verbatim, so a multi-hop chain of
/// automatic-task failures reads back from a single string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowError {
    pub stream_id: String,
    pub node_id: String,
    pub node_name: String,
    pub kind: ErrorKind,
    pub code: ErrorCode,
    pub error_type: String,
    pub message: String,
    pub cause: Option<Box<FlowError>>,
}

impl FlowError {
    pub fn new(
        stream_id: impl Into<String>,
        node_id: impl Into<String>,
        node_name: impl Into<String>,
        code: ErrorCode,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            node_id: node_id.into(),
            node_name: node_name.into(),
            kind: ErrorKind::Fatal,
            code,
            error_type: code.as_str().to_string(),
            message: String::new(),
            cause: None,
        }
    }

    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_reason(mut self, error_type: impl Into<String>, message: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self.message = message.into();
        self
    }

    pub fn caused_by(mut self, cause: FlowError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Wrap a broker failure raised while running an automatic task.
    pub fn from_invoke(
        stream_id: impl Into<String>,
        node_id: impl Into<String>,
        node_name: impl Into<String>,
        err: InvokeError,
    ) -> Self {
        let mut flow_err = Self::new(stream_id, node_id, node_name, ErrorCode::JoberInvokeFailed)
            .with_kind(err.kind)
            .with_reason(err.error_type, err.message);
        flow_err.cause = err.cause;
        flow_err
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Number of flow errors in the chain, this one included.
    pub fn depth(&self) -> usize {
        1 + self.cause.as_ref().map(|c| c.depth()).unwrap_or(0)
    }
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed, stream id: {}, node id: {}, task name: {}, cause: ",
            self.code.action(),
            self.stream_id,
            self.node_id,
            self.node_name
        )?;
        match &self.cause {
            Some(cause) => write!(f, "{}", cause),
            None => write!(f, "{}: {}", self.error_type, self.message),
        }
    }
}

impl std::error::Error for FlowError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

/// Malformed graph, reported at parse time.
#[derive(Error, Debug)]
pub enum DefinitionError {
    #[error("Invalid definition JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Definition has no start node")]
    NoStartNode,

    #[error("Definition has more than one start node: {0:?}")]
    MultipleStartNodes(Vec<String>),

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Unknown node type '{node_type}' on node {node_id}")]
    UnknownNodeType { node_id: String, node_type: String },

    #[error("Event {from} -> {to} references an unknown node")]
    UnknownEventEndpoint { from: String, to: String },

    #[error("INVALID_EVENT_SIZE: condition node {node_id} has {branches} branches but {events} events")]
    InvalidEventSize {
        node_id: String,
        branches: usize,
        events: usize,
    },

    #[error("Start node {0} has incoming events")]
    StartHasIncoming(String),

    #[error("End node {0} has outgoing events")]
    EndHasOutgoing(String),

    #[error("Node {0} has no outgoing events")]
    MissingOutgoing(String),

    #[error("Node {0} is not reachable from the start node")]
    Unreachable(String),

    #[error("Node {node_id} is missing its '{field}' section")]
    MissingSpec { node_id: String, field: String },

    #[error("Invalid configuration on node {node_id}: {reason}")]
    InvalidSpec { node_id: String, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Context not found: {0}")]
    ContextNotFound(ContextId),

    #[error("Context {id} status conflict: expected {expected}, found {actual}")]
    Conflict {
        id: ContextId,
        expected: FlowContextStatus,
        actual: FlowContextStatus,
    },

    #[error("Context {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: ContextId,
        from: FlowContextStatus,
        to: FlowContextStatus,
    },

    #[error("Trace {trace_id} already has an active context at {position}")]
    DuplicateToken { trace_id: TraceId, position: String },

    #[error("Retry record not found: {0}")]
    RetryRecordNotFound(ContextId),

    #[error("Storage error: {0}")]
    Backend(String),
}

/// Errors returned by the runtime APIs.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error("Node {node_id} not found in stream {stream_id}")]
    NodeNotFound { stream_id: String, node_id: String },

    #[error("No context of trace {trace_id} is waiting at {position}")]
    NotSuspended { trace_id: TraceId, position: String },

    #[error("Context {0} was advanced concurrently")]
    ContextConflict(ContextId),

    #[error("{0}")]
    NodeFailed(FlowError),

    #[error("Definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { id, .. } => EngineError::ContextConflict(id),
            other => EngineError::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_template_with_reason() {
        let err = FlowError::from_invoke(
            "order-1.0.0",
            "task1",
            "charge card",
            InvokeError::fatal("IllegalState", "card declined"),
        );
        assert_eq!(
            err.to_string(),
            "execute jober failed, stream id: order-1.0.0, node id: task1, task name: charge card, cause: IllegalState: card declined"
        );
        assert_eq!(err.kind, ErrorKind::Fatal);
    }

    #[test]
    fn embeds_nested_flow_error_verbatim() {
        let inner = FlowError::from_invoke(
            "inner-1",
            "n2",
            "lookup",
            InvokeError::transient("Timeout", "no answer in 3s"),
        );
        let inner_text = inner.to_string();
        let outer = FlowError::from_invoke("outer-1", "n1", "call inner", InvokeError::nested(inner));

        let text = outer.to_string();
        assert!(text.starts_with("execute jober failed, stream id: outer-1, node id: n1"));
        assert!(text.ends_with(&inner_text));
        assert_eq!(outer.depth(), 2);
        assert!(outer.is_retryable());
    }

    #[test]
    fn store_conflict_maps_to_context_conflict() {
        let id = uuid::Uuid::new_v4();
        let err: EngineError = StoreError::Conflict {
            id,
            expected: FlowContextStatus::Pending,
            actual: FlowContextStatus::Running,
        }
        .into();
        assert!(matches!(err, EngineError::ContextConflict(got) if got == id));
    }
}
