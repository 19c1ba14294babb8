use crate::{ContextId, FlowContextStatus, TraceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted while contexts move through a flow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    TraceStarted {
        trace_id: TraceId,
        stream_id: String,
        operator: Option<String>,
        timestamp: DateTime<Utc>,
    },
    ContextTransitioned {
        trace_id: TraceId,
        context_id: ContextId,
        position: String,
        from: Option<FlowContextStatus>,
        to: FlowContextStatus,
        timestamp: DateTime<Utc>,
    },
    ContextResumed {
        trace_id: TraceId,
        context_id: ContextId,
        position: String,
        timestamp: DateTime<Utc>,
    },
    RetryScheduled {
        trace_id: TraceId,
        context_id: ContextId,
        position: String,
        retry_count: u32,
        next_retry_time: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
    TraceFinished {
        trace_id: TraceId,
        context_id: ContextId,
        position: String,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    pub fn trace_id(&self) -> TraceId {
        match self {
            ExecutionEvent::TraceStarted { trace_id, .. }
            | ExecutionEvent::ContextTransitioned { trace_id, .. }
            | ExecutionEvent::ContextResumed { trace_id, .. }
            | ExecutionEvent::RetryScheduled { trace_id, .. }
            | ExecutionEvent::TraceFinished { trace_id, .. } => *trace_id,
        }
    }
}

/// In-process event bus; sending with no subscriber is not an error
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    /// A zero `capacity` is raised to one.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
    
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }
    
    pub fn emit(&self, event: ExecutionEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("event dropped, no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}
