use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type TraceId = Uuid;
pub type ContextId = Uuid;
pub type BatchId = Uuid;

/// Lifecycle status of a flow context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowContextStatus {
    Pending,
    Running,
    Retryable,
    Archived,
    Error,
}

impl FlowContextStatus {
    pub const ACTIVE: [FlowContextStatus; 3] = [
        FlowContextStatus::Pending,
        FlowContextStatus::Running,
        FlowContextStatus::Retryable,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowContextStatus::Archived | FlowContextStatus::Error)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: FlowContextStatus) -> bool {
        use FlowContextStatus::*;
        match (self, next) {
            (Pending, Running) | (Pending, Archived) => true,
            (Running, Pending) | (Running, Archived) | (Running, Retryable) | (Running, Error) => {
                true
            }
            (Retryable, Running) | (Retryable, Error) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowContextStatus::Pending => "PENDING",
            FlowContextStatus::Running => "RUNNING",
            FlowContextStatus::Retryable => "RETRYABLE",
            FlowContextStatus::Archived => "ARCHIVED",
            FlowContextStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for FlowContextStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlowContextStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(FlowContextStatus::Pending),
            "RUNNING" => Ok(FlowContextStatus::Running),
            "RETRYABLE" => Ok(FlowContextStatus::Retryable),
            "ARCHIVED" => Ok(FlowContextStatus::Archived),
            "ERROR" => Ok(FlowContextStatus::Error),
            other => Err(format!("unknown context status: {}", other)),
        }
    }
}

/// Identity of a token slot: at most one active context per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextKey {
    pub trace_id: TraceId,
    pub position: String,
    /// Index inside a fan-out group, `None` outside of one.
    pub lane: Option<u32>,
}

/// A token travelling through one trace of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowContext {
    pub id: ContextId,
    pub trace_id: TraceId,
    pub stream_id: String,
    pub position: String,
    pub status: FlowContextStatus,
    pub data: Value,
    pub error: Option<String>,
    pub to_batch: Option<BatchId>,
    pub lane: Option<u32>,
    pub parent: Option<ContextId>,
    #[serde(default)]
    pub contributors: Vec<ContextId>,
    pub operator: Option<String>,
    pub create_at: DateTime<Utc>,
    pub update_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl FlowContext {
    /// New PENDING context at `position`.
    pub fn new(
        stream_id: impl Into<String>,
        trace_id: TraceId,
        position: impl Into<String>,
        data: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            trace_id,
            stream_id: stream_id.into(),
            position: position.into(),
            status: FlowContextStatus::Pending,
            data,
            error: None,
            to_batch: None,
            lane: None,
            parent: None,
            contributors: Vec::new(),
            operator: None,
            create_at: now,
            update_at: now,
            archived_at: None,
        }
    }

    pub fn with_status(mut self, status: FlowContextStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_operator(mut self, operator: Option<String>) -> Self {
        self.operator = operator;
        self
    }

    pub fn with_batch(mut self, batch: BatchId, lane: u32) -> Self {
        self.to_batch = Some(batch);
        self.lane = Some(lane);
        self
    }

    pub fn key(&self) -> ContextKey {
        ContextKey {
            trace_id: self.trace_id,
            position: self.position.clone(),
            lane: self.lane,
        }
    }

    /// Child context at `position` within the same trace, inheriting the batch slot.
    pub fn successor(&self, position: impl Into<String>, data: Value) -> FlowContext {
        let mut next = FlowContext::new(self.stream_id.clone(), self.trace_id, position, data);
        next.parent = Some(self.id);
        next.to_batch = self.to_batch;
        next.lane = self.lane;
        next.operator = self.operator.clone();
        next
    }

    /// Shallow-merge `extra` into the payload. Non-object payloads are replaced.
    pub fn merge_data(&mut self, extra: Value) {
        match (&mut self.data, extra) {
            (Value::Object(current), Value::Object(extra)) => {
                for (k, v) in extra {
                    current.insert(k, v);
                }
            }
            (_, Value::Null) => {}
            (current, extra) => *current = extra,
        }
    }
}

/// Retry bookkeeping for one RETRYABLE context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowRetryRecord {
    pub context_id: ContextId,
    pub next_retry_time: Option<DateTime<Utc>>,
    pub last_retry_time: Option<DateTime<Utc>>,
    pub retry_count: u32,
}

impl FlowRetryRecord {
    /// Record written on the first transient failure.
    pub fn first(context_id: ContextId, next_retry_time: DateTime<Utc>) -> Self {
        Self {
            context_id,
            next_retry_time: Some(next_retry_time),
            last_retry_time: None,
            retry_count: 0,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_time.map(|t| t <= now).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn terminal_states_never_move() {
        for next in [
            FlowContextStatus::Pending,
            FlowContextStatus::Running,
            FlowContextStatus::Retryable,
            FlowContextStatus::Archived,
            FlowContextStatus::Error,
        ] {
            assert!(!FlowContextStatus::Archived.can_transition_to(next));
            assert!(!FlowContextStatus::Error.can_transition_to(next));
        }
        assert!(FlowContextStatus::Retryable.can_transition_to(FlowContextStatus::Running));
        assert!(!FlowContextStatus::Pending.can_transition_to(FlowContextStatus::Retryable));
    }

    #[test]
    fn successor_keeps_trace_and_batch() {
        let batch = Uuid::new_v4();
        let ctx = FlowContext::new("s-1", Uuid::new_v4(), "a", json!({"x": 1}))
            .with_batch(batch, 2)
            .with_operator(Some("alice".into()));
        let next = ctx.successor("b", json!({"x": 2}));

        assert_eq!(next.trace_id, ctx.trace_id);
        assert_eq!(next.parent, Some(ctx.id));
        assert_eq!(next.to_batch, Some(batch));
        assert_eq!(next.lane, Some(2));
        assert_eq!(next.operator.as_deref(), Some("alice"));
        assert_eq!(next.status, FlowContextStatus::Pending);
    }

    #[test]
    fn merge_data_overwrites_keys() {
        let mut ctx = FlowContext::new("s-1", Uuid::new_v4(), "a", json!({"a": 1, "b": 1}));
        ctx.merge_data(json!({"b": 2, "c": 3}));
        assert_eq!(ctx.data, json!({"a": 1, "b": 2, "c": 3}));
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("retryable".parse::<FlowContextStatus>(), Ok(FlowContextStatus::Retryable));
        assert!("done".parse::<FlowContextStatus>().is_err());
    }
}
