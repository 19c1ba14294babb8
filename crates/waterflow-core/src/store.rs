use crate::{ContextId, FlowContext, FlowContextStatus, FlowRetryRecord, StoreError, TraceId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Compare-and-swap status change of one stored context.
#[derive(Debug, Clone)]
pub struct Transition {
    pub context_id: ContextId,
    pub expected: FlowContextStatus,
    pub next: FlowContextStatus,
    /// Replaces the payload when set.
    pub data: Option<Value>,
    /// Replaces the error message when set.
    pub error: Option<String>,
}

impl Transition {
    pub fn new(context_id: ContextId, expected: FlowContextStatus, next: FlowContextStatus) -> Self {
        Self {
            context_id,
            expected,
            next,
            data: None,
            error: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Unit of work applied atomically: every transition succeeds and every
/// successor is inserted, or nothing changes.
#[derive(Debug, Clone, Default)]
pub struct Commit {
    pub transitions: Vec<Transition>,
    pub successors: Vec<FlowContext>,
}

impl Commit {
    pub fn transition(transition: Transition) -> Self {
        Self {
            transitions: vec![transition],
            successors: Vec::new(),
        }
    }

    pub fn with_successors(mut self, successors: Vec<FlowContext>) -> Self {
        self.successors = successors;
        self
    }
}

/// Durable storage of flow contexts.
///
/// Implementations must reject a transition whose `expected` status does not
/// match the stored one (`StoreError::Conflict`), any move the status state
/// machine forbids, and a successor whose key already holds an active context.
#[async_trait]
pub trait FlowContextRepo: Send + Sync {
    /// Insert a new context.
    async fn save(&self, context: FlowContext) -> Result<(), StoreError>;

    /// Apply a commit; returns the transitioned contexts followed by the inserted successors.
    async fn commit(&self, commit: Commit) -> Result<Vec<FlowContext>, StoreError>;

    async fn get(&self, id: ContextId) -> Result<FlowContext, StoreError>;

    async fn get_contexts_by_trace(&self, trace_id: TraceId) -> Result<Vec<FlowContext>, StoreError>;

    async fn get_contexts_by_position(
        &self,
        trace_id: TraceId,
        position: &str,
    ) -> Result<Vec<FlowContext>, StoreError>;

    async fn get_contexts_by_status(
        &self,
        statuses: &[FlowContextStatus],
    ) -> Result<Vec<FlowContext>, StoreError>;

    /// Single compare-and-swap.
    async fn transition(&self, transition: Transition) -> Result<FlowContext, StoreError> {
        let id = transition.context_id;
        self.commit(Commit::transition(transition))
            .await?
            .into_iter()
            .next()
            .ok_or(StoreError::ContextNotFound(id))
    }
}

/// Durable retry bookkeeping, keyed by context id.
#[async_trait]
pub trait FlowRetryRepo: Send + Sync {
    /// Insert or replace.
    async fn save(&self, record: FlowRetryRecord) -> Result<(), StoreError>;

    async fn find(&self, context_id: ContextId) -> Result<Option<FlowRetryRecord>, StoreError>;

    /// Records whose `next_retry_time` is at or before `now`.
    async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<FlowRetryRecord>, StoreError>;

    /// Atomically take a due record for one attempt: bumps `retry_count`,
    /// sets `last_retry_time = now` and clears `next_retry_time`. Returns
    /// `None` when the record is missing, not due, or already claimed.
    async fn claim(
        &self,
        context_id: ContextId,
        now: DateTime<Utc>,
    ) -> Result<Option<FlowRetryRecord>, StoreError>;

    async fn delete(&self, context_id: ContextId) -> Result<(), StoreError>;

    /// Schedule the next attempt of an existing record.
    async fn reschedule(
        &self,
        context_id: ContextId,
        next_retry_time: DateTime<Utc>,
    ) -> Result<FlowRetryRecord, StoreError> {
        let mut record = self
            .find(context_id)
            .await?
            .ok_or(StoreError::RetryRecordNotFound(context_id))?;
        record.next_retry_time = Some(next_retry_time);
        self.save(record.clone()).await?;
        Ok(record)
    }
}
