//! In-memory stores
//!
//! Both stores keep everything behind a single `parking_lot` lock so that a
//! commit is applied all-or-nothing, which gives the same at-most-once
//! advancement a database would give with a conditional update.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use waterflow_core::{
    Commit, ContextId, ContextKey, FlowContext, FlowContextRepo, FlowContextStatus,
    FlowRetryRecord, FlowRetryRepo, StoreError, TraceId,
};

#[derive(Default)]
struct ContextTable {
    contexts: HashMap<ContextId, FlowContext>,
    /// Key -> id of the active (non-terminal) context holding it
    active: HashMap<ContextKey, ContextId>,
}

/// In-memory implementation of [`FlowContextRepo`]
pub struct InMemoryContextRepo {
    table: RwLock<ContextTable>,
}

impl InMemoryContextRepo {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(ContextTable::default()),
        }
    }

    /// Number of stored contexts
    pub fn len(&self) -> usize {
        self.table.read().contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        let mut table = self.table.write();
        table.contexts.clear();
        table.active.clear();
    }
}

impl Default for InMemoryContextRepo {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted(mut contexts: Vec<FlowContext>) -> Vec<FlowContext> {
    contexts.sort_by(|a, b| a.create_at.cmp(&b.create_at).then(a.lane.cmp(&b.lane)));
    contexts
}

#[async_trait]
impl FlowContextRepo for InMemoryContextRepo {
    async fn save(&self, context: FlowContext) -> Result<(), StoreError> {
        let mut table = self.table.write();
        if context.status.is_active() {
            let key = context.key();
            if table.active.contains_key(&key) {
                return Err(StoreError::DuplicateToken {
                    trace_id: key.trace_id,
                    position: key.position,
                });
            }
            table.active.insert(key, context.id);
        }
        table.contexts.insert(context.id, context);
        Ok(())
    }

    async fn commit(&self, commit: Commit) -> Result<Vec<FlowContext>, StoreError> {
        let mut table = self.table.write();

        // Validate everything before touching anything
        let mut freed: HashSet<ContextKey> = HashSet::new();
        for t in &commit.transitions {
            let current = table
                .contexts
                .get(&t.context_id)
                .ok_or(StoreError::ContextNotFound(t.context_id))?;
            if current.status != t.expected {
                return Err(StoreError::Conflict {
                    id: t.context_id,
                    expected: t.expected,
                    actual: current.status,
                });
            }
            if !current.status.can_transition_to(t.next) {
                return Err(StoreError::InvalidTransition {
                    id: t.context_id,
                    from: current.status,
                    to: t.next,
                });
            }
            if t.next.is_terminal() {
                freed.insert(current.key());
            }
        }
        let mut claimed: HashSet<ContextKey> = HashSet::new();
        for successor in &commit.successors {
            let key = successor.key();
            let taken = table.active.contains_key(&key) && !freed.contains(&key);
            if taken || !claimed.insert(key.clone()) {
                return Err(StoreError::DuplicateToken {
                    trace_id: key.trace_id,
                    position: key.position,
                });
            }
        }

        let now = Utc::now();
        let mut updated = Vec::with_capacity(commit.transitions.len() + commit.successors.len());
        for t in commit.transitions {
            let Some(context) = table.contexts.get_mut(&t.context_id) else {
                continue;
            };
            context.status = t.next;
            context.update_at = now;
            if let Some(data) = t.data {
                context.data = data;
            }
            if let Some(error) = t.error {
                context.error = Some(error);
            }
            if t.next == FlowContextStatus::Archived {
                context.archived_at = Some(now);
            }
            let snapshot = context.clone();
            if snapshot.status.is_terminal() {
                let key = snapshot.key();
                if table.active.get(&key) == Some(&snapshot.id) {
                    table.active.remove(&key);
                }
            }
            updated.push(snapshot);
        }
        for successor in commit.successors {
            if successor.status.is_active() {
                table.active.insert(successor.key(), successor.id);
            }
            table.contexts.insert(successor.id, successor.clone());
            updated.push(successor);
        }
        Ok(updated)
    }

    async fn get(&self, id: ContextId) -> Result<FlowContext, StoreError> {
        self.table
            .read()
            .contexts
            .get(&id)
            .cloned()
            .ok_or(StoreError::ContextNotFound(id))
    }

    async fn get_contexts_by_trace(&self, trace_id: TraceId) -> Result<Vec<FlowContext>, StoreError> {
        let table = self.table.read();
        Ok(sorted(
            table
                .contexts
                .values()
                .filter(|c| c.trace_id == trace_id)
                .cloned()
                .collect(),
        ))
    }

    async fn get_contexts_by_position(
        &self,
        trace_id: TraceId,
        position: &str,
    ) -> Result<Vec<FlowContext>, StoreError> {
        let table = self.table.read();
        Ok(sorted(
            table
                .contexts
                .values()
                .filter(|c| c.trace_id == trace_id && c.position == position)
                .cloned()
                .collect(),
        ))
    }

    async fn get_contexts_by_status(
        &self,
        statuses: &[FlowContextStatus],
    ) -> Result<Vec<FlowContext>, StoreError> {
        let table = self.table.read();
        Ok(sorted(
            table
                .contexts
                .values()
                .filter(|c| statuses.contains(&c.status))
                .cloned()
                .collect(),
        ))
    }
}

/// In-memory implementation of [`FlowRetryRepo`]
pub struct InMemoryRetryRepo {
    records: RwLock<HashMap<ContextId, FlowRetryRecord>>,
}

impl InMemoryRetryRepo {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryRetryRepo {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FlowRetryRepo for InMemoryRetryRepo {
    async fn save(&self, record: FlowRetryRecord) -> Result<(), StoreError> {
        self.records.write().insert(record.context_id, record);
        Ok(())
    }

    async fn find(&self, context_id: ContextId) -> Result<Option<FlowRetryRecord>, StoreError> {
        Ok(self.records.read().get(&context_id).cloned())
    }

    async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<FlowRetryRecord>, StoreError> {
        let mut due: Vec<FlowRetryRecord> = self
            .records
            .read()
            .values()
            .filter(|r| r.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|r| r.next_retry_time);
        Ok(due)
    }

    async fn claim(
        &self,
        context_id: ContextId,
        now: DateTime<Utc>,
    ) -> Result<Option<FlowRetryRecord>, StoreError> {
        let mut records = self.records.write();
        match records.get_mut(&context_id) {
            Some(record) if record.is_due(now) => {
                record.retry_count += 1;
                record.last_retry_time = Some(now);
                record.next_retry_time = None;
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn delete(&self, context_id: ContextId) -> Result<(), StoreError> {
        self.records.write().remove(&context_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use uuid::Uuid;
    use waterflow_core::Transition;

    fn pending(trace: TraceId, position: &str) -> FlowContext {
        FlowContext::new("s-1", trace, position, json!({}))
    }

    #[tokio::test]
    async fn rejects_second_active_token_on_same_key() {
        let repo = InMemoryContextRepo::new();
        let trace = Uuid::new_v4();
        repo.save(pending(trace, "a")).await.unwrap();
        let err = repo.save(pending(trace, "a")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateToken { .. }));

        // Same position in another lane is a different slot
        repo.save(pending(trace, "a").with_batch(Uuid::new_v4(), 1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn compare_and_swap_has_one_winner() {
        let repo = InMemoryContextRepo::new();
        let ctx = pending(Uuid::new_v4(), "a");
        let id = ctx.id;
        repo.save(ctx).await.unwrap();

        let claim = Transition::new(id, FlowContextStatus::Pending, FlowContextStatus::Running);
        assert!(repo.transition(claim.clone()).await.is_ok());
        let err = repo.transition(claim).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict { actual: FlowContextStatus::Running, .. }
        ));
    }

    #[tokio::test]
    async fn archived_contexts_are_frozen() {
        let repo = InMemoryContextRepo::new();
        let ctx = pending(Uuid::new_v4(), "a");
        let id = ctx.id;
        repo.save(ctx).await.unwrap();
        let archived = repo
            .transition(Transition::new(id, FlowContextStatus::Pending, FlowContextStatus::Archived))
            .await
            .unwrap();
        assert!(archived.archived_at.is_some());

        let err = repo
            .transition(Transition::new(id, FlowContextStatus::Archived, FlowContextStatus::Running))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn commit_is_all_or_nothing() {
        let repo = InMemoryContextRepo::new();
        let trace = Uuid::new_v4();
        let current = pending(trace, "a").with_status(FlowContextStatus::Running);
        let blocker = pending(trace, "b");
        let current_id = current.id;
        repo.save(current.clone()).await.unwrap();
        repo.save(blocker).await.unwrap();

        let commit = Commit::transition(Transition::new(
            current_id,
            FlowContextStatus::Running,
            FlowContextStatus::Archived,
        ))
        .with_successors(vec![current.successor("b", json!({}))]);
        assert!(repo.commit(commit).await.is_err());
        assert_eq!(
            repo.get(current_id).await.unwrap().status,
            FlowContextStatus::Running
        );
        assert_eq!(repo.len(), 2);
    }

    #[tokio::test]
    async fn self_loop_reuses_freed_key() {
        let repo = InMemoryContextRepo::new();
        let current = pending(Uuid::new_v4(), "a").with_status(FlowContextStatus::Running);
        repo.save(current.clone()).await.unwrap();
        let commit = Commit::transition(Transition::new(
            current.id,
            FlowContextStatus::Running,
            FlowContextStatus::Archived,
        ))
        .with_successors(vec![current.successor("a", json!({"round": 2}))]);
        let updated = repo.commit(commit).await.unwrap();
        assert_eq!(updated.len(), 2);
        assert_eq!(updated[1].status, FlowContextStatus::Pending);
    }

    #[tokio::test]
    async fn retry_claim_happens_once_per_schedule() {
        let repo = InMemoryRetryRepo::new();
        let id = Uuid::new_v4();
        let now = Utc::now();
        repo.save(FlowRetryRecord::first(id, now - Duration::seconds(1)))
            .await
            .unwrap();

        assert_eq!(repo.find_due(now).await.unwrap().len(), 1);
        let claimed = repo.claim(id, now).await.unwrap().unwrap();
        assert_eq!(claimed.retry_count, 1);
        assert_eq!(claimed.last_retry_time, Some(now));
        assert_eq!(claimed.next_retry_time, None);

        assert!(repo.claim(id, now).await.unwrap().is_none());
        assert!(repo.find_due(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn records_in_the_future_are_not_due() {
        let repo = InMemoryRetryRepo::new();
        let id = Uuid::new_v4();
        let now = Utc::now();
        repo.save(FlowRetryRecord::first(id, now + Duration::minutes(5)))
            .await
            .unwrap();
        assert!(repo.find_due(now).await.unwrap().is_empty());
        assert!(repo.claim(id, now).await.unwrap().is_none());
    }
}
