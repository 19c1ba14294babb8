use crate::executor::{FlowExecutor, Step};
use crate::memory::{InMemoryContextRepo, InMemoryRetryRepo};
use crate::registry::ExecutorRegistry;
use crate::retry::RetryPolicy;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;
use waterflow_core::{
    parser, ContextId, EngineError, EventBus, ExecutionEvent, FitableInvoker, FlowContext,
    FlowContextRepo, FlowContextStatus, FlowDefinition, FlowRetryRecord, FlowRetryRepo, Phase,
    Result, StoreError, TraceId, Transition,
};

/// Main runtime for running flow definitions.
///
/// Cloning is cheap and every clone shares the same stores, definitions and
/// event bus.
#[derive(Clone)]
pub struct FlowRuntime {
    registry: Arc<ExecutorRegistry>,
    executor: Arc<FlowExecutor>,
    event_bus: Arc<EventBus>,
    contexts: Arc<dyn FlowContextRepo>,
    retries: Arc<dyn FlowRetryRepo>,
    definitions: Arc<RwLock<HashMap<String, Arc<FlowDefinition>>>>,
    config: RuntimeConfig,
}

impl FlowRuntime {
    /// Create a runtime with default settings and in-memory stores
    pub fn new(registry: Arc<ExecutorRegistry>, invoker: Arc<dyn FitableInvoker>) -> Self {
        Self::with_registry(registry, invoker, RuntimeConfig::default())
    }

    /// Create a runtime with custom configuration and in-memory stores
    pub fn with_registry(
        registry: Arc<ExecutorRegistry>,
        invoker: Arc<dyn FitableInvoker>,
        config: RuntimeConfig,
    ) -> Self {
        Self::with_stores(
            registry,
            invoker,
            config,
            Arc::new(InMemoryContextRepo::new()),
            Arc::new(InMemoryRetryRepo::new()),
        )
    }

    /// Create a runtime over the given stores
    pub fn with_stores(
        registry: Arc<ExecutorRegistry>,
        invoker: Arc<dyn FitableInvoker>,
        config: RuntimeConfig,
        contexts: Arc<dyn FlowContextRepo>,
        retries: Arc<dyn FlowRetryRepo>,
    ) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let executor = Arc::new(FlowExecutor::new(
            config.max_parallel_nodes,
            registry.clone(),
            contexts.clone(),
            retries.clone(),
            invoker,
            event_bus.clone(),
            config.retry_policy.clone(),
        ));

        Self {
            registry,
            executor,
            event_bus,
            contexts,
            retries,
            definitions: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn retry_store(&self) -> &Arc<dyn FlowRetryRepo> {
        &self.retries
    }

    /// Register a definition; replaces any earlier one with the same stream id
    pub async fn register(&self, definition: FlowDefinition) -> String {
        let stream_id = definition.stream_id();
        tracing::info!(
            "Registering stream {} ({} nodes)",
            stream_id,
            definition.nodes.len()
        );
        self.definitions
            .write()
            .await
            .insert(stream_id.clone(), Arc::new(definition));
        stream_id
    }

    /// Parse and register a definition
    pub async fn register_json(&self, json: &str) -> Result<String> {
        let definition = parser::parse(json)?;
        Ok(self.register(definition).await)
    }

    pub async fn definition(&self, stream_id: &str) -> Result<Arc<FlowDefinition>> {
        self.definitions
            .read()
            .await
            .get(stream_id)
            .cloned()
            .ok_or_else(|| EngineError::StreamNotFound(stream_id.to_string()))
    }

    /// All registered definitions, ordered by stream id
    pub async fn definitions(&self) -> Vec<Arc<FlowDefinition>> {
        let mut definitions: Vec<Arc<FlowDefinition>> =
            self.definitions.read().await.values().cloned().collect();
        definitions.sort_by_key(|d| d.stream_id());
        definitions
    }

    /// Start a new trace of `stream_id` with `data` at the start node and run
    /// it until it pauses or ends.
    pub async fn start(
        &self,
        stream_id: &str,
        data: Value,
        operator: Option<String>,
    ) -> Result<TraceId> {
        let definition = self.definition(stream_id).await?;
        let start = definition
            .start()
            .ok_or_else(|| EngineError::NodeNotFound {
                stream_id: stream_id.to_string(),
                node_id: definition.start_node.clone(),
            })?;

        let trace_id = Uuid::new_v4();
        let context = FlowContext::new(stream_id, trace_id, &start.meta_id, data)
            .with_operator(operator.clone())
            .with_status(FlowContextStatus::Running);
        self.contexts.save(context.clone()).await?;

        tracing::info!(trace_id = %trace_id, "Starting stream {}", stream_id);
        self.event_bus.emit(ExecutionEvent::TraceStarted {
            trace_id,
            stream_id: stream_id.to_string(),
            operator,
            timestamp: Utc::now(),
        });

        self.executor
            .drive(vec![Step::new(definition, context, Phase::Arrival)])
            .await?;
        Ok(trace_id)
    }

    /// Complete the context waiting at `node_id` with `data` merged into its
    /// payload. When several lanes wait at the node the oldest is taken.
    pub async fn resume(
        &self,
        trace_id: TraceId,
        node_id: &str,
        data: Value,
    ) -> Result<Vec<FlowContext>> {
        let waiting = self
            .contexts
            .get_contexts_by_position(trace_id, node_id)
            .await?
            .into_iter()
            .find(|c| c.status == FlowContextStatus::Pending)
            .ok_or_else(|| EngineError::NotSuspended {
                trace_id,
                position: node_id.to_string(),
            })?;
        self.resume_context(waiting.id, data).await
    }

    /// Complete one waiting context. Of several concurrent calls for the same
    /// context exactly one wins; the others get `ContextConflict`.
    pub async fn resume_context(&self, context_id: ContextId, data: Value) -> Result<Vec<FlowContext>> {
        let waiting = self.contexts.get(context_id).await?;
        let definition = self.definition(&waiting.stream_id).await?;
        let node = definition
            .node(&waiting.position)
            .ok_or_else(|| EngineError::NodeNotFound {
                stream_id: waiting.stream_id.clone(),
                node_id: waiting.position.clone(),
            })?;
        if !node.is_manual() {
            return Err(EngineError::NotSuspended {
                trace_id: waiting.trace_id,
                position: waiting.position.clone(),
            });
        }

        let mut merged = waiting.clone();
        merged.merge_data(data);
        let claimed = self
            .contexts
            .transition(
                Transition::new(
                    waiting.id,
                    FlowContextStatus::Pending,
                    FlowContextStatus::Running,
                )
                .with_data(merged.data),
            )
            .await?;

        tracing::info!(
            trace_id = %claimed.trace_id,
            "Resuming context {} at {}",
            claimed.id,
            claimed.position
        );
        self.event_bus.emit(ExecutionEvent::ContextResumed {
            trace_id: claimed.trace_id,
            context_id: claimed.id,
            position: claimed.position.clone(),
            timestamp: Utc::now(),
        });
        self.event_bus.emit(ExecutionEvent::ContextTransitioned {
            trace_id: claimed.trace_id,
            context_id: claimed.id,
            position: claimed.position.clone(),
            from: Some(FlowContextStatus::Pending),
            to: FlowContextStatus::Running,
            timestamp: Utc::now(),
        });

        let drive = self
            .executor
            .drive(vec![Step::new(definition, claimed, Phase::Resume)])
            .await?;
        if let Some((_, err)) = drive.failures.into_iter().find(|(id, _)| *id == context_id) {
            return Err(EngineError::NodeFailed(err));
        }
        Ok(drive.updated)
    }

    /// Run PENDING contexts through their nodes. Contexts in any other status
    /// are skipped, as are contexts another caller claims first.
    pub async fn advance(&self, contexts: Vec<FlowContext>) -> Result<Vec<FlowContext>> {
        let mut steps = Vec::with_capacity(contexts.len());
        for context in contexts {
            if context.status != FlowContextStatus::Pending {
                tracing::debug!("Not advancing context {} in {}", context.id, context.status);
                continue;
            }
            let definition = self.definition(&context.stream_id).await?;
            steps.push(Step::new(definition, context, Phase::Arrival));
        }
        Ok(self.executor.drive(steps).await?.updated)
    }

    /// Pick up work left behind by a crash: re-drive PENDING contexts at
    /// automatic nodes, give RETRYABLE contexts without a retry record a
    /// fresh one due now, and make claimed records that never re-ran due
    /// again.
    pub async fn recover(&self) -> Result<Vec<FlowContext>> {
        let mut pending = Vec::new();
        for context in self
            .contexts
            .get_contexts_by_status(&[FlowContextStatus::Pending])
            .await?
        {
            let Ok(definition) = self.definition(&context.stream_id).await else {
                tracing::warn!(
                    "Skipping context {} of unregistered stream {}",
                    context.id,
                    context.stream_id
                );
                continue;
            };
            let manual = definition
                .node(&context.position)
                .map(|n| n.is_manual())
                .unwrap_or(false);
            if !manual {
                pending.push(context);
            }
        }

        for context in self
            .contexts
            .get_contexts_by_status(&[FlowContextStatus::Retryable])
            .await?
        {
            match self.retries.find(context.id).await? {
                None => {
                    tracing::warn!("Recreating missing retry record for context {}", context.id);
                    self.retries
                        .save(FlowRetryRecord::first(context.id, Utc::now()))
                        .await?;
                }
                Some(record) if record.next_retry_time.is_none() => {
                    tracing::warn!("Releasing stale retry claim of context {}", context.id);
                    self.retries.reschedule(context.id, Utc::now()).await?;
                }
                Some(_) => {}
            }
        }

        tracing::info!("Recovering {} pending contexts", pending.len());
        self.advance(pending).await
    }

    /// Claim the retry record of `context_id` and run the context again.
    /// `None` when the record is not due or someone else claimed it.
    pub async fn retry(&self, context_id: ContextId) -> Result<Option<Vec<FlowContext>>> {
        let Some(record) = self.retries.claim(context_id, Utc::now()).await? else {
            return Ok(None);
        };
        let context = match self.contexts.get(context_id).await {
            Ok(context) if context.status == FlowContextStatus::Retryable => context,
            Ok(context) => {
                tracing::warn!(
                    "Dropping retry record of context {} in {}",
                    context_id,
                    context.status
                );
                self.retries.delete(context_id).await?;
                return Ok(None);
            }
            Err(e) => {
                self.retries.delete(context_id).await?;
                return Err(e.into());
            }
        };

        tracing::info!(
            trace_id = %context.trace_id,
            retry_count = record.retry_count,
            "Retrying context {} at {}",
            context.id,
            context.position
        );
        let outcome = match self.definition(&context.stream_id).await {
            Ok(definition) => self
                .executor
                .drive(vec![Step::new(definition, context, Phase::Retry)])
                .await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(drive) => Ok(Some(drive.updated)),
            Err(e) => {
                self.release_claim(context_id, record.retry_count).await;
                Err(e)
            }
        }
    }

    /// Make a claimed record due again after its re-run was aborted
    async fn release_claim(&self, context_id: ContextId, retry_count: u32) {
        let delay = chrono::Duration::from_std(self.config.retry_policy.delay_for_retry(retry_count))
            .unwrap_or_else(|_| chrono::Duration::zero());
        match self.retries.reschedule(context_id, Utc::now() + delay).await {
            Ok(_) => {}
            // Already settled by the aborted run
            Err(StoreError::RetryRecordNotFound(_)) => {}
            Err(e) => tracing::error!("Failed to release retry claim of {}: {}", context_id, e),
        }
    }

    pub async fn context(&self, id: ContextId) -> Result<FlowContext> {
        Ok(self.contexts.get(id).await?)
    }

    pub async fn contexts_by_trace(&self, trace_id: TraceId) -> Result<Vec<FlowContext>> {
        Ok(self.contexts.get_contexts_by_trace(trace_id).await?)
    }

    pub async fn contexts_by_position(
        &self,
        trace_id: TraceId,
        position: &str,
    ) -> Result<Vec<FlowContext>> {
        Ok(self
            .contexts
            .get_contexts_by_position(trace_id, position)
            .await?)
    }

    pub async fn contexts_by_status(
        &self,
        statuses: &[FlowContextStatus],
    ) -> Result<Vec<FlowContext>> {
        Ok(self.contexts.get_contexts_by_status(statuses).await?)
    }

    pub async fn retry_record(&self, context_id: ContextId) -> Result<Option<FlowRetryRecord>> {
        Ok(self.retries.find(context_id).await?)
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub max_parallel_nodes: usize,
    pub event_buffer_size: usize,
    /// Period of the retry scheduler loop
    pub scheduler_interval: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 10,
            event_buffer_size: 1000,
            scheduler_interval: Duration::from_secs(1),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `WATERFLOW_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = positive_env_var("WATERFLOW_MAX_PARALLEL") {
            config.max_parallel_nodes = n;
        }
        if let Some(n) = positive_env_var("WATERFLOW_EVENT_BUFFER") {
            config.event_buffer_size = n;
        }
        if let Some(ms) = positive_env_var("WATERFLOW_RETRY_INTERVAL_MS") {
            config.scheduler_interval = Duration::from_millis(ms);
        }
        if let Some(n) = env_var("WATERFLOW_MAX_RETRIES") {
            config.retry_policy.max_retries = n;
        }
        if let Some(ms) = env_var("WATERFLOW_RETRY_INITIAL_MS") {
            config.retry_policy.initial_interval = Duration::from_millis(ms);
        }
        config
    }

    pub fn with_max_parallel_nodes(mut self, n: usize) -> Self {
        self.max_parallel_nodes = n;
        self
    }

    pub fn with_scheduler_interval(mut self, interval: Duration) -> Self {
        self.scheduler_interval = interval;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

fn env_var<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring invalid {}={}", name, raw);
            None
        }
    }
}

/// Like `env_var`, but zero is rejected too
fn positive_env_var<T: FromStr + Default + PartialEq>(name: &str) -> Option<T> {
    let value = env_var::<T>(name)?;
    if value == T::default() {
        tracing::warn!("Ignoring {}=0, keeping the default", name);
        return None;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sizes_from_env_keep_defaults() {
        std::env::set_var("WATERFLOW_EVENT_BUFFER", "0");
        std::env::set_var("WATERFLOW_RETRY_INTERVAL_MS", "0");
        std::env::set_var("WATERFLOW_MAX_PARALLEL", "4");
        let config = RuntimeConfig::from_env();
        std::env::remove_var("WATERFLOW_EVENT_BUFFER");
        std::env::remove_var("WATERFLOW_RETRY_INTERVAL_MS");
        std::env::remove_var("WATERFLOW_MAX_PARALLEL");

        let defaults = RuntimeConfig::default();
        assert_eq!(config.event_buffer_size, defaults.event_buffer_size);
        assert_eq!(config.scheduler_interval, defaults.scheduler_interval);
        assert_eq!(config.max_parallel_nodes, 4);
    }
}
