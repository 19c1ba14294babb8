use crate::registry::ExecutorRegistry;
use crate::retry::RetryPolicy;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use waterflow_core::{
    Commit, ContextId, Emission, EngineError, ErrorCode, EventBus, ExecutionEvent, FitableInvoker,
    FlowContext, FlowContextRepo, FlowContextStatus, FlowDefinition, FlowError, FlowRetryRecord,
    FlowRetryRepo, NodeInput, NodeOutcome, Phase, StoreError, Transition,
};

/// Join commits race with members still parking themselves; retry a few times.
const MAX_JOIN_ATTEMPTS: usize = 16;

/// A context to run through its node.
pub(crate) struct Step {
    pub definition: Arc<FlowDefinition>,
    pub context: FlowContext,
    pub phase: Phase,
}

impl Step {
    pub fn new(definition: Arc<FlowDefinition>, context: FlowContext, phase: Phase) -> Self {
        Self {
            definition,
            context,
            phase,
        }
    }
}

/// Everything one `drive` call changed.
#[derive(Debug, Default)]
pub(crate) struct Drive {
    /// Latest snapshot of every context touched, in first-touch order
    pub updated: Vec<FlowContext>,
    /// Contexts that ended in ERROR, with the failure that put them there
    pub failures: Vec<(ContextId, FlowError)>,
}

#[derive(Default)]
struct StepReport {
    updated: Vec<FlowContext>,
    next: Vec<Step>,
    failure: Option<(ContextId, FlowError)>,
}

impl StepReport {
    fn updated(updated: Vec<FlowContext>) -> Self {
        Self {
            updated,
            ..Default::default()
        }
    }
}

/// Moves contexts through the graph until no automatic work is left
pub struct FlowExecutor {
    max_parallel: usize,
    registry: Arc<ExecutorRegistry>,
    contexts: Arc<dyn FlowContextRepo>,
    retries: Arc<dyn FlowRetryRepo>,
    invoker: Arc<dyn FitableInvoker>,
    event_bus: Arc<EventBus>,
    policy: RetryPolicy,
}

impl FlowExecutor {
    pub fn new(
        max_parallel: usize,
        registry: Arc<ExecutorRegistry>,
        contexts: Arc<dyn FlowContextRepo>,
        retries: Arc<dyn FlowRetryRepo>,
        invoker: Arc<dyn FitableInvoker>,
        event_bus: Arc<EventBus>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
            registry,
            contexts,
            retries,
            invoker,
            event_bus,
            policy,
        }
    }

    /// Run the given steps and every successor they produce, at most
    /// `max_parallel` at a time. Node failures become context statuses;
    /// only store failures are returned as errors.
    pub(crate) async fn drive(&self, steps: Vec<Step>) -> Result<Drive, EngineError> {
        let mut queue: VecDeque<Step> = steps.into();
        let mut running = FuturesUnordered::new();
        let mut updated = Vec::new();
        let mut failures = Vec::new();
        let mut first_error = None;

        loop {
            while running.len() < self.max_parallel {
                match queue.pop_front() {
                    Some(step) => running.push(self.step(step)),
                    None => break,
                }
            }

            let Some(result) = running.next().await else {
                break;
            };
            match result {
                Ok(report) => {
                    updated.extend(report.updated);
                    failures.extend(report.failure);
                    queue.extend(report.next);
                }
                Err(e) => {
                    tracing::error!("Step aborted: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(Drive {
                updated: latest(updated),
                failures,
            }),
        }
    }

    async fn step(&self, step: Step) -> Result<StepReport, EngineError> {
        let Step {
            definition,
            context,
            phase,
        } = step;
        let Some(context) = self.claim(context).await? else {
            return Ok(StepReport::default());
        };

        let outcome = match definition.node(&context.position) {
            None => Err(FlowError::new(
                definition.stream_id(),
                &context.position,
                "",
                ErrorCode::UnknownNode,
            )
            .with_reason("UnknownNode", format!("no node {} in stream", context.position))),
            Some(node) => match self.registry.resolve(node) {
                None => Err(FlowError::new(
                    definition.stream_id(),
                    &node.meta_id,
                    &node.name,
                    ErrorCode::ExecutorNotFound,
                )
                .with_reason(
                    "ExecutorNotFound",
                    format!("no executor registered for node type {}", node.node_type()),
                )),
                Some(executor) => {
                    tracing::debug!(
                        trace_id = %context.trace_id,
                        "Executing {} node {} ({:?})",
                        node.node_type(),
                        node.meta_id,
                        phase
                    );
                    executor
                        .execute(NodeInput::new(&definition, node, &context, phase))
                        .await
                }
            },
        };

        match outcome {
            Ok(NodeOutcome::Advance(emissions)) => {
                self.complete(&definition, context, Vec::new(), emissions, phase, false)
                    .await
            }
            Ok(NodeOutcome::Join { members, emissions }) => {
                self.complete(&definition, context, members, emissions, phase, false)
                    .await
            }
            Ok(NodeOutcome::Finish) => {
                self.complete(&definition, context, Vec::new(), Vec::new(), phase, true)
                    .await
            }
            Ok(NodeOutcome::Suspend) | Ok(NodeOutcome::Hold) => self.park(context, phase).await,
            Err(err) => self.fail(&definition, context, err, phase).await,
        }
    }

    /// Take ownership of a PENDING or RETRYABLE context. `None` when another
    /// caller got there first.
    async fn claim(&self, context: FlowContext) -> Result<Option<FlowContext>, EngineError> {
        let from = context.status;
        if from == FlowContextStatus::Running {
            return Ok(Some(context));
        }
        let claim = Transition::new(context.id, from, FlowContextStatus::Running);
        match self.contexts.transition(claim).await {
            Ok(claimed) => {
                self.transitioned(&claimed, Some(from));
                Ok(Some(claimed))
            }
            Err(StoreError::Conflict { .. }) | Err(StoreError::InvalidTransition { .. }) => {
                tracing::debug!("Context {} already claimed, skipping", context.id);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Archive the context (and the joined members), insert the successors.
    async fn complete(
        &self,
        definition: &Arc<FlowDefinition>,
        context: FlowContext,
        members: Vec<ContextId>,
        emissions: Vec<Emission>,
        phase: Phase,
        finished: bool,
    ) -> Result<StepReport, EngineError> {
        let successors: Vec<FlowContext> = emissions
            .into_iter()
            .map(|emission| emission.into_context(&context))
            .collect();
        let others: Vec<ContextId> = members
            .into_iter()
            .filter(|id| *id != context.id)
            .collect();

        let mut attempt = 0;
        let (updated, previous) = loop {
            let mut previous: HashMap<ContextId, FlowContextStatus> = HashMap::new();
            previous.insert(context.id, FlowContextStatus::Running);
            let mut commit = Commit::transition(Transition::new(
                context.id,
                FlowContextStatus::Running,
                FlowContextStatus::Archived,
            ))
            .with_successors(successors.clone());
            for id in &others {
                let member = self.contexts.get(*id).await?;
                if member.status.is_terminal() {
                    continue;
                }
                previous.insert(*id, member.status);
                commit.transitions.push(Transition::new(
                    *id,
                    member.status,
                    FlowContextStatus::Archived,
                ));
            }

            match self.contexts.commit(commit).await {
                Ok(updated) => break (updated, previous),
                Err(StoreError::Conflict { id, .. })
                    if id != context.id && attempt < MAX_JOIN_ATTEMPTS =>
                {
                    attempt += 1;
                    tokio::task::yield_now().await;
                }
                Err(err @ StoreError::DuplicateToken { .. }) => {
                    let failure = FlowError::new(
                        definition.stream_id(),
                        &context.position,
                        node_name(definition, &context.position),
                        ErrorCode::UnknownNode,
                    )
                    .with_reason("DuplicateToken", err.to_string());
                    return self.fail(definition, context, failure, phase).await;
                }
                Err(e) => return Err(e.into()),
            }
        };

        for ctx in &updated {
            self.transitioned(ctx, previous.get(&ctx.id).copied());
        }
        if phase == Phase::Retry {
            self.retries.delete(context.id).await?;
        }

        let archived = updated
            .iter()
            .find(|c| c.id == context.id)
            .cloned()
            .unwrap_or(context);
        tracing::info!(
            trace_id = %archived.trace_id,
            "Archived context {} at {} ({} successors)",
            archived.id,
            archived.position,
            successors.len()
        );

        if let Some(callback) = definition
            .node(&archived.position)
            .and_then(|n| n.callback.as_ref())
        {
            self.notify(&callback.fitables, &archived, "node callback").await;
        }
        if let Some(callback) = &definition.callback {
            self.notify(&callback.fitables, &archived, "flow callback").await;
        }
        if finished {
            tracing::info!(trace_id = %archived.trace_id, "Trace finished at {}", archived.position);
            self.event_bus.emit(ExecutionEvent::TraceFinished {
                trace_id: archived.trace_id,
                context_id: archived.id,
                position: archived.position.clone(),
                timestamp: Utc::now(),
            });
            self.notify(&definition.finished_fitables, &archived, "finished")
                .await;
        }

        let next = successors
            .into_iter()
            .map(|successor| Step::new(definition.clone(), successor, Phase::Arrival))
            .collect();
        Ok(StepReport {
            updated,
            next,
            failure: None,
        })
    }

    /// Hand a RUNNING context back as PENDING.
    async fn park(&self, context: FlowContext, phase: Phase) -> Result<StepReport, EngineError> {
        let park = Transition::new(
            context.id,
            FlowContextStatus::Running,
            FlowContextStatus::Pending,
        );
        match self.contexts.transition(park).await {
            Ok(parked) => {
                tracing::debug!(
                    trace_id = %parked.trace_id,
                    "Context {} waiting at {}",
                    parked.id,
                    parked.position
                );
                self.transitioned(&parked, Some(FlowContextStatus::Running));
                if phase == Phase::Retry {
                    self.retries.delete(parked.id).await?;
                }
                Ok(StepReport::updated(vec![parked]))
            }
            // Archived by the join that completed its batch
            Err(StoreError::Conflict { actual, .. }) if actual.is_terminal() => {
                tracing::debug!("Context {} absorbed by join", context.id);
                Ok(StepReport::updated(vec![self.contexts.get(context.id).await?]))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Turn a node failure into RETRYABLE or ERROR.
    async fn fail(
        &self,
        definition: &FlowDefinition,
        context: FlowContext,
        err: FlowError,
        phase: Phase,
    ) -> Result<StepReport, EngineError> {
        let message = err.to_string();

        if err.is_retryable() {
            let existing = match phase {
                Phase::Retry => self.retries.find(context.id).await?,
                _ => None,
            };
            let retries_done = existing.as_ref().map(|r| r.retry_count).unwrap_or(0);

            if self.policy.has_retries_remaining(retries_done) {
                let delay = chrono::Duration::from_std(self.policy.delay_for_retry(retries_done))
                    .unwrap_or_else(|_| chrono::Duration::zero());
                let next_retry_time = Utc::now() + delay;

                let parked = self
                    .contexts
                    .transition(
                        Transition::new(
                            context.id,
                            FlowContextStatus::Running,
                            FlowContextStatus::Retryable,
                        )
                        .with_error(message.clone()),
                    )
                    .await?;
                let record = match existing {
                    Some(_) => self.retries.reschedule(context.id, next_retry_time).await?,
                    None => {
                        let record = FlowRetryRecord::first(context.id, next_retry_time);
                        self.retries.save(record.clone()).await?;
                        record
                    }
                };

                tracing::warn!(
                    trace_id = %parked.trace_id,
                    retry_count = record.retry_count,
                    "Context {} at {} is retryable, next attempt at {}: {}",
                    parked.id,
                    parked.position,
                    next_retry_time,
                    message
                );
                self.transitioned(&parked, Some(FlowContextStatus::Running));
                self.event_bus.emit(ExecutionEvent::RetryScheduled {
                    trace_id: parked.trace_id,
                    context_id: parked.id,
                    position: parked.position.clone(),
                    retry_count: record.retry_count,
                    next_retry_time,
                    timestamp: Utc::now(),
                });
                return Ok(StepReport::updated(vec![parked]));
            }
        }

        let failed = self
            .contexts
            .transition(
                Transition::new(
                    context.id,
                    FlowContextStatus::Running,
                    FlowContextStatus::Error,
                )
                .with_error(message.clone()),
            )
            .await?;
        if phase == Phase::Retry {
            self.retries.delete(failed.id).await?;
        }

        tracing::error!(
            trace_id = %failed.trace_id,
            code = %err.code,
            "Context {} failed at {}: {}",
            failed.id,
            failed.position,
            message
        );
        self.transitioned(&failed, Some(FlowContextStatus::Running));
        self.notify(&definition.exception_fitables, &failed, "exception")
            .await;

        Ok(StepReport {
            updated: vec![failed.clone()],
            next: Vec::new(),
            failure: Some((failed.id, err)),
        })
    }

    /// Fire-and-log delivery of a context to callback fitables.
    async fn notify(&self, fitables: &[String], context: &FlowContext, what: &str) {
        if fitables.is_empty() {
            return;
        }
        let args = match serde_json::to_value(context) {
            Ok(args) => args,
            Err(e) => {
                tracing::warn!("Cannot serialize context {} for {}: {}", context.id, what, e);
                return;
            }
        };
        if let Err(e) = self.invoker.invoke(fitables, &args).await {
            tracing::warn!(
                trace_id = %context.trace_id,
                "{} fitables failed for context {}: {}",
                what,
                context.id,
                e
            );
        }
    }

    fn transitioned(&self, context: &FlowContext, from: Option<FlowContextStatus>) {
        tracing::debug!(
            trace_id = %context.trace_id,
            "Context {} at {}: {:?} -> {}",
            context.id,
            context.position,
            from,
            context.status
        );
        self.event_bus.emit(ExecutionEvent::ContextTransitioned {
            trace_id: context.trace_id,
            context_id: context.id,
            position: context.position.clone(),
            from,
            to: context.status,
            timestamp: Utc::now(),
        });
    }
}

fn node_name<'a>(definition: &'a FlowDefinition, position: &str) -> &'a str {
    definition
        .node(position)
        .map(|n| n.name.as_str())
        .unwrap_or("")
}

/// Keep the last snapshot of each context, ordered by first appearance.
fn latest(updated: Vec<FlowContext>) -> Vec<FlowContext> {
    let mut index: HashMap<ContextId, usize> = HashMap::new();
    let mut out: Vec<FlowContext> = Vec::with_capacity(updated.len());
    for context in updated {
        match index.get(&context.id) {
            Some(&i) => out[i] = context,
            None => {
                index.insert(context.id, out.len());
                out.push(context);
            }
        }
    }
    out
}
