//! Timer that re-injects RETRYABLE contexts once their backoff has elapsed

use crate::runtime::FlowRuntime;
use chrono::Utc;
use futures::future::join_all;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Outcome of one scheduler pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Records that were due
    pub due: usize,
    /// Records this pass claimed and re-ran
    pub retried: usize,
    /// Re-runs aborted by a store error
    pub failed: usize,
}

/// Shortest period `run` ticks at
const MIN_INTERVAL: Duration = Duration::from_millis(1);

pub struct RetryScheduler {
    runtime: FlowRuntime,
    interval: Duration,
}

impl RetryScheduler {
    pub fn new(runtime: FlowRuntime) -> Self {
        let interval = runtime.config().scheduler_interval;
        Self { runtime, interval }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Re-run every due record once. Distinct contexts retry concurrently;
    /// the claim inside [`FlowRuntime::retry`] keeps a context from running
    /// twice.
    pub async fn tick(&self) -> TickReport {
        let due = match self.runtime.retry_store().find_due(Utc::now()).await {
            Ok(due) => due,
            Err(e) => {
                tracing::error!("Failed to load due retry records: {}", e);
                return TickReport::default();
            }
        };
        let mut report = TickReport {
            due: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return report;
        }

        tracing::debug!("{} retry records due", due.len());
        let results = join_all(
            due.iter()
                .map(|record| self.runtime.retry(record.context_id)),
        )
        .await;
        for (record, result) in due.iter().zip(results) {
            match result {
                Ok(Some(_)) => report.retried += 1,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!("Retry of context {} aborted: {}", record.context_id, e);
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Tick until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!("Retry scheduler running every {:?}", self.interval);
        let mut interval = tokio::time::interval(self.interval.max(MIN_INTERVAL));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
        tracing::info!("Retry scheduler stopped");
    }

    /// Run on a Tokio task; cancel the returned token to stop it
    pub fn spawn(self) -> (CancellationToken, JoinHandle<()>) {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { self.run(token).await });
        (cancel, handle)
    }
}
