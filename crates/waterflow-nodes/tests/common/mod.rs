#![allow(dead_code)]

use std::sync::Arc;
use waterflow_core::{FlowContext, FlowContextStatus};
use waterflow_nodes::{register_all, LocalFitables};
use waterflow_runtime::{
    ExecutorRegistry, FlowRuntime, InMemoryContextRepo, InMemoryRetryRepo, RuntimeConfig,
};

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Runtime over in-memory stores with every standard executor registered
pub fn runtime(fitables: &LocalFitables, config: RuntimeConfig) -> FlowRuntime {
    init_tracing();
    let invoker = Arc::new(fitables.clone());
    let mut registry = ExecutorRegistry::new();
    register_all(&mut registry, invoker.clone());
    FlowRuntime::with_registry(Arc::new(registry), invoker, config)
}

/// Like [`runtime`], also handing back the stores so tests can seed state
/// left behind by an earlier process
pub fn runtime_with_stores(
    fitables: &LocalFitables,
    config: RuntimeConfig,
) -> (FlowRuntime, Arc<InMemoryContextRepo>, Arc<InMemoryRetryRepo>) {
    init_tracing();
    let invoker = Arc::new(fitables.clone());
    let mut registry = ExecutorRegistry::new();
    register_all(&mut registry, invoker.clone());
    let contexts = Arc::new(InMemoryContextRepo::new());
    let retries = Arc::new(InMemoryRetryRepo::new());
    let runtime = FlowRuntime::with_stores(
        Arc::new(registry),
        invoker,
        config,
        contexts.clone(),
        retries.clone(),
    );
    (runtime, contexts, retries)
}

pub fn at<'a>(contexts: &'a [FlowContext], position: &str) -> Vec<&'a FlowContext> {
    contexts.iter().filter(|c| c.position == position).collect()
}

pub fn count(contexts: &[FlowContext], status: FlowContextStatus) -> usize {
    contexts.iter().filter(|c| c.status == status).count()
}
