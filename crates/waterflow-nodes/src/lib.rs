//! Standard node library
//!
//! Executors for every node kind of a flow definition, plus the fitable
//! brokers they call out to.

mod batch;
mod condition;
mod fitables;
mod flow;
mod http;
mod jober;
mod manual;

pub use batch::{FanInExecutor, FanOutExecutor};
pub use condition::ConditionExecutor;
pub use fitables::LocalFitables;
pub use flow::{EndExecutor, StartExecutor};
pub use http::HttpFitableInvoker;
pub use jober::JoberExecutor;
pub use manual::ManualTaskExecutor;
use waterflow_core::FitableInvoker;
use waterflow_runtime::ExecutorRegistry;

use std::sync::Arc;

/// Register the executors of every node kind with a registry
pub fn register_all(registry: &mut ExecutorRegistry, invoker: Arc<dyn FitableInvoker>) {
    registry.register(Arc::new(StartExecutor));
    registry.register(Arc::new(JoberExecutor::new(invoker)));
    registry.register(Arc::new(ManualTaskExecutor));
    registry.register(Arc::new(ConditionExecutor));
    registry.register(Arc::new(FanOutExecutor));
    registry.register(Arc::new(FanInExecutor::new()));
    registry.register(Arc::new(EndExecutor));
}
