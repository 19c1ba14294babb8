//! Flow execution runtime
//! 
//! This crate drives flow contexts through registered definitions: it owns
//! the executor registry, dispatches contexts to node executors, persists
//! every transition, and re-injects RETRYABLE contexts on a timer.

mod executor;
mod loader;
mod memory;
mod registry;
mod retry;
mod runtime;
mod scheduler;

pub use loader::{DefinitionLoader, LoadError};
pub use memory::{InMemoryContextRepo, InMemoryRetryRepo};
pub use registry::ExecutorRegistry;
pub use retry::RetryPolicy;
pub use runtime::{FlowRuntime, RuntimeConfig};
pub use scheduler::{RetryScheduler, TickReport};
