//! Core abstractions for the waterflow engine
//!
//! This crate provides the flow definition model, the JSON graph parser,
//! flow contexts and retry records, and the traits the runtime consumes
//! (stores, broker, node executors). Beyond `tokio::sync::broadcast` for the
//! event bus it does not depend on an async runtime.

mod broker;
mod context;
mod definition;
mod error;
pub mod events;
mod node;
pub mod parser;
pub mod rule;
mod store;

pub use broker::FitableInvoker;
pub use context::{
    BatchId, ContextId, ContextKey, FlowContext, FlowContextStatus, FlowRetryRecord, TraceId,
};
pub use definition::{
    Callback, DefinitionStatus, FanInSpec, FanOutSpec, FlowDefinition, FlowEvent, FlowNode,
    Jober, NodeKind, NodeType, OutputConverter, TaskSpec, TriggerMode,
};
pub use error::{
    DefinitionError, EngineError, ErrorCode, ErrorKind, FlowError, InvokeError, StoreError,
};
pub use node::{Emission, NodeExecutor, NodeInput, NodeOutcome, Phase};
pub use parser::parse;
pub use store::{Commit, FlowContextRepo, FlowRetryRepo, Transition};
pub use events::*;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
