use crate::InvokeError;
use async_trait::async_trait;
use serde_json::Value;

/// Broker used to reach remote task handlers ("fitables").
///
/// Implementations classify every failure into an [`crate::ErrorKind`] so the
/// runtime never has to guess whether a failure is worth retrying.
#[async_trait]
pub trait FitableInvoker: Send + Sync {
    /// Invoke the fitables in order, each receiving the previous result.
    async fn invoke(&self, fitable_ids: &[String], args: &Value) -> Result<Value, InvokeError>;
}
