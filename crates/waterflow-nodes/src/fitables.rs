use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use waterflow_core::{FitableInvoker, InvokeError};

type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, InvokeError>> + Send + Sync>;

/// In-process broker: fitables are async closures registered by id
#[derive(Default, Clone)]
pub struct LocalFitables {
    handlers: Arc<DashMap<String, Handler>>,
}

impl LocalFitables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async handler, replacing any previous one with this id
    pub fn register<F, Fut>(&self, id: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, InvokeError>> + Send + 'static,
    {
        let id = id.into();
        tracing::info!("Registering fitable: {}", id);
        let boxed: Handler = Arc::new(
            move |args| -> BoxFuture<'static, Result<Value, InvokeError>> {
                Box::pin(handler(args))
            },
        );
        self.handlers.insert(id, boxed);
    }

    /// Register a synchronous handler
    pub fn register_fn<F>(&self, id: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Result<Value, InvokeError> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.register(id, move |args| {
            let handler = handler.clone();
            async move { handler(args) }
        });
    }

    pub fn contains(&self, id: &str) -> bool {
        self.handlers.contains_key(id)
    }
}

#[async_trait]
impl FitableInvoker for LocalFitables {
    async fn invoke(&self, fitable_ids: &[String], args: &Value) -> Result<Value, InvokeError> {
        let mut current = args.clone();
        for id in fitable_ids {
            // Clone out of the map so no shard lock is held across the await
            let handler = self
                .handlers
                .get(id)
                .map(|h| h.value().clone())
                .ok_or_else(|| {
                    InvokeError::fatal("FitableNotFound", format!("no fitable registered as {}", id))
                })?;
            current = handler(current).await?;
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn fitables_run_in_sequence() {
        let fitables = LocalFitables::new();
        fitables.register_fn("double", |args| Ok(json!({"n": args["n"].as_i64().unwrap_or(0) * 2})));
        fitables.register("inc", |args: Value| async move {
            Ok(json!({"n": args["n"].as_i64().unwrap_or(0) + 1}))
        });

        let ids = vec!["double".to_string(), "inc".to_string()];
        let out = fitables.invoke(&ids, &json!({"n": 5})).await.unwrap();
        assert_eq!(out, json!({"n": 11}));
    }

    #[tokio::test]
    async fn unknown_fitable_is_fatal() {
        let fitables = LocalFitables::new();
        let err = fitables
            .invoke(&["missing".to_string()], &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, waterflow_core::ErrorKind::Fatal);
        assert_eq!(err.error_type, "FitableNotFound");
    }
}
