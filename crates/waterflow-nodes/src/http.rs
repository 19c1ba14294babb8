use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use waterflow_core::{ErrorKind, FitableInvoker, FlowError, InvokeError};

/// Broker reaching fitables over HTTP: `POST {base_url}/fitables/{id}` with
/// the arguments as the JSON body.
pub struct HttpFitableInvoker {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFitableInvoker {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Client whose requests give up after `timeout`
    pub fn with_timeout(
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    fn url(&self, fitable_id: &str) -> String {
        format!("{}/fitables/{}", self.base_url, fitable_id)
    }

    async fn call(&self, fitable_id: &str, args: &Value) -> Result<Value, InvokeError> {
        let url = self.url(fitable_id);
        tracing::debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .json(args)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| InvokeError::transient("ReadError", format!("Failed to read response: {}", e)))?;

        if let Some(kind) = classify_status(status) {
            // A fitable that is itself a flow reports its failure as a FlowError body
            if let Ok(inner) = serde_json::from_str::<FlowError>(&body) {
                return Err(InvokeError::nested(inner));
            }
            return Err(InvokeError::new(
                kind,
                "HttpStatus",
                format!("{} returned {}: {}", fitable_id, status, body),
            ));
        }

        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| {
            InvokeError::fatal(
                "InvalidResponse",
                format!("{} returned invalid JSON: {}", fitable_id, e),
            )
        })
    }
}

/// `None` for success; 5xx and 429 may go away on their own, other errors won't
fn classify_status(status: StatusCode) -> Option<ErrorKind> {
    if status.is_success() {
        None
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Some(ErrorKind::Transient)
    } else {
        Some(ErrorKind::Fatal)
    }
}

fn request_error(e: reqwest::Error) -> InvokeError {
    if e.is_timeout() {
        InvokeError::transient("Timeout", e.to_string())
    } else if e.is_connect() {
        InvokeError::transient("ConnectError", e.to_string())
    } else if e.is_builder() {
        InvokeError::fatal("InvalidRequest", e.to_string())
    } else {
        InvokeError::transient("HttpError", format!("HTTP request failed: {}", e))
    }
}

#[async_trait]
impl FitableInvoker for HttpFitableInvoker {
    async fn invoke(&self, fitable_ids: &[String], args: &Value) -> Result<Value, InvokeError> {
        let mut current = args.clone();
        for id in fitable_ids {
            current = self.call(id, &current).await?;
        }
        Ok(current)
    }
}
