//! Tool relay client — forwards tool invocations from the AI leg to the
//! System 2 backend.
//!
//! Failures never escape as errors: a network fault, timeout, or backend
//! error comes back as a failed [`ToolResult`] so the AI can apologize and
//! the call keeps going. Retries are the backend's concern, not ours.

use std::time::Duration;

use serde_json::{json, Value};

use crate::config::RelayConfig;

/// Outcome of one relayed tool invocation.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub success: bool,
    pub payload: Value,
}

impl ToolResult {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: json!({ "status": "failed", "error": error.into() }),
        }
    }
}

pub struct RelayClient {
    client: reqwest::Client,
    url: String,
    voice_key: String,
}

#[derive(Debug, thiserror::Error)]
enum RelayError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("backend returned HTTP {0}")]
    Status(reqwest::StatusCode),
    #[error("timed out")]
    Timeout,
}

impl RelayClient {
    pub fn new(config: &RelayConfig) -> Self {
        // Constructed once at startup; a client without the timeout would
        // void the bounded-wait contract, so failure here is fatal.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("Failed to build relay HTTP client");
        Self {
            client,
            url: config.url.clone(),
            voice_key: config.voice_key.clone(),
        }
    }

    /// Forward a tool invocation to the backend. Always returns a result;
    /// failures are folded into a failed [`ToolResult`].
    pub async fn invoke(&self, tool: &str, arguments: &Value, context: &str) -> ToolResult {
        match self.post(tool, arguments, context).await {
            Ok(payload) => {
                // Backend wraps results as {success, result|error}.
                let success = payload
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if success {
                    let result = payload.get("result").cloned().unwrap_or(Value::Null);
                    ToolResult {
                        success: true,
                        payload: result,
                    }
                } else {
                    let error = payload
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("Unknown error");
                    tracing::warn!(tool, error, "Tool relay reported failure");
                    ToolResult::failure(error)
                }
            }
            Err(e) => {
                tracing::warn!(tool, "Tool relay failed: {e}");
                ToolResult::failure(e.to_string())
            }
        }
    }

    async fn post(&self, tool: &str, arguments: &Value, context: &str) -> Result<Value, RelayError> {
        let body = json!({
            "tool": tool,
            "arguments": arguments,
            "context": context,
        });

        let resp = self
            .client
            .post(&self.url)
            .header("X-Voice-Key", &self.voice_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RelayError::Timeout
                } else {
                    RelayError::Request(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            return Err(RelayError::Status(resp.status()));
        }

        resp.json::<Value>()
            .await
            .map_err(|e| RelayError::Request(e.to_string()))
    }
}
