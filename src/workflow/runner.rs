/// Remote workflow execution
///
/// [`WorkflowRunner`] is the only blocking/network step of a task. Any
/// transport satisfying the contract works; [`HttpWorkflowRunner`] talks to
/// the remote engine's run endpoint with reqwest.

use crate::config::RunnerConfig;
use crate::error::ExecutionError;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

#[async_trait]
pub trait WorkflowRunner: Send + Sync {
    /// Run `remote_workflow_id` with `input` and return its output
    async fn execute(&self, remote_workflow_id: &str, input: &Value) -> Result<Value, ExecutionError>;
}

/// HTTP runner: `POST {base_url}/api/v1/run/{remote_id}` with the input as JSON body
#[derive(Debug, Clone)]
pub struct HttpWorkflowRunner {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpWorkflowRunner {
    pub fn new(config: &RunnerConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn run_url(&self, remote_workflow_id: &str) -> String {
        format!("{}/api/v1/run/{}", self.base_url, remote_workflow_id)
    }
}

#[async_trait]
impl WorkflowRunner for HttpWorkflowRunner {
    async fn execute(&self, remote_workflow_id: &str, input: &Value) -> Result<Value, ExecutionError> {
        let url = self.run_url(remote_workflow_id);
        tracing::debug!("🌍 Running remote workflow: POST {}", url);

        let mut request = self.client.post(&url).json(input);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request.send().await.map_err(|e| {
            // Connection problems and timeouts are worth another attempt
            ExecutionError::retriable(format!("request to {} failed: {}", url, e))
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ExecutionError::retriable(format!("failed to read response body: {}", e)))?;

        if !status.is_success() {
            let message = format!("remote engine returned {}: {}", status, truncate(&body, 500));
            return Err(if is_retriable_status(status) {
                ExecutionError::retriable(message)
            } else {
                ExecutionError::fatal(message)
            });
        }

        tracing::debug!("📡 Remote workflow {} answered {}", remote_workflow_id, status);
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }
}

fn is_retriable_status(status: reqwest::StatusCode) -> bool {
    status.is_server_error()
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_run_url_without_double_slash() {
        let runner = HttpWorkflowRunner::new(&RunnerConfig {
            base_url: "http://engine:7860/".to_string(),
            api_key: None,
            timeout_secs: 5,
        })
        .unwrap();
        assert_eq!(runner.run_url("flow-42"), "http://engine:7860/api/v1/run/flow-42");
    }

    #[test]
    fn classifies_status_codes() {
        assert!(is_retriable_status(reqwest::StatusCode::BAD_GATEWAY));
        assert!(is_retriable_status(reqwest::StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retriable_status(reqwest::StatusCode::NOT_FOUND));
        assert!(!is_retriable_status(reqwest::StatusCode::UNPROCESSABLE_ENTITY));
    }

    #[test]
    fn truncates_on_char_boundary() {
        assert_eq!(truncate("héllo", 2), "hé...");
        assert_eq!(truncate("ok", 10), "ok");
    }
}
