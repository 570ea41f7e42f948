// src/dispatch.rs
//
// Hand-off from ingestion to the downstream durable-workflow backend.
// The feeder submits one workflow per unique item; idempotency lives in
// the workflow id, which is derived from the content fingerprint.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::DispatchConfig;
use crate::error::{FeederError, Result};
use crate::news_item::NewsItem;

/// Result of a single submission attempt sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Workflow accepted by the backend under this id.
    Started { workflow_id: String },
    /// All attempts exhausted; the item was not handed off.
    Failed { workflow_id: String, reason: String },
}

impl DispatchOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started { .. })
    }
}

/// Abstraction over the workflow backend so the orchestrator and tests
/// never touch the wire directly.
#[async_trait]
pub trait WorkflowDispatcher: Send + Sync {
    async fn submit(&self, item: &NewsItem) -> DispatchOutcome;

    /// Current status of a previously submitted workflow.
    async fn describe(&self, workflow_id: &str) -> Result<String>;

    async fn cancel(&self, workflow_id: &str) -> Result<()>;

    async fn health_check(&self) -> bool;

    fn is_connected(&self) -> bool;
}

#[derive(Serialize)]
struct SubmitRequest<'a> {
    workflow_id: &'a str,
    task_queue: &'a str,
    timeout_seconds: u64,
    input: &'a NewsItem,
}

/// HTTP client for the workflow backend's submit/cancel/health surface.
pub struct HttpDispatcher {
    client: reqwest::Client,
    config: DispatchConfig,
    connected: AtomicBool,
    submitted: AtomicU64,
    failed: AtomicU64,
}

impl HttpDispatcher {
    pub fn new(config: DispatchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            config,
            connected: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn try_submit(&self, item: &NewsItem, workflow_id: &str) -> Result<()> {
        let body = SubmitRequest {
            workflow_id,
            task_queue: &self.config.task_queue,
            timeout_seconds: self.config.workflow_timeout_seconds,
            input: item,
        };
        let response = self
            .client
            .post(self.endpoint("api/v1/workflows"))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        // 409 means the workflow id already exists: an earlier submit for
        // the same fingerprint won, which is success for our purposes.
        if status.is_success() || status == reqwest::StatusCode::CONFLICT {
            return Ok(());
        }
        let detail = response.text().await.unwrap_or_default();
        Err(FeederError::Dispatch(format!(
            "workflow backend returned {status}: {detail}"
        )))
    }

    pub fn stats(&self) -> (u64, u64) {
        (
            self.submitted.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }
}

#[async_trait]
impl WorkflowDispatcher for HttpDispatcher {
    async fn submit(&self, item: &NewsItem) -> DispatchOutcome {
        let workflow_id = item.workflow_id();

        let mut last_error = String::new();
        for attempt in 1..=self.config.max_submit_attempts {
            match self.try_submit(item, &workflow_id).await {
                Ok(()) => {
                    self.connected.store(true, Ordering::Relaxed);
                    self.submitted.fetch_add(1, Ordering::Relaxed);
                    info!(workflow_id, source = %item.source_name, "workflow started");
                    return DispatchOutcome::Started { workflow_id };
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(
                        workflow_id,
                        attempt,
                        max = self.config.max_submit_attempts,
                        error = %last_error,
                        "workflow submit attempt failed"
                    );
                    if attempt < self.config.max_submit_attempts {
                        tokio::time::sleep(Duration::from_secs(2u64.pow(attempt - 1))).await;
                    }
                }
            }
        }

        self.connected.store(false, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
        DispatchOutcome::Failed {
            workflow_id,
            reason: last_error,
        }
    }

    async fn describe(&self, workflow_id: &str) -> Result<String> {
        let response = self
            .client
            .get(self.endpoint(&format!("api/v1/workflows/{workflow_id}")))
            .send()
            .await?
            .error_for_status()
            .map_err(|e| FeederError::Dispatch(format!("describe {workflow_id}: {e}")))?;
        let body: serde_json::Value = response.json().await?;
        Ok(body
            .get("status")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown")
            .to_string())
    }

    async fn cancel(&self, workflow_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.endpoint(&format!("api/v1/workflows/{workflow_id}")))
            .send()
            .await?;
        if response.status().is_success() {
            debug!(workflow_id, "workflow cancelled");
            Ok(())
        } else {
            Err(FeederError::Dispatch(format!(
                "cancel {workflow_id} returned {}",
                response.status()
            )))
        }
    }

    async fn health_check(&self) -> bool {
        let healthy = match self.client.get(self.endpoint("health")).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        };
        self.connected.store(healthy, Ordering::Relaxed);
        healthy
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_without_double_slash() {
        let config = DispatchConfig {
            base_url: "http://localhost:8233/".into(),
            ..DispatchConfig::default()
        };
        let dispatcher = HttpDispatcher::new(config).unwrap();
        assert_eq!(
            dispatcher.endpoint("api/v1/workflows"),
            "http://localhost:8233/api/v1/workflows"
        );
    }

    #[test]
    fn fresh_dispatcher_reports_disconnected() {
        let dispatcher = HttpDispatcher::new(DispatchConfig::default()).unwrap();
        assert!(!dispatcher.is_connected());
        assert_eq!(dispatcher.stats(), (0, 0));
    }
}
