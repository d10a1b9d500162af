//! Remote delegation to a peer processor
//!
//! In manager deployments a declaration is submitted to the peer, which
//! reports progress through a status resource. Polling treats every
//! non-terminal answer and every transport failure as "try again" until the
//! attempt budget runs out.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::DelegationConfig;

/// Peer status meaning the work completed
pub const STATUS_FINISHED: &str = "FINISHED";
/// Peer status meaning the work failed
pub const STATUS_FAILED: &str = "FAILED";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DelegationError {
    /// Peer reported an explicit failure
    #[error("{0}")]
    Failed(String),

    #[error("remote task did not finish after {attempts} polls")]
    Exhausted { attempts: u32 },

    #[error("failed to submit to remote processor: {0}")]
    Submit(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl DelegationError {
    /// Result code recorded on the task
    pub fn code(&self) -> u16 {
        match self {
            Self::Failed(_) => 422,
            _ => 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerMethod {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerRequest {
    pub method: PeerMethod,
    pub path: String,
    pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerResponse {
    pub status: u16,
    pub body: Value,
}

impl PeerResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Issues requests to the peer processor
#[async_trait]
pub trait RequestSender: Send + Sync {
    async fn send(&self, request: PeerRequest) -> Result<PeerResponse, DelegationError>;
}

/// reqwest-backed sender
pub struct HttpSender {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSender {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, DelegationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DelegationError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RequestSender for HttpSender {
    async fn send(&self, request: PeerRequest) -> Result<PeerResponse, DelegationError> {
        let url = format!("{}{}", self.base_url, request.path);
        debug!(%url, method = ?request.method, "HttpSender::send: called");

        let builder = match request.method {
            PeerMethod::Get => self.client.get(&url),
            PeerMethod::Post => self.client.post(&url),
        };
        let builder = match &request.body {
            Some(body) => builder.json(body),
            None => builder,
        };

        let response = builder
            .send()
            .await
            .map_err(|e| DelegationError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| DelegationError::Transport(e.to_string()))?;
        let body = serde_json::from_str(&text).unwrap_or(Value::Null);

        Ok(PeerResponse { status, body })
    }
}

/// Submits a task to the peer and waits for its outcome
pub struct DelegationPoller {
    sender: Arc<dyn RequestSender>,
    settings: DelegationConfig,
}

impl DelegationPoller {
    pub fn new(sender: Arc<dyn RequestSender>, settings: DelegationConfig) -> Self {
        Self { sender, settings }
    }

    /// Submit the wrapped declaration, returning the peer's task id
    pub async fn submit(&self, task_id: &str, envelope: &Value) -> Result<String, DelegationError> {
        debug!(%task_id, "submit: called");
        let request = PeerRequest {
            method: PeerMethod::Post,
            path: self.settings.submit_path.clone(),
            body: Some(json!({ "taskId": task_id, "declaration": envelope })),
        };

        let response = self
            .sender
            .send(request)
            .await
            .map_err(|e| DelegationError::Submit(e.to_string()))?;
        if !response.is_success() {
            return Err(DelegationError::Submit(format!("peer answered {}", response.status)));
        }

        let remote_id = response
            .body
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| DelegationError::Submit("response carries no id".to_string()))?;
        info!(%task_id, %remote_id, "Submitted task to remote processor");
        Ok(remote_id.to_string())
    }

    /// Poll the peer until its task is terminal or the budget is spent
    ///
    /// The first poll is immediate; later polls wait `poll-interval-ms`.
    pub async fn poll(&self, remote_id: &str) -> Result<(), DelegationError> {
        debug!(%remote_id, "poll: called");
        let path = format!("{}/{}", self.settings.status_path.trim_end_matches('/'), remote_id);
        let interval = Duration::from_millis(self.settings.poll_interval_ms);

        for attempt in 1..=self.settings.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(interval).await;
            }

            let request = PeerRequest {
                method: PeerMethod::Get,
                path: path.clone(),
                body: None,
            };
            let response = match self.sender.send(request).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(%remote_id, attempt, error = %e, "poll: request failed, will retry");
                    continue;
                }
            };
            if !response.is_success() {
                debug!(%remote_id, attempt, status = response.status, "poll: non-success answer, will retry");
                continue;
            }

            match response.body.get("status").and_then(Value::as_str) {
                Some(STATUS_FINISHED) => {
                    info!(%remote_id, attempt, "Remote task finished");
                    return Ok(());
                }
                Some(STATUS_FAILED) => {
                    let message = response
                        .body
                        .get("errorMessage")
                        .and_then(Value::as_str)
                        .unwrap_or("remote task failed")
                        .to_string();
                    info!(%remote_id, attempt, %message, "Remote task failed");
                    return Err(DelegationError::Failed(message));
                }
                status => debug!(%remote_id, attempt, ?status, "poll: not terminal yet"),
            }
        }

        Err(DelegationError::Exhausted {
            attempts: self.settings.max_attempts,
        })
    }

    /// Submit then poll
    pub async fn run(&self, task_id: &str, envelope: &Value) -> Result<(), DelegationError> {
        let remote_id = self.submit(task_id, envelope).await?;
        self.poll(&remote_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::ScriptedSender;

    fn settings(max_attempts: u32) -> DelegationConfig {
        DelegationConfig {
            url: Some("http://peer".to_string()),
            poll_interval_ms: 1,
            max_attempts,
            ..DelegationConfig::default()
        }
    }

    #[tokio::test]
    async fn test_finishes_after_started() {
        let sender = Arc::new(ScriptedSender::with_statuses("r1", &["STARTED", "FINISHED"]));
        let poller = DelegationPoller::new(sender.clone(), settings(10));

        poller.run("t1", &json!({"class": "DO"})).await.unwrap();

        assert_eq!(sender.poll_count(), 2);
        let submitted = sender.requests()[0].clone();
        assert_eq!(submitted.method, PeerMethod::Post);
        assert_eq!(submitted.body.unwrap()["taskId"], json!("t1"));
        assert_eq!(sender.requests()[1].path, "/tasks/r1");
    }

    #[tokio::test]
    async fn test_failed_maps_to_422_with_peer_message() {
        let sender = Arc::new(ScriptedSender::with_statuses("r1", &["FAILED"]));
        sender.set_error_message("license pool empty");
        let poller = DelegationPoller::new(sender, settings(10));

        let err = poller.run("t1", &json!({})).await.unwrap_err();
        assert_eq!(err, DelegationError::Failed("license pool empty".to_string()));
        assert_eq!(err.code(), 422);
    }

    #[tokio::test]
    async fn test_budget_exhaustion() {
        let sender = Arc::new(ScriptedSender::with_statuses("r1", &["STARTED"]));
        let poller = DelegationPoller::new(sender.clone(), settings(3));

        let err = poller.run("t1", &json!({})).await.unwrap_err();
        assert_eq!(err, DelegationError::Exhausted { attempts: 3 });
        assert_eq!(err.code(), 500);
        assert_eq!(sender.poll_count(), 3);
    }

    #[tokio::test]
    async fn test_transport_errors_are_retried() {
        let sender = Arc::new(ScriptedSender::with_statuses("r1", &["FINISHED"]));
        sender.fail_next_polls(2);
        let poller = DelegationPoller::new(sender.clone(), settings(5));

        poller.run("t1", &json!({})).await.unwrap();
        assert_eq!(sender.poll_count(), 3);
    }

    #[tokio::test]
    async fn test_submit_failure_is_500() {
        let sender = Arc::new(ScriptedSender::with_statuses("r1", &["FINISHED"]));
        sender.fail_submit();
        let poller = DelegationPoller::new(sender.clone(), settings(5));

        let err = poller.run("t1", &json!({})).await.unwrap_err();
        assert!(matches!(err, DelegationError::Submit(_)));
        assert_eq!(err.code(), 500);
        assert_eq!(sender.poll_count(), 0);
    }
}
