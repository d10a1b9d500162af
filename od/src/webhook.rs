//! Completion webhook
//!
//! Delivery is fire-once: failures are logged and never change the task.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::view::TaskView;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum WebhookError {
    #[error("webhook request failed: {0}")]
    Request(String),

    #[error("webhook answered {0}")]
    Status(u16),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, url: &str, view: &TaskView) -> Result<(), WebhookError>;
}

/// Posts the task view as JSON
pub struct HttpNotifier {
    client: reqwest::Client,
}

impl HttpNotifier {
    pub fn new(timeout: Duration) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WebhookError::Request(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, url: &str, view: &TaskView) -> Result<(), WebhookError> {
        debug!(%url, task_id = %view.id, "HttpNotifier::notify: called");
        let response = self
            .client
            .post(url)
            .json(view)
            .send()
            .await
            .map_err(|e| WebhookError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(WebhookError::Status(status.as_u16()));
        }
        Ok(())
    }
}
