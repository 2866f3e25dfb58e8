//! Follow-up messages for deferred interactions.
//!
//! Delivery is best effort: callers log failures and move on. Nothing retries
//! or persists an undelivered follow-up.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::interaction::FollowupTarget;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("followup_request_failed:{message}")]
    Request { message: String },
    #[error("followup_http_{status}:{body}")]
    Http { status: StatusCode, body: String },
}

#[async_trait]
pub trait FollowupNotifier: Send + Sync {
    async fn send(&self, target: &FollowupTarget, content: &str) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    base_url: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(base_url: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            base_url: base_url.into().trim().trim_end_matches('/').to_string(),
            timeout: Duration::from_millis(timeout_ms.max(1)),
            http: reqwest::Client::new(),
        }
    }

    #[must_use]
    pub fn webhook_url(&self, target: &FollowupTarget) -> String {
        format!(
            "{}/webhooks/{}/{}",
            self.base_url, target.application_id, target.token
        )
    }
}

#[async_trait]
impl FollowupNotifier for WebhookNotifier {
    async fn send(&self, target: &FollowupTarget, content: &str) -> Result<(), NotifyError> {
        let response = self
            .http
            .post(self.webhook_url(target))
            .timeout(self.timeout)
            .header("x-request-id", Uuid::new_v4().to_string())
            .json(&json!({ "content": content }))
            .send()
            .await
            // the URL carries the interaction token
            .map_err(|error| NotifyError::Request {
                message: error.without_url().to_string(),
            })?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(NotifyError::Http { status, body })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFollowup {
    pub application_id: String,
    pub content: String,
}

/// Records follow-ups instead of sending them.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<SentFollowup>>,
}

impl MemoryNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<SentFollowup> {
        self.sent.lock().await.clone()
    }

    pub async fn contents(&self) -> Vec<String> {
        self.sent
            .lock()
            .await
            .iter()
            .map(|followup| followup.content.clone())
            .collect()
    }
}

#[async_trait]
impl FollowupNotifier for MemoryNotifier {
    async fn send(&self, target: &FollowupTarget, content: &str) -> Result<(), NotifyError> {
        tracing::info!(
            application_id = %target.application_id,
            content,
            "followup recorded"
        );
        self.sent.lock().await.push(SentFollowup {
            application_id: target.application_id.clone(),
            content: content.to_string(),
        });
        Ok(())
    }
}
