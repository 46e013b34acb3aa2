//! Best-effort outbound notification when a run leaves the running state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use inflow_common::{Run, RunCounters, RunStatus};

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webhook responded {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("configuration error: {0}")]
    Config(String),
}

/// JSON body delivered for a finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunNotification {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub error_message: Option<String>,
    pub counters: RunCounters,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Run> for RunNotification {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.id,
            status: run.status,
            error_message: run.error_message.clone(),
            counters: run.counters.clone(),
            started_at: run.started_at,
            completed_at: run.completed_at,
        }
    }
}

#[async_trait]
pub trait RunNotifier: Send + Sync {
    async fn notify(&self, notification: &RunNotification) -> Result<(), NotifyError>;
}

/// POSTs the notification as JSON to a fixed url.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let url = url.into();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(NotifyError::Config(format!("webhook url must be http(s): {url}")));
        }
        Ok(Self {
            url,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl RunNotifier for WebhookNotifier {
    async fn notify(&self, notification: &RunNotification) -> Result<(), NotifyError> {
        let response = self.client.post(&self.url).json(notification).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!(run_id = %notification.run_id, "Run notification delivered");
        Ok(())
    }
}
