//! Terminal-state notifications.
//!
//! The engine emits exactly one `RunNotification` per terminal transition
//! to the configured sink.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{PipelineRun, RunState, StageName};

/// Payload sent when a run reaches a terminal state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunNotification {
    pub run_id: Uuid,
    pub state: RunState,
    pub finished_at: DateTime<Utc>,
    pub commit_ref: String,
    pub target: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<StageName>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarm: Option<String>,
}

impl RunNotification {
    pub fn from_run(run: &PipelineRun) -> Self {
        Self {
            run_id: run.id,
            state: run.state,
            finished_at: run.finished_at.unwrap_or_else(Utc::now),
            commit_ref: run.commit_ref.clone(),
            target: run.target.clone(),
            stopped_at: run.stopped_at(),
            alarm: run.alarm.clone(),
        }
    }
}

/// Destination for terminal-state notifications
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, notification: &RunNotification) -> Result<()>;
}

/// Writes notifications to the log
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, notification: &RunNotification) -> Result<()> {
        if let Some(ref alarm) = notification.alarm {
            warn!(
                run_id = %notification.run_id,
                state = %notification.state,
                %alarm,
                "Run finished and needs operator attention"
            );
        } else {
            info!(
                run_id = %notification.run_id,
                state = %notification.state,
                finished_at = %notification.finished_at,
                "Run finished"
            );
        }
        Ok(())
    }
}

/// POSTs notifications as JSON to a callback URL
pub struct WebhookSink {
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, notification: &RunNotification) -> Result<()> {
        self.client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .with_context(|| format!("Failed to deliver notification to {}", self.url))?
            .error_for_status()
            .context("Notification callback rejected the request")?;
        Ok(())
    }
}

/// Sends notifications on an in-process channel
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<RunNotification>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RunNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationSink for ChannelSink {
    fn name(&self) -> &str {
        "channel"
    }

    async fn notify(&self, notification: &RunNotification) -> Result<()> {
        self.tx
            .send(notification.clone())
            .map_err(|_| anyhow::anyhow!("notification channel closed"))
    }
}

/// Sink selection (the `notify:` section of the config file)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkConfig {
    #[default]
    Log,
    Webhook {
        url: String,
    },
}

impl SinkConfig {
    pub fn build(&self) -> Arc<dyn NotificationSink> {
        match self {
            SinkConfig::Log => Arc::new(LogSink),
            SinkConfig::Webhook { url } => Arc::new(WebhookSink::new(url.clone())),
        }
    }
}
