//! Trigger Receiver: turns an inbound push notification into a request.
//!
//! Checks, in order:
//! 1. the `X-Hub-Signature-256` HMAC over the raw body (`Unauthorized`)
//! 2. the event type; anything but `push` is a no-op (`Unsupported`)
//! 3. the payload shape (`Invalid`)
//! 4. branch deletions, tags and non-deployment branches (`Unsupported`)
//! 5. the delivery id against the dedup window (`Duplicate`)

pub mod dedup;

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use glob::Pattern;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::domain::RunOrigin;
use dedup::DedupWindow;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";

/// Trigger settings (the `trigger:` section of the config file)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSettings {
    /// Deployment branch (glob pattern, e.g. `main` or `release/*`)
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Environment variable holding the webhook secret
    #[serde(default = "default_secret_env")]
    pub secret_env: String,

    /// Maximum delivery ids remembered
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,

    /// How long a delivery id is remembered
    #[serde(default = "default_dedup_ttl")]
    pub dedup_ttl_seconds: u64,
}

fn default_branch() -> String {
    "main".to_string()
}
fn default_secret_env() -> String {
    "SHIPGATE_WEBHOOK_SECRET".to_string()
}
fn default_dedup_capacity() -> usize {
    1024
}
fn default_dedup_ttl() -> u64 {
    24 * 60 * 60
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            branch: default_branch(),
            secret_env: default_secret_env(),
            dedup_capacity: default_dedup_capacity(),
            dedup_ttl_seconds: default_dedup_ttl(),
        }
    }
}

/// An inbound notification as received from the transport
#[derive(Debug, Clone, Default)]
pub struct RawEvent {
    /// `X-Hub-Signature-256` header
    pub signature: Option<String>,

    /// `X-GitHub-Delivery` header
    pub delivery_id: Option<String>,

    /// `X-GitHub-Event` header
    pub event: Option<String>,

    /// Raw request body
    pub body: Vec<u8>,
}

/// A validated request to run the pipeline for one revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub delivery_id: String,
    pub commit_ref: String,
    pub branch: String,
    pub repository: String,
    pub pusher: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl PipelineRequest {
    /// Run origin for this request on `target`
    pub fn origin(&self, target: &str) -> RunOrigin {
        RunOrigin {
            commit_ref: self.commit_ref.clone(),
            branch: self.branch.clone(),
            repository: self.repository.clone(),
            delivery_id: Some(self.delivery_id.clone()),
            target: target.to_string(),
        }
    }
}

/// Why an event did not produce a request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectedEvent {
    /// Signature missing or wrong; never retried, never starts a run
    #[error("signature verification failed")]
    Unauthorized,

    /// Valid but not for us; a no-op, not an error
    #[error("ignored: {reason}")]
    Unsupported { reason: String },

    #[error("invalid payload: {0}")]
    Invalid(String),

    #[error("delivery {delivery_id} already accepted")]
    Duplicate { delivery_id: String },
}

impl RejectedEvent {
    fn unsupported(reason: impl Into<String>) -> Self {
        RejectedEvent::Unsupported {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: String,

    after: String,

    #[serde(default)]
    deleted: bool,

    repository: PushRepository,

    #[serde(default)]
    pusher: Option<PushPusher>,
}

#[derive(Debug, Deserialize)]
struct PushRepository {
    clone_url: String,
}

#[derive(Debug, Deserialize)]
struct PushPusher {
    name: String,
}

/// Validates and normalizes push notifications
pub struct TriggerReceiver {
    secret: Vec<u8>,
    branch: Pattern,
    dedup: Mutex<DedupWindow>,
}

impl TriggerReceiver {
    pub fn new(
        settings: &TriggerSettings,
        secret: impl Into<Vec<u8>>,
    ) -> Result<Self, glob::PatternError> {
        Ok(Self {
            secret: secret.into(),
            branch: Pattern::new(&settings.branch)?,
            dedup: Mutex::new(DedupWindow::new(
                settings.dedup_capacity,
                Duration::from_secs(settings.dedup_ttl_seconds),
            )),
        })
    }

    /// Validate a raw event; idempotent per delivery id
    pub fn receive(&self, raw: &RawEvent) -> Result<PipelineRequest, RejectedEvent> {
        self.verify_signature(raw)?;

        match raw.event.as_deref() {
            Some("push") | None => {}
            Some(other) => {
                return Err(RejectedEvent::unsupported(format!("event type '{}'", other)))
            }
        }

        let payload: PushPayload = serde_json::from_slice(&raw.body)
            .map_err(|e| RejectedEvent::Invalid(e.to_string()))?;

        let Some(branch) = payload.git_ref.strip_prefix("refs/heads/") else {
            return Err(RejectedEvent::unsupported(format!(
                "ref '{}' is not a branch",
                payload.git_ref
            )));
        };

        let commit = payload.after.trim().to_ascii_lowercase();
        if payload.deleted || (!commit.is_empty() && commit.chars().all(|c| c == '0')) {
            return Err(RejectedEvent::unsupported(format!(
                "branch '{}' was deleted",
                branch
            )));
        }
        if !(7..=40).contains(&commit.len()) || !commit.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(RejectedEvent::Invalid(format!(
                "'{}' is not a commit id",
                payload.after
            )));
        }
        if payload.repository.clone_url.trim().is_empty() {
            return Err(RejectedEvent::Invalid("repository.clone_url is empty".to_string()));
        }

        if !self.branch.matches(branch) {
            return Err(RejectedEvent::unsupported(format!(
                "branch '{}' is not the deployment branch",
                branch
            )));
        }

        let delivery_id = match raw.delivery_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => body_digest(&raw.body),
        };

        if !self.dedup().insert(&delivery_id) {
            debug!(%delivery_id, "Duplicate delivery");
            return Err(RejectedEvent::Duplicate { delivery_id });
        }

        Ok(PipelineRequest {
            delivery_id,
            commit_ref: commit,
            branch: branch.to_string(),
            repository: payload.repository.clone_url,
            pusher: payload.pusher.map(|p| p.name),
            received_at: Utc::now(),
        })
    }

    /// Release a delivery id that was accepted but could not be queued
    pub fn forget(&self, delivery_id: &str) -> bool {
        self.dedup().forget(delivery_id)
    }

    fn dedup(&self) -> std::sync::MutexGuard<'_, DedupWindow> {
        self.dedup.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn verify_signature(&self, raw: &RawEvent) -> Result<(), RejectedEvent> {
        if self.secret.is_empty() {
            return Err(RejectedEvent::Unauthorized);
        }

        let expected = raw
            .signature
            .as_deref()
            .and_then(|s| s.trim().strip_prefix(SIGNATURE_PREFIX))
            .and_then(|hex_digest| hex::decode(hex_digest).ok())
            .ok_or(RejectedEvent::Unauthorized)?;

        let mut mac =
            HmacSha256::new_from_slice(&self.secret).map_err(|_| RejectedEvent::Unauthorized)?;
        mac.update(&raw.body);
        mac.verify_slice(&expected)
            .map_err(|_| RejectedEvent::Unauthorized)
    }
}

/// Compute the `X-Hub-Signature-256` header value for a body
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("{}{}", SIGNATURE_PREFIX, hex::encode(mac.finalize().into_bytes()))
}

/// Stand-in delivery id for senders that omit one
fn body_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}
