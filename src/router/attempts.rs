//! Append-only delivery attempt history.
//!
//! Every actuator attempt and every mailbox fallback marker lands here. The
//! log is what the reporting service reads; with a journal path configured it
//! is also mirrored to a JSON-lines file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;

use crate::actuator::{AttemptResult, Transport};
use crate::types::{AgentId, MessageId};

/// Channel an attempt went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryMethod {
    Actuator,
    Mailbox,
}

/// One row of delivery history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub message_id: MessageId,
    pub agent: AgentId,
    pub method: DeliveryMethod,
    pub attempt: u32,
    pub result: AttemptResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<Transport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DeliveryAttempt {
    /// Marker recording that the mailbox copy is now the delivery.
    pub fn fallback_marker(
        message_id: MessageId,
        agent: AgentId,
        attempt: u32,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            agent,
            method: DeliveryMethod::Mailbox,
            attempt,
            result: AttemptResult::Success,
            transport: None,
            detail: Some(detail.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn is_fallback_marker(&self) -> bool {
        self.method == DeliveryMethod::Mailbox
    }
}

/// In-memory attempt history with an optional file journal.
#[derive(Debug, Default)]
pub struct AttemptLog {
    records: Mutex<Vec<DeliveryAttempt>>,
    journal: Option<PathBuf>,
}

impl AttemptLog {
    pub fn new(journal: Option<PathBuf>) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            journal,
        }
    }

    pub async fn append(&self, attempt: DeliveryAttempt) {
        tracing::debug!(
            message_id = %attempt.message_id,
            agent = %attempt.agent,
            method = ?attempt.method,
            attempt = attempt.attempt,
            result = ?attempt.result,
            "delivery_attempt_recorded"
        );

        if let Some(path) = &self.journal {
            if let Err(e) = append_journal(path, &attempt).await {
                tracing::warn!(path = %path.display(), error = %e, "attempt journal write failed");
            }
        }

        self.lock().push(attempt);
    }

    /// Attempts for one message, in order.
    pub fn for_message(&self, message_id: &MessageId) -> Vec<DeliveryAttempt> {
        self.filtered(|a| &a.message_id == message_id)
    }

    /// Attempts addressed to one agent, in order.
    pub fn for_agent(&self, agent: &AgentId) -> Vec<DeliveryAttempt> {
        self.filtered(|a| &a.agent == agent)
    }

    pub fn all(&self) -> Vec<DeliveryAttempt> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn filtered(&self, pred: impl Fn(&DeliveryAttempt) -> bool) -> Vec<DeliveryAttempt> {
        self.lock().iter().filter(|a| pred(a)).cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<DeliveryAttempt>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn append_journal(path: &PathBuf, attempt: &DeliveryAttempt) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(attempt)?;
    line.push(b'\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&line).await?;
    file.flush().await
}
