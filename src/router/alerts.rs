//! Escalation to the external alerting service.
//!
//! The alerting service itself lives outside this crate behind [`AlertSink`].
//! The router only decides when to call it and keeps it from being flooded:
//! each (agent, kind) pair may raise at most `max_per_window` alerts per
//! window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::ledger::{KeyedRateLimiter, WindowLimit};
use crate::types::{AgentId, AlertConfig, MessageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Every actuator attempt failed; the message is mailbox-only.
    ActuatorExhausted,
    /// The input device reported a fault retrying cannot fix.
    ActuatorFatal,
    /// The durable mailbox write failed; the message was not accepted.
    MailboxWriteFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub agent: AgentId,
    pub message_id: MessageId,
    pub detail: String,
    pub raised_at: DateTime<Utc>,
}

/// External alerting collaborator.
pub trait AlertSink: Send + Sync + fmt::Debug {
    fn notify(&self, alert: &Alert);
}

/// Sink that only logs. Used when no alerting service is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn notify(&self, alert: &Alert) {
        tracing::error!(
            kind = ?alert.kind,
            agent = %alert.agent,
            message_id = %alert.message_id,
            detail = %alert.detail,
            "delivery_alert"
        );
    }
}

/// Rate-limited front for an [`AlertSink`].
#[derive(Debug)]
pub struct AlertDispatcher {
    sink: Arc<dyn AlertSink>,
    limiter: Mutex<KeyedRateLimiter<(AgentId, AlertKind)>>,
}

impl AlertDispatcher {
    pub fn new(sink: Arc<dyn AlertSink>, config: &AlertConfig) -> Self {
        Self {
            sink,
            limiter: Mutex::new(KeyedRateLimiter::new(WindowLimit::new(
                config.max_per_window,
                config.window,
            ))),
        }
    }

    /// Forward `alert` unless its (agent, kind) is over the limit.
    /// Returns whether the sink was called.
    pub fn raise(&self, alert: Alert) -> bool {
        let allowed = self
            .limiter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .check_and_record(&(alert.agent.clone(), alert.kind), alert.raised_at);

        if allowed {
            self.sink.notify(&alert);
        } else {
            tracing::debug!(
                kind = ?alert.kind,
                agent = %alert.agent,
                message_id = %alert.message_id,
                "alert_rate_limited"
            );
        }
        allowed
    }
}
