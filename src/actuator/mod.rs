//! Actuator delivery engine.
//!
//! The actuator is the one keyboard/mouse shared by every agent on the
//! desktop. The engine drives an [`InputDevice`] through the attempt sequence
//! (focus, clear, write, submit), holding an exclusive lock for the whole
//! delivery so two deliveries never interleave keystrokes.
//!
//! Failed attempts are retried with linear backoff, alternating between
//! clipboard paste and direct typing. Each attempt is bounded by a timeout.
//! The retry decision is [`state::next_state`], a pure function.

mod recording;
pub mod state;
mod xdotool;

pub use recording::{DeviceAction, RecordingDevice};
pub use state::{next_state, AttemptResult, DeliveryState};
pub use xdotool::XdotoolDevice;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::message::Message;
use crate::registry::Address;
use crate::types::DeliveryConfig;

/// Modifier key used for select-all / paste shortcuts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modifier {
    Control,
    Command,
}

impl Modifier {
    /// Key name understood by `xdotool`.
    pub fn key_name(self) -> &'static str {
        match self {
            Modifier::Control => "ctrl",
            Modifier::Command => "super",
        }
    }
}

/// Host platform facts resolved once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub primary_modifier: Modifier,
}

impl Platform {
    pub fn detect() -> Self {
        let primary_modifier = if cfg!(target_os = "macos") {
            Modifier::Command
        } else {
            Modifier::Control
        };
        Self { primary_modifier }
    }
}

/// How content gets into the focused input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    ClipboardPaste,
    DirectType,
}

impl Transport {
    /// Odd attempts paste, even attempts type.
    pub fn for_attempt(attempt: u32) -> Self {
        if attempt % 2 == 1 {
            Transport::ClipboardPaste
        } else {
            Transport::DirectType
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::ClipboardPaste => f.write_str("clipboard_paste"),
            Transport::DirectType => f.write_str("direct_type"),
        }
    }
}

/// Input device fault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// Worth retrying (focus race, busy clipboard, slow tool).
    #[error("transient device fault: {0}")]
    Transient(String),

    /// Retrying cannot help (tool missing, address unusable).
    #[error("fatal device fault: {0}")]
    Fatal(String),
}

impl DeviceError {
    fn result(&self) -> AttemptResult {
        match self {
            DeviceError::Transient(_) => AttemptResult::RetryableFailure,
            DeviceError::Fatal(_) => AttemptResult::FatalFailure,
        }
    }
}

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Primitive input operations. Implementations must be cancel-safe: a
/// dropped future (attempt timeout) must not leave a stuck modifier key.
#[async_trait]
pub trait InputDevice: Send + Sync + fmt::Debug {
    /// Click the agent's input at `address`.
    async fn focus(&self, address: Address) -> DeviceResult<()>;

    /// Select all and delete.
    async fn clear(&self, modifier: Modifier) -> DeviceResult<()>;

    /// Load `text` into the clipboard and paste it.
    async fn paste(&self, text: &str, modifier: Modifier) -> DeviceResult<()>;

    /// Type `text` key by key.
    async fn type_text(&self, text: &str) -> DeviceResult<()>;

    /// Send the input.
    async fn submit(&self) -> DeviceResult<()>;
}

/// One actuator attempt as seen by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub transport: Transport,
    pub result: AttemptResult,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

/// Full account of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Terminal state.
    pub state: DeliveryState,
    pub attempts: Vec<AttemptRecord>,
    /// Every state the delivery passed through, `Pending` first.
    pub trail: Vec<DeliveryState>,
}

impl DeliveryReport {
    /// Collapse to the three-way delivery result.
    pub fn result(&self) -> AttemptResult {
        match self.state {
            DeliveryState::Delivered => AttemptResult::Success,
            DeliveryState::Fatal => AttemptResult::FatalFailure,
            _ => AttemptResult::RetryableFailure,
        }
    }
}

/// Serialized driver of the shared input device.
#[derive(Debug)]
pub struct ActuatorEngine {
    device: Arc<dyn InputDevice>,
    platform: Platform,
    max_attempts: u32,
    attempt_timeout: Duration,
    backoff: Duration,
    in_flight: Mutex<()>,
}

impl ActuatorEngine {
    pub fn new(device: Arc<dyn InputDevice>, platform: Platform, config: &DeliveryConfig) -> Self {
        Self {
            device,
            platform,
            max_attempts: config.max_attempts.max(1),
            attempt_timeout: config.attempt_timeout,
            backoff: config.backoff,
            in_flight: Mutex::new(()),
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Deliver `message` to the input at `address`.
    pub async fn deliver(&self, message: &Message, address: Address) -> DeliveryReport {
        self.deliver_checked(message, address, || true).await
    }

    /// Deliver, consulting `still_wanted` immediately before every attempt.
    /// A `false` answer ends the delivery as `Cancelled`.
    pub async fn deliver_checked<F>(
        &self,
        message: &Message,
        address: Address,
        still_wanted: F,
    ) -> DeliveryReport
    where
        F: Fn() -> bool + Send + Sync,
    {
        let _exclusive = self.in_flight.lock().await;
        let text = message.format_for_delivery();
        let mut attempts = Vec::new();
        let mut trail = vec![DeliveryState::Pending];
        let mut attempt = 1;

        let state = loop {
            if !still_wanted() {
                tracing::info!(message_id = %message.id(), attempt, "delivery_cancelled");
                break DeliveryState::Cancelled;
            }

            trail.push(DeliveryState::Attempting { attempt });
            let transport = Transport::for_attempt(attempt);
            let (result, detail) = match self.attempt_once(&text, address, transport).await {
                Ok(()) => (AttemptResult::Success, None),
                Err(e) => (e.result(), Some(e.to_string())),
            };
            attempts.push(AttemptRecord {
                attempt,
                transport,
                result,
                detail: detail.clone(),
                at: Utc::now(),
            });

            let next = next_state(attempt, self.max_attempts, result);
            match next {
                DeliveryState::Retry { next_attempt } => {
                    trail.push(next);
                    tracing::warn!(
                        message_id = %message.id(),
                        attempt,
                        %transport,
                        detail = detail.as_deref().unwrap_or(""),
                        "delivery_attempt_failed"
                    );
                    tokio::time::sleep(self.backoff * attempt).await;
                    attempt = next_attempt;
                }
                terminal => break terminal,
            }
        };

        trail.push(state);
        tracing::debug!(message_id = %message.id(), ?trail, "delivery_finished");
        DeliveryReport {
            state,
            attempts,
            trail,
        }
    }

    async fn attempt_once(
        &self,
        text: &str,
        address: Address,
        transport: Transport,
    ) -> DeviceResult<()> {
        let modifier = self.platform.primary_modifier;
        let sequence = async {
            self.device.focus(address).await?;
            self.device.clear(modifier).await?;
            match transport {
                Transport::ClipboardPaste => self.device.paste(text, modifier).await?,
                Transport::DirectType => self.device.type_text(text).await?,
            }
            self.device.submit().await
        };

        match tokio::time::timeout(self.attempt_timeout, sequence).await {
            Ok(result) => result,
            Err(_) => Err(DeviceError::Transient(format!(
                "attempt timed out after {}ms",
                self.attempt_timeout.as_millis()
            ))),
        }
    }
}
