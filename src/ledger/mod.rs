//! Idempotency ledger and anti-flood guard.
//!
//! Two independent gates decide whether a submission is redundant:
//!
//! - **Hash dedup**: the message id (a content hash, see [`crate::message`])
//!   is kept for `ttl`. A live entry in any state other than `Failed`
//!   suppresses resubmission.
//! - **Triple limiter**: at most one accepted message per
//!   (sender, recipient, type) per `flood_window`, whatever the body. This
//!   catches regenerated status updates whose bodies differ only by a
//!   timestamp and therefore hash differently.
//!
//! Expired keys are dropped lazily on access and by [`IdempotencyLedger::sweep`],
//! which the [`LedgerSweeper`] runs periodically. The ledger is a plain struct;
//! the router owns it behind a mutex.

mod sweeper;
mod window;

pub use sweeper::{LedgerSweeper, SweepStats};
pub use window::{KeyedRateLimiter, WindowLimit};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::message::{Message, MessageType};
use crate::types::{AgentId, LedgerConfig, MessageId};

/// Where a key's delivery stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    /// Accepted and persisted; actuator delivery outstanding.
    Pending,
    /// Delivered through the actuator.
    Delivered,
    /// Actuator gave up; the mailbox copy is the delivery.
    MailboxOnly,
    /// Not persisted anywhere; resubmission is allowed.
    Failed,
}

impl LedgerStatus {
    fn suppresses(self) -> bool {
        self != LedgerStatus::Failed
    }
}

/// Why a submission was not redelivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum SuppressionReason {
    /// Same message id seen within the TTL.
    Duplicate { status: LedgerStatus },
    /// Same (sender, recipient, type) accepted within the flood window.
    Flooded { last_accepted: DateTime<Utc> },
}

/// (sender, recipient, type) triple for the flood limiter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FloodKey {
    pub sender: AgentId,
    pub recipient: String,
    pub message_type: MessageType,
}

/// Everything the ledger needs to know about a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    pub digest: MessageId,
    /// Bucket-free digest of the same content.
    pub content: String,
    pub flood: FloodKey,
}

impl IdempotencyKey {
    pub fn for_message(message: &Message) -> Self {
        Self {
            digest: message.id().clone(),
            content: message.content_digest(),
            flood: FloodKey {
                sender: message.sender().clone(),
                recipient: message.recipient().as_str().to_string(),
                message_type: message.message_type(),
            },
        }
    }
}

/// One retained key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdempotencyEntry {
    pub recorded_at: DateTime<Utc>,
    pub status: LedgerStatus,
}

/// Idempotency ledger - owned by the router, called via &mut self.
#[derive(Debug)]
pub struct IdempotencyLedger {
    ttl: Duration,
    max_entries: usize,
    exempt: HashSet<MessageType>,
    entries: HashMap<MessageId, IdempotencyEntry>,
    /// Content digest to the id it was last recorded under.
    by_content: HashMap<String, MessageId>,
    flood: KeyedRateLimiter<FloodKey>,
}

impl IdempotencyLedger {
    pub fn new(config: &LedgerConfig) -> Self {
        Self {
            ttl: window::to_chrono(config.ttl),
            max_entries: config.max_entries,
            exempt: config.flood_exempt_types.iter().copied().collect(),
            entries: HashMap::new(),
            by_content: HashMap::new(),
            flood: KeyedRateLimiter::new(WindowLimit::new(1, config.effective_flood_window())),
        }
    }

    /// Decide whether `key` must be suppressed, without recording anything.
    pub fn check(&mut self, key: &IdempotencyKey, now: DateTime<Utc>) -> Option<SuppressionReason> {
        if let Some(entry) = self.live_entry(&key.digest, now) {
            if entry.status.suppresses() {
                return Some(SuppressionReason::Duplicate {
                    status: entry.status,
                });
            }
        }

        // Same content sealed in the neighbouring time bucket.
        if let Some(earlier) = self.by_content.get(&key.content).cloned() {
            if earlier != key.digest {
                if let Some(entry) = self.live_entry(&earlier, now) {
                    if entry.status.suppresses() {
                        return Some(SuppressionReason::Duplicate {
                            status: entry.status,
                        });
                    }
                }
            }
        }

        if !self.exempt.contains(&key.flood.message_type)
            && !self.flood.would_allow(&key.flood, now)
        {
            let last_accepted = self.flood.latest(&key.flood).unwrap_or(now);
            return Some(SuppressionReason::Flooded { last_accepted });
        }

        None
    }

    pub fn should_suppress(&mut self, key: &IdempotencyKey, now: DateTime<Utc>) -> bool {
        self.check(key, now).is_some()
    }

    /// Check and, if not suppressed, record `key` as pending in one step.
    pub fn admit(
        &mut self,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), SuppressionReason> {
        match self.check(key, now) {
            Some(reason) => Err(reason),
            None => {
                self.record(key, LedgerStatus::Pending, now);
                Ok(())
            }
        }
    }

    /// Record a status transition for `key`.
    ///
    /// `Pending` claims the flood slot for the triple; `Failed` releases it so
    /// a resubmission after a failed persist is not mistaken for flooding.
    pub fn record(&mut self, key: &IdempotencyKey, status: LedgerStatus, now: DateTime<Utc>) {
        let previous = self.live_entry(&key.digest, now).map(|e| e.status);

        match status {
            LedgerStatus::Pending => {
                if !matches!(previous, Some(s) if s.suppresses()) {
                    self.flood.check_and_record(&key.flood, now);
                }
            }
            LedgerStatus::Failed => {
                if previous == Some(LedgerStatus::Pending) {
                    self.flood.forget_latest(&key.flood);
                }
            }
            LedgerStatus::Delivered | LedgerStatus::MailboxOnly => {}
        }

        if !self.entries.contains_key(&key.digest) && self.entries.len() >= self.max_entries {
            self.evict_oldest();
        }
        self.entries.insert(
            key.digest.clone(),
            IdempotencyEntry {
                recorded_at: now,
                status,
            },
        );
        self.by_content
            .insert(key.content.clone(), key.digest.clone());
        tracing::debug!(digest = %key.digest, ?status, "ledger_recorded");
    }

    /// Current status of a digest, if it is still retained.
    pub fn status(&mut self, digest: &MessageId, now: DateTime<Utc>) -> Option<LedgerStatus> {
        self.live_entry(digest, now).map(|e| e.status)
    }

    /// Evict expired entries and idle flood windows.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries.retain(|_, e| now - e.recorded_at < ttl);
        let evicted = before - self.entries.len();
        let entries = &self.entries;
        self.by_content.retain(|_, digest| entries.contains_key(digest));
        let windows = self.flood.evict_idle(now);
        if evicted > 0 || windows > 0 {
            tracing::debug!(evicted, windows, "ledger_swept");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry for `digest` if younger than the TTL; expired entries are removed.
    fn live_entry(&mut self, digest: &MessageId, now: DateTime<Utc>) -> Option<IdempotencyEntry> {
        let entry = *self.entries.get(digest)?;
        if now - entry.recorded_at >= self.ttl {
            self.entries.remove(digest);
            return None;
        }
        Some(entry)
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.recorded_at)
            .map(|(k, _)| k.clone());
        if let Some(digest) = oldest {
            self.entries.remove(&digest);
        }
    }
}
