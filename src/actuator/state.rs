//! Per-delivery retry state machine.
//!
//! ```text
//! PENDING → ATTEMPTING ─┬─ success ───────────────→ DELIVERED
//!              ↑        ├─ retryable, n < max ────→ RETRY ─┐
//!              │        ├─ retryable, n = max ────→ FALLBACK
//!              │        └─ fatal ─────────────────→ FATAL
//!              └───────────────────────────────────────────┘
//! (any non-terminal state) ── recipient withdrawn ──→ CANCELLED
//! ```

use serde::{Deserialize, Serialize};

/// Outcome of one attempt (or of a whole delivery).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptResult {
    Success,
    RetryableFailure,
    FatalFailure,
}

/// Where a delivery stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum DeliveryState {
    Pending,
    Attempting { attempt: u32 },
    Retry { next_attempt: u32 },
    Delivered,
    /// Attempts exhausted; the mailbox copy stands in.
    Fallback,
    Fatal,
    Cancelled,
}

impl DeliveryState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeliveryState::Delivered
                | DeliveryState::Fallback
                | DeliveryState::Fatal
                | DeliveryState::Cancelled
        )
    }
}

/// Transition after attempt number `attempt` (1-based) ended with `last`.
pub fn next_state(attempt: u32, max_attempts: u32, last: AttemptResult) -> DeliveryState {
    match last {
        AttemptResult::Success => DeliveryState::Delivered,
        AttemptResult::FatalFailure => DeliveryState::Fatal,
        AttemptResult::RetryableFailure if attempt < max_attempts => DeliveryState::Retry {
            next_attempt: attempt + 1,
        },
        AttemptResult::RetryableFailure => DeliveryState::Fallback,
    }
}
