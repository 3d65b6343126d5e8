//! # Swarm Relay - Inter-Agent Message Router
//!
//! Routes messages between agents that each own an input box at a fixed
//! screen position:
//! - Coordinate registry loaded from a single JSON document
//! - Content-derived message ids with a TTL idempotency ledger
//! - Durable per-agent mailboxes written before any delivery attempt
//! - Actuator delivery with retry, transport alternation and mailbox fallback
//! - Priority queue drained by a single delivery worker
//!
//! ## Architecture
//!
//! ```text
//!                    ┌──────────────────────────────────────┐
//!   send/broadcast → │            MessageRouter             │
//!                    │  ┌──────────┐ ┌──────────┐           │
//!                    │  │ Registry │ │  Ledger  │           │
//!                    │  └──────────┘ └──────────┘           │
//!                    │  ┌──────────┐ ┌──────────┐           │
//!                    │  │ Mailbox  │ │  Queue   │──┐        │
//!                    │  └──────────┘ └──────────┘  │        │
//!                    │               ┌─────────────▼──────┐ │
//!                    │               │  ActuatorEngine    │ │
//!                    │               │  (InputDevice)     │ │
//!                    │               └────────────────────┘ │
//!                    └──────────────────────────────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod actuator;
pub mod ledger;
pub mod mailbox;
pub mod message;
pub mod registry;
pub mod router;
pub mod types;

// Internal utilities
pub mod observability;

pub use types::{Config, Error, Result};
