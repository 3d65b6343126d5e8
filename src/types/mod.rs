//! Core types for the relay.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (AgentId, MessageId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for registry, mailbox, delivery and ledger

mod config;
mod errors;
mod ids;

pub use config::{
    ActuatorBackend, ActuatorConfig, AlertConfig, Config, DeliveryConfig, LedgerConfig,
    MailboxConfig, ObservabilityConfig, RegistryConfig, RouterConfig, ScreenBounds,
};
pub use errors::{Error, Result};
pub use ids::{AgentId, MessageId};
