//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the relay.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or malformed registry/configuration. Fatal at startup.
    #[error("config error: {0}")]
    Config(String),

    /// Recipient is not present in the registry.
    #[error("unknown recipient: {0}")]
    UnknownRecipient(String),

    /// Sender is neither a registered agent nor an operator.
    #[error("unknown sender: {0}")]
    UnknownSender(String),

    /// Recipient exists but is deactivated.
    #[error("inactive recipient: {0}")]
    InactiveRecipient(String),

    /// Malformed submission (empty body, bad id, ...).
    #[error("validation error: {0}")]
    Validation(String),

    /// The durable mailbox write failed. The message is not persisted.
    #[error("mailbox write failed for {agent}: {reason}")]
    MailboxWrite { agent: String, reason: String },

    /// Timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Startup-fatal configuration problem (CLI exit code 2).
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_))
    }

    /// Submission was refused synchronously (CLI exit code 1).
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::UnknownRecipient(_)
                | Error::UnknownSender(_)
                | Error::InactiveRecipient(_)
                | Error::Validation(_)
                | Error::MailboxWrite { .. }
        )
    }
}

// Convenience constructors
impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn unknown_recipient(agent: impl Into<String>) -> Self {
        Self::UnknownRecipient(agent.into())
    }

    pub fn unknown_sender(agent: impl Into<String>) -> Self {
        Self::UnknownSender(agent.into())
    }

    pub fn inactive_recipient(agent: impl Into<String>) -> Self {
        Self::InactiveRecipient(agent.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn mailbox_write(agent: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MailboxWrite {
            agent: agent.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
