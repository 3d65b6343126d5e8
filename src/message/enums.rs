//! Message classification enums.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::Error;

/// What kind of traffic a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Direct,
    Broadcast,
    System,
    Directive,
    Status,
    Onboarding,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Direct => "DIRECT",
            MessageType::Broadcast => "BROADCAST",
            MessageType::System => "SYSTEM",
            MessageType::Directive => "DIRECTIVE",
            MessageType::Status => "STATUS",
            MessageType::Onboarding => "ONBOARDING",
        }
    }

    /// Onboarding traffic targets the agent's secondary address.
    pub fn uses_onboarding_address(self) -> bool {
        self == MessageType::Onboarding
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DIRECT" => Ok(MessageType::Direct),
            "BROADCAST" => Ok(MessageType::Broadcast),
            "SYSTEM" => Ok(MessageType::System),
            "DIRECTIVE" => Ok(MessageType::Directive),
            "STATUS" => Ok(MessageType::Status),
            "ONBOARDING" => Ok(MessageType::Onboarding),
            other => Err(Error::validation(format!("unknown message type: {}", other))),
        }
    }
}

/// Delivery priority. Declaration order is ascending urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Normal,
    Urgent,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
            Priority::Urgent => "URGENT",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Priority::Low),
            "NORMAL" => Ok(Priority::Normal),
            "URGENT" => Ok(Priority::Urgent),
            other => Err(Error::validation(format!("unknown priority: {}", other))),
        }
    }
}
