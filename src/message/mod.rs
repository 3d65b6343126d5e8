//! Message envelope and classification.
//!
//! A [`MessageDraft`] is what callers hand to the router. Sealing a draft
//! stamps it with a creation time and derives its authoritative id; the
//! resulting [`Message`] is immutable. Only its delivery attempt history,
//! kept by the router, changes afterwards.
//!
//! The id is a content hash over sender, recipient, type, normalized body and
//! a coarse time bucket, so the same logical message submitted twice within
//! one bucket gets the same id. Including the recipient gives every broadcast
//! fan-out target a distinct id.

mod enums;

pub use enums::{MessageType, Priority};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use crate::types::{AgentId, Error, MessageId, Result};

/// Reserved recipient string for fan-out to every active agent.
pub const ALL_RECIPIENTS: &str = "ALL";

/// Hex characters kept from the SHA-256 digest.
const ID_HEX_LEN: usize = 32;

/// Where a message is going.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Recipient {
    Agent(AgentId),
    All,
}

impl Recipient {
    pub fn agent(&self) -> Option<&AgentId> {
        match self {
            Recipient::Agent(id) => Some(id),
            Recipient::All => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Recipient::Agent(id) => id.as_str(),
            Recipient::All => ALL_RECIPIENTS,
        }
    }
}

impl TryFrom<String> for Recipient {
    type Error = &'static str;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.eq_ignore_ascii_case(ALL_RECIPIENTS) {
            return Ok(Recipient::All);
        }
        AgentId::from_string(s).map(Recipient::Agent)
    }
}

impl From<Recipient> for String {
    fn from(r: Recipient) -> Self {
        r.as_str().to_string()
    }
}

impl From<AgentId> for Recipient {
    fn from(id: AgentId) -> Self {
        Recipient::Agent(id)
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message before submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    pub sender: AgentId,
    pub recipient: Recipient,
    pub message_type: MessageType,
    pub priority: Priority,
    pub tags: BTreeSet<String>,
    pub body: String,
}

impl MessageDraft {
    pub fn new(sender: AgentId, recipient: impl Into<Recipient>, body: impl Into<String>) -> Self {
        Self {
            sender,
            recipient: recipient.into(),
            message_type: MessageType::Direct,
            priority: Priority::Normal,
            tags: BTreeSet::new(),
            body: body.into(),
        }
    }

    /// Draft addressed to every active agent.
    pub fn broadcast(sender: AgentId, body: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::Broadcast,
            ..Self::new(sender, Recipient::All, body)
        }
    }

    pub fn with_type(mut self, message_type: MessageType) -> Self {
        self.message_type = message_type;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Copy of this draft addressed to a single agent.
    pub fn addressed_to(&self, agent: AgentId) -> Self {
        Self {
            recipient: Recipient::Agent(agent),
            ..self.clone()
        }
    }

    /// Stamp the draft and derive its id.
    ///
    /// `bucket_width` is the dedup window; drafts sealed within the same
    /// bucket with equal content share an id.
    pub fn seal(self, created_at: DateTime<Utc>, bucket_width: Duration) -> Result<Message> {
        if self.body.trim().is_empty() {
            return Err(Error::validation("message body is empty"));
        }
        if let Some(tag) = self
            .tags
            .iter()
            .find(|t| t.trim().is_empty() || t.chars().any(char::is_whitespace))
        {
            return Err(Error::validation(format!("invalid tag: {:?}", tag)));
        }

        let id = derive_id(
            &self.sender,
            &self.recipient,
            self.message_type,
            &self.body,
            time_bucket(created_at, bucket_width),
        );

        Ok(Message {
            id,
            sender: self.sender,
            recipient: self.recipient,
            message_type: self.message_type,
            priority: self.priority,
            tags: self.tags,
            body: self.body,
            created_at,
        })
    }
}

/// A sealed, immutable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "message_id")]
    id: MessageId,
    sender: AgentId,
    recipient: Recipient,
    #[serde(rename = "type")]
    message_type: MessageType,
    priority: Priority,
    #[serde(default)]
    tags: BTreeSet<String>,
    body: String,
    created_at: DateTime<Utc>,
}

impl Message {
    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn sender(&self) -> &AgentId {
        &self.sender
    }

    pub fn recipient(&self) -> &Recipient {
        &self.recipient
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Digest of the id inputs without the time bucket. Equal for the same
    /// content sealed on either side of a bucket boundary.
    pub fn content_digest(&self) -> String {
        truncated_hex(content_hasher(
            &self.sender,
            &self.recipient,
            self.message_type,
            &self.body,
        ))
    }

    /// Text typed or pasted into the recipient's input.
    pub fn format_for_delivery(&self) -> String {
        let mut header = format!(
            "[{}] [{}] {} -> {}",
            self.priority, self.message_type, self.sender, self.recipient
        );
        for tag in &self.tags {
            header.push_str(" #");
            header.push_str(tag);
        }
        format!("{}: {}", header, self.body)
    }
}

/// Lowercase, trimmed, with whitespace runs collapsed to one space.
pub fn normalize_body(body: &str) -> String {
    body.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn time_bucket(at: DateTime<Utc>, width: Duration) -> i64 {
    let width_ms = i64::try_from(width.as_millis()).unwrap_or(i64::MAX).max(1);
    at.timestamp_millis().div_euclid(width_ms)
}

fn derive_id(
    sender: &AgentId,
    recipient: &Recipient,
    message_type: MessageType,
    body: &str,
    bucket: i64,
) -> MessageId {
    let mut hasher = content_hasher(sender, recipient, message_type, body);
    hasher.update(bucket.to_le_bytes());
    MessageId::from_digest(truncated_hex(hasher))
}

fn content_hasher(
    sender: &AgentId,
    recipient: &Recipient,
    message_type: MessageType,
    body: &str,
) -> Sha256 {
    let normalized = normalize_body(body);
    let mut hasher = Sha256::new();
    for field in [
        sender.as_str(),
        recipient.as_str(),
        message_type.as_str(),
        normalized.as_str(),
    ] {
        // Length prefix keeps ("ab","c") distinct from ("a","bc").
        hasher.update((field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    hasher
}

fn truncated_hex(hasher: Sha256) -> String {
    let mut hex = format!("{:x}", hasher.finalize());
    hex.truncate(ID_HEX_LEN);
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const TTL: Duration = Duration::from_secs(600);

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_400 + secs, 0).unwrap()
    }

    fn draft(body: &str) -> MessageDraft {
        MessageDraft::new(AgentId::must("Agent-1"), AgentId::must("Agent-2"), body)
    }

    #[test]
    fn test_same_content_same_bucket_same_id() {
        let a = draft("Status:  ALL green").seal(at(0), TTL).unwrap();
        let b = draft("status: all green ").seal(at(30), TTL).unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(a.id().as_str().len(), ID_HEX_LEN);
    }

    #[test]
    fn test_different_bucket_different_id() {
        let a = draft("ping").seal(at(0), TTL).unwrap();
        let b = draft("ping").seal(at(600), TTL).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_content_digest_ignores_bucket() {
        let a = draft("ping").seal(at(599), TTL).unwrap();
        let b = draft(" PING").seal(at(601), TTL).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.content_digest(), b.content_digest());
        assert_ne!(a.content_digest(), draft("pong").seal(at(599), TTL).unwrap().content_digest());
    }

    #[test]
    fn test_recipient_and_type_change_id() {
        let base = draft("ping").seal(at(0), TTL).unwrap();
        let other_agent = draft("ping")
            .addressed_to(AgentId::must("Agent-3"))
            .seal(at(0), TTL)
            .unwrap();
        let other_type = draft("ping")
            .with_type(MessageType::Status)
            .seal(at(0), TTL)
            .unwrap();
        assert_ne!(base.id(), other_agent.id());
        assert_ne!(base.id(), other_type.id());
    }

    #[test]
    fn test_priority_and_tags_do_not_change_id() {
        let a = draft("ping").seal(at(0), TTL).unwrap();
        let b = draft("ping")
            .with_priority(Priority::Urgent)
            .with_tag("ops")
            .seal(at(0), TTL)
            .unwrap();
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_empty_body_rejected() {
        let err = draft("   ").seal(at(0), TTL).unwrap_err();
        assert!(err.is_rejection());
    }

    #[test]
    fn test_tag_with_space_rejected() {
        assert!(draft("ping").with_tag("two words").seal(at(0), TTL).is_err());
    }

    #[test]
    fn test_recipient_all_parses() {
        let r: Recipient = serde_json::from_str("\"all\"").unwrap();
        assert_eq!(r, Recipient::All);
        let r: Recipient = serde_json::from_str("\"Agent-4\"").unwrap();
        assert_eq!(r.agent().unwrap().as_str(), "Agent-4");
    }

    #[test]
    fn test_format_for_delivery() {
        let msg = draft("deploy now")
            .with_type(MessageType::Directive)
            .with_priority(Priority::Urgent)
            .with_tag("ops")
            .seal(at(0), TTL)
            .unwrap();
        assert_eq!(
            msg.format_for_delivery(),
            "[URGENT] [DIRECTIVE] Agent-1 -> Agent-2 #ops: deploy now"
        );
    }

    #[test]
    fn test_serialized_shape() {
        let msg = draft("ping").seal(at(0), TTL).unwrap();
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "DIRECT");
        assert_eq!(value["recipient"], "Agent-2");
        assert_eq!(value["message_id"], msg.id().as_str());
        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }
}
