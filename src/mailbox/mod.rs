//! Durable per-agent mailbox - the channel of record.
//!
//! Each agent has one append-only JSON-lines log, `<root>/<agent>.jsonl`.
//! An append copies the log forward into a temp file, adds the new record,
//! syncs, and renames over the original, so a crash mid-write leaves the
//! previous log intact. Appends to one inbox are serialized by a per-agent
//! async lock; different inboxes are written concurrently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs;
use tracing::debug;

use crate::message::Message;
use crate::types::{AgentId, Error, MessageId, Result};

const LOG_EXTENSION: &str = "jsonl";
const TMP_EXTENSION: &str = "tmp";

/// One line of an agent's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxRecord {
    /// When the record was appended.
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub message: Message,
}

/// Result of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// The log already holds this message id; nothing was written.
    AlreadyPresent,
}

/// File-backed mailbox store.
#[derive(Debug)]
pub struct MailboxStore {
    root: PathBuf,
    locks: Mutex<HashMap<AgentId, Arc<tokio::sync::Mutex<()>>>>,
}

impl MailboxStore {
    /// Open (creating if needed) the mailbox directory and clear out temp
    /// files left by interrupted writes.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_absolute() {
            return Err(Error::config(format!(
                "mailbox root must be absolute: {}",
                root.display()
            )));
        }
        fs::create_dir_all(&root)
            .await
            .map_err(|e| Error::config(format!("mailbox root {}: {}", root.display(), e)))?;

        let store = Self {
            root,
            locks: Mutex::new(HashMap::new()),
        };
        store.recover_interrupted_writes().await;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Append `message` to `agent`'s log.
    pub async fn append(&self, agent: &AgentId, message: &Message) -> Result<AppendOutcome> {
        let lock = self.lock_for(agent);
        let _guard = lock.lock().await;

        let path = self.log_path(agent);
        let existing = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(Error::mailbox_write(agent.as_str(), e.to_string())),
        };

        if parse_records(agent, &existing)
            .iter()
            .any(|r| r.message.id() == message.id())
        {
            debug!(agent = %agent, message_id = %message.id(), "mailbox_duplicate_skipped");
            return Ok(AppendOutcome::AlreadyPresent);
        }

        let record = MailboxRecord {
            timestamp: Utc::now(),
            message: message.clone(),
        };
        let line = serde_json::to_string(&record)
            .map_err(|e| Error::mailbox_write(agent.as_str(), e.to_string()))?;

        let mut content = existing;
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&line);
        content.push('\n');

        self.write_atomic(&path, &content)
            .await
            .map_err(|e| Error::mailbox_write(agent.as_str(), e.to_string()))?;

        debug!(agent = %agent, message_id = %message.id(), "mailbox_appended");
        Ok(AppendOutcome::Appended)
    }

    /// Messages in `agent`'s log, oldest first, optionally only those
    /// appended strictly after `since`.
    pub async fn list(&self, agent: &AgentId, since: Option<DateTime<Utc>>) -> Result<Vec<Message>> {
        Ok(self
            .records(agent, since)
            .await?
            .into_iter()
            .map(|r| r.message)
            .collect())
    }

    /// Full records (with append timestamps) for `agent`.
    pub async fn records(
        &self,
        agent: &AgentId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<MailboxRecord>> {
        let content = match fs::read_to_string(self.log_path(agent)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = parse_records(agent, &content);
        if let Some(since) = since {
            records.retain(|r| r.timestamp > since);
        }
        Ok(records)
    }

    /// Whether `agent`'s log holds `message_id`.
    pub async fn contains(&self, agent: &AgentId, message_id: &MessageId) -> Result<bool> {
        Ok(self
            .records(agent, None)
            .await?
            .iter()
            .any(|r| r.message.id() == message_id))
    }

    fn log_path(&self, agent: &AgentId) -> PathBuf {
        // AgentId admits only [A-Za-z0-9._-], so this cannot escape `root`.
        self.root
            .join(format!("{}.{}", agent.as_str(), LOG_EXTENSION))
    }

    fn lock_for(&self, agent: &AgentId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(agent.clone()).or_default().clone()
    }

    async fn write_atomic(&self, path: &Path, content: &str) -> std::io::Result<()> {
        let tmp_path = path.with_extension(format!(
            "{}.{}.{}",
            LOG_EXTENSION,
            uuid::Uuid::new_v4().simple(),
            TMP_EXTENSION
        ));

        // 1. Write to temp file
        fs::write(&tmp_path, content).await?;

        // 2. Sync to disk off the async runtime
        let tmp_path_clone = tmp_path.clone();
        let sync_result = tokio::task::spawn_blocking(move || {
            std::fs::File::open(&tmp_path_clone).and_then(|file| file.sync_all())
        })
        .await;
        if let Err(e) = synced(sync_result) {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e);
        }

        // 3. Atomic rename
        if let Err(e) = fs::rename(&tmp_path, path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e);
        }
        Ok(())
    }

    async fn recover_interrupted_writes(&self) {
        if let Ok(mut entries) = fs::read_dir(&self.root).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == TMP_EXTENSION) {
                    debug!(path = %path.display(), "Removing interrupted mailbox write");
                    let _ = fs::remove_file(&path).await;
                }
            }
        }
    }
}

fn parse_records(agent: &AgentId, content: &str) -> Vec<MailboxRecord> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<MailboxRecord>(line) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(agent = %agent, error = %e, "skipping unreadable mailbox record");
                None
            }
        })
        .collect()
}

/// Flatten the fsync task's outcome. A task that panicked or was cancelled
/// never confirmed durability, so it counts as a failed sync.
fn synced(
    joined: std::result::Result<std::io::Result<()>, tokio::task::JoinError>,
) -> std::io::Result<()> {
    match joined {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!(error = %e, "mailbox sync task failed");
            Err(std::io::Error::other(format!("sync task failed: {}", e)))
        }
    }
}
