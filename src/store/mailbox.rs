//! Durable per-endpoint mailboxes.
//!
//! Each endpoint owns a directory under `mailboxes/<hash>/` containing:
//! - `endpoint.json`: the endpoint descriptor
//! - `log.jsonl`: append-only state records, one per transition
//!
//! The log is the source of truth. Replaying it folds the records into the
//! latest state per message, in enqueue order.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::protocol::{Envelope, MessageStatus};

/// Mailbox directory name.
pub const MAILBOX_DIR: &str = "mailboxes";

const ENDPOINT_FILE: &str = "endpoint.json";
const LOG_FILE: &str = "log.jsonl";

/// Deterministic endpoint hash: first 16 hex chars of SHA-256(subject).
pub fn endpoint_hash(subject: &str) -> String {
    let digest = Sha256::digest(subject.as_bytes());
    let hex = format!("{:x}", digest);
    hex[..16].to_string()
}

/// A registered subject with a durable mailbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub subject: String,
    pub hash: String,
    pub mailbox: PathBuf,
    pub registered_at: DateTime<Utc>,
}

/// One line of the mailbox log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxRecord {
    pub message_id: String,
    pub status: MessageStatus,
    /// Present on the initial `pending` record only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope: Option<Envelope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl MailboxRecord {
    pub fn enqueued(envelope: &Envelope) -> Self {
        Self {
            message_id: envelope.id().to_string(),
            status: MessageStatus::Pending,
            envelope: Some(envelope.clone()),
            error: None,
            at: Utc::now(),
        }
    }

    pub fn transition(message_id: &str, status: MessageStatus, error: Option<String>) -> Self {
        Self {
            message_id: message_id.to_string(),
            status,
            envelope: None,
            error,
            at: Utc::now(),
        }
    }
}

/// Latest state of one message in a mailbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxEntry {
    pub envelope: Envelope,
    pub status: MessageStatus,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// File-backed collection of endpoint mailboxes.
#[derive(Debug, Clone)]
pub struct Mailboxes {
    base_path: PathBuf,
}

impl Mailboxes {
    /// Open (and create) the mailbox root under `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let base_path = root.as_ref().join(MAILBOX_DIR);
        fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    fn dir(&self, hash: &str) -> PathBuf {
        self.base_path.join(hash)
    }

    /// Create the mailbox for a subject, or return the existing one.
    pub fn create(&self, subject: &str) -> Result<Endpoint> {
        let hash = endpoint_hash(subject);
        if let Some(existing) = self.endpoint(&hash)? {
            return Ok(existing);
        }

        let dir = self.dir(&hash);
        fs::create_dir_all(&dir)?;

        let endpoint = Endpoint {
            subject: subject.to_string(),
            hash,
            mailbox: dir.clone(),
            registered_at: Utc::now(),
        };
        fs::write(dir.join(ENDPOINT_FILE), serde_json::to_string_pretty(&endpoint)?)?;
        tracing::debug!("Created mailbox {} for {}", endpoint.hash, subject);
        Ok(endpoint)
    }

    /// Remove a mailbox and its log. Returns whether it existed.
    pub fn remove(&self, hash: &str) -> Result<bool> {
        let dir = self.dir(hash);
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&dir)?;
        Ok(true)
    }

    /// Load a single endpoint descriptor.
    pub fn endpoint(&self, hash: &str) -> Result<Option<Endpoint>> {
        let path = self.dir(hash).join(ENDPOINT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Load every endpoint descriptor on disk, sorted by registration time.
    pub fn endpoints(&self) -> Result<Vec<Endpoint>> {
        let mut endpoints = Vec::new();

        for entry in fs::read_dir(&self.base_path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let hash = entry.file_name().to_string_lossy().to_string();
            match self.endpoint(&hash) {
                Ok(Some(endpoint)) => endpoints.push(endpoint),
                Ok(None) => {}
                Err(e) => tracing::warn!("Skipping unreadable mailbox {}: {}", hash, e),
            }
        }

        endpoints.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        Ok(endpoints)
    }

    /// Append one record to a mailbox log and flush it to disk.
    pub fn append(&self, hash: &str, record: &MailboxRecord) -> Result<()> {
        let dir = self.dir(hash);
        if !dir.exists() {
            return Err(Error::NotFound(format!("mailbox {}", hash)));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(dir.join(LOG_FILE))?;

        let mut line = String::new();
        // A torn final write leaves no newline; start on a fresh line.
        if file.metadata()?.len() > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1))?;
            file.read_exact(&mut last)?;
            if last[0] != b'\n' {
                line.push('\n');
            }
        }
        line.push_str(&serde_json::to_string(record)?);
        line.push('\n');

        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Fold the log into the latest state per message, in enqueue order.
    ///
    /// Malformed lines (e.g. a torn final write) are skipped.
    pub fn replay(&self, hash: &str) -> Result<Vec<MailboxEntry>> {
        let path = self.dir(hash).join(LOG_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&path)?);
        let mut order: Vec<String> = Vec::new();
        let mut entries: HashMap<String, MailboxEntry> = HashMap::new();

        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: MailboxRecord = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!("Skipping malformed record {}:{}: {}", hash, line_no + 1, e);
                    continue;
                }
            };

            if let Some(entry) = entries.get_mut(&record.message_id) {
                entry.status = record.status;
                entry.error = record.error;
                entry.updated_at = record.at;
                continue;
            }

            match record.envelope {
                Some(envelope) => {
                    order.push(record.message_id.clone());
                    entries.insert(
                        record.message_id,
                        MailboxEntry {
                            envelope,
                            status: record.status,
                            error: record.error,
                            updated_at: record.at,
                        },
                    );
                }
                None => {
                    tracing::warn!(
                        "Transition for unknown message {} in mailbox {}",
                        record.message_id,
                        hash
                    );
                }
            }
        }

        Ok(order
            .into_iter()
            .filter_map(|id| entries.remove(&id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EnvelopeBuilder;
    use serde_json::json;

    fn envelope(subject: &str) -> Envelope {
        EnvelopeBuilder::new(subject, json!({"content": "hi"}))
            .build()
            .unwrap()
    }

    #[test]
    fn test_hash_is_deterministic() {
        let a = endpoint_hash("relay.agent.proj1.bot");
        let b = endpoint_hash("relay.agent.proj1.bot");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, endpoint_hash("relay.agent.proj1.other"));
    }

    #[test]
    fn test_create_is_idempotent() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mailboxes = Mailboxes::open(temp_dir.path()).unwrap();

        let first = mailboxes.create("relay.agent.proj1.bot").unwrap();
        let second = mailboxes.create("relay.agent.proj1.bot").unwrap();
        assert_eq!(first, second);
        assert_eq!(mailboxes.endpoints().unwrap().len(), 1);
    }

    #[test]
    fn test_replay_folds_transitions() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mailboxes = Mailboxes::open(temp_dir.path()).unwrap();
        let endpoint = mailboxes.create("relay.agent.proj1.bot").unwrap();

        let first = envelope("relay.agent.proj1.bot");
        let second = envelope("relay.agent.proj1.bot");
        mailboxes.append(&endpoint.hash, &MailboxRecord::enqueued(&first)).unwrap();
        mailboxes.append(&endpoint.hash, &MailboxRecord::enqueued(&second)).unwrap();
        mailboxes
            .append(
                &endpoint.hash,
                &MailboxRecord::transition(first.id(), MessageStatus::Delivered, None),
            )
            .unwrap();

        let entries = mailboxes.replay(&endpoint.hash).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].envelope.id(), first.id());
        assert_eq!(entries[0].status, MessageStatus::Delivered);
        assert_eq!(entries[1].status, MessageStatus::Pending);
    }

    #[test]
    fn test_replay_skips_torn_line() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mailboxes = Mailboxes::open(temp_dir.path()).unwrap();
        let endpoint = mailboxes.create("a.b").unwrap();

        let env = envelope("a.b");
        mailboxes.append(&endpoint.hash, &MailboxRecord::enqueued(&env)).unwrap();

        let mut file = OpenOptions::new()
            .append(true)
            .open(endpoint.mailbox.join(LOG_FILE))
            .unwrap();
        write!(file, "{{\"messageId\":\"trunc").unwrap();

        let entries = mailboxes.replay(&endpoint.hash).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_append_after_torn_line_survives() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mailboxes = Mailboxes::open(temp_dir.path()).unwrap();
        let endpoint = mailboxes.create("a.b").unwrap();

        let first = envelope("a.b");
        mailboxes.append(&endpoint.hash, &MailboxRecord::enqueued(&first)).unwrap();

        let mut file = OpenOptions::new()
            .append(true)
            .open(endpoint.mailbox.join(LOG_FILE))
            .unwrap();
        write!(file, "{{\"messageId\":\"trunc").unwrap();
        drop(file);

        let second = envelope("a.b");
        mailboxes.append(&endpoint.hash, &MailboxRecord::enqueued(&second)).unwrap();

        let entries = mailboxes.replay(&endpoint.hash).unwrap();
        let ids: Vec<&str> = entries.iter().map(|e| e.envelope.id()).collect();
        assert_eq!(ids, vec![first.id(), second.id()]);
    }

    #[test]
    fn test_append_to_missing_mailbox_fails() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mailboxes = Mailboxes::open(temp_dir.path()).unwrap();
        let env = envelope("a.b");
        let result = mailboxes.append("deadbeefdeadbeef", &MailboxRecord::enqueued(&env));
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
