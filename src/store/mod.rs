//! Message persistence.
//!
//! - `mailbox`: durable per-endpoint JSONL logs (source of truth)
//! - `index`: SQLite secondary index, rebuildable from the logs
//! - `trace`: best-effort delivery spans
//!
//! Signals never reach this module; they are fanned out in memory by
//! `core::subscriptions`.

pub mod index;
pub mod mailbox;
pub mod trace;

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::{validate_pattern, DeadLetter, Envelope, MessageStatus};

pub use index::{DeadLetterFilter, Index, MessageFilter, MessageRecord, StoreCounts};
pub use mailbox::{endpoint_hash, Endpoint, MailboxEntry, MailboxRecord, Mailboxes};
pub use trace::{SpanStatus, SpanUpdate, TraceMetrics, TraceSpan, TraceStore};

const INDEX_FILE: &str = "index.db";
const DEAD_LETTER_FILE: &str = "dead_letters.jsonl";

/// Summary of an index rebuild.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildStats {
    pub endpoints: usize,
    pub messages: usize,
    pub dead_letters: usize,
}

/// Durable mailboxes plus their derived index.
#[derive(Debug)]
pub struct MessageStore {
    root: PathBuf,
    mailboxes: Mailboxes,
    index: Index,
}

impl MessageStore {
    /// Open the store under `root` and bring the index up to date with the
    /// mailboxes on disk.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let store = Self {
            mailboxes: Mailboxes::open(&root)?,
            index: Index::open(root.join(INDEX_FILE))?,
            root,
        };

        let stats = store.rebuild_index()?;
        tracing::info!(
            "Message store ready at {} ({} endpoints, {} messages, {} dead letters)",
            store.root.display(),
            stats.endpoints,
            stats.messages,
            stats.dead_letters
        );
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Register a subject (or pattern) as an endpoint. Idempotent.
    pub fn register_endpoint(&self, subject: &str) -> Result<Endpoint> {
        validate_pattern(subject)?;
        let endpoint = self.mailboxes.create(subject)?;
        self.mirror("endpoint", self.index.upsert_endpoint(&endpoint));
        Ok(endpoint)
    }

    /// Remove an endpoint and its mailbox. Returns whether it existed.
    pub fn unregister_endpoint(&self, hash: &str) -> Result<bool> {
        let removed = self.mailboxes.remove(hash)?;
        self.mirror("endpoint removal", self.index.delete_endpoint(hash));
        Ok(removed)
    }

    pub fn endpoint(&self, hash: &str) -> Result<Option<Endpoint>> {
        self.mailboxes.endpoint(hash)
    }

    pub fn list_endpoints(&self) -> Result<Vec<Endpoint>> {
        self.index.list_endpoints()
    }

    /// Append a message to an endpoint mailbox as `pending`.
    pub fn enqueue(&self, hash: &str, envelope: &Envelope) -> Result<()> {
        let record = MailboxRecord::enqueued(envelope);
        self.mailboxes
            .append(hash, &record)
            .map_err(|e| Error::Persistence(format!("enqueue {} to {}: {}", envelope.id(), hash, e)))?;
        self.mirror(
            "enqueue",
            self.index
                .record_message(hash, envelope, MessageStatus::Pending, None, record.at),
        );
        Ok(())
    }

    pub fn mark_delivered(&self, hash: &str, message_id: &str) -> Result<()> {
        self.transition(hash, message_id, MessageStatus::Delivered, None)
    }

    pub fn mark_failed(&self, hash: &str, message_id: &str, error: &str) -> Result<()> {
        self.transition(hash, message_id, MessageStatus::Failed, Some(error.to_string()))
    }

    fn transition(
        &self,
        hash: &str,
        message_id: &str,
        status: MessageStatus,
        error: Option<String>,
    ) -> Result<()> {
        let record = MailboxRecord::transition(message_id, status, error);
        self.mailboxes
            .append(hash, &record)
            .map_err(|e| Error::Persistence(format!("mark {} {}: {}", message_id, status, e)))?;
        self.mirror(
            "status",
            self.index
                .update_status(hash, message_id, status, record.error.as_deref(), record.at),
        );
        Ok(())
    }

    /// Persist a dead letter to the dead-letter log and the index.
    pub fn dead_letter(&self, dead_letter: &DeadLetter) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(DEAD_LETTER_FILE))?;
        writeln!(file, "{}", serde_json::to_string(dead_letter)?)?;
        file.sync_data()?;

        self.mirror("dead letter", self.index.insert_dead_letter(dead_letter));
        tracing::warn!(
            "Dead-lettered {} ({}): {}",
            dead_letter.message_id,
            dead_letter.envelope.subject(),
            dead_letter.reason
        );
        Ok(())
    }

    /// Current state of every message in one mailbox, in enqueue order.
    pub fn read_mailbox(&self, hash: &str) -> Result<Vec<MailboxEntry>> {
        self.mailboxes.replay(hash)
    }

    pub fn list_messages(&self, filter: &MessageFilter) -> Result<Vec<MessageRecord>> {
        self.index.list_messages(filter)
    }

    pub fn get_message(&self, message_id: &str) -> Result<Vec<MessageRecord>> {
        self.index.get_message(message_id)
    }

    pub fn dead_letters(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetter>> {
        self.index.dead_letters(filter)
    }

    pub fn is_dead_lettered(&self, message_id: &str) -> Result<bool> {
        self.index.is_dead_lettered(message_id)
    }

    pub fn counts(&self) -> Result<StoreCounts> {
        self.index.counts()
    }

    /// Rebuild the index from the mailboxes and the dead-letter log.
    pub fn rebuild_index(&self) -> Result<RebuildStats> {
        let mut stats = RebuildStats::default();
        let mut state = Vec::new();

        for endpoint in self.mailboxes.endpoints()? {
            let entries = self.mailboxes.replay(&endpoint.hash)?;
            stats.endpoints += 1;
            stats.messages += entries.len();
            state.push((endpoint, entries));
        }

        let dead_letters = self.load_dead_letters()?;
        stats.dead_letters = dead_letters.len();

        self.index.rebuild(&state, &dead_letters)?;
        tracing::debug!("Rebuilt index: {:?}", stats);
        Ok(stats)
    }

    fn load_dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let path = self.root.join(DEAD_LETTER_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        for line in BufReader::new(File::open(&path)?).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<DeadLetter>(&line) {
                Ok(dl) => out.push(dl),
                Err(e) => tracing::warn!("Skipping malformed dead letter: {}", e),
            }
        }
        Ok(out)
    }

    /// Index writes follow a successful mailbox write; a failed mirror only
    /// leaves the cache stale until the next rebuild.
    fn mirror(&self, what: &str, result: Result<()>) {
        if let Err(e) = result {
            tracing::warn!("Index {} update failed (rebuild will repair): {}", what, e);
        }
    }
}
