//! SQLite secondary index over the mailboxes.
//!
//! The index is a derived cache: everything in it can be reconstructed by
//! replaying the mailbox logs and the dead-letter log.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::{DeadLetter, Envelope, MessageStatus};

use super::mailbox::{Endpoint, MailboxEntry};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS endpoints (
    hash TEXT PRIMARY KEY,
    subject TEXT NOT NULL,
    mailbox TEXT NOT NULL,
    registered_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS messages (
    id TEXT NOT NULL,
    endpoint_hash TEXT NOT NULL,
    subject TEXT NOT NULL,
    sender TEXT NOT NULL,
    status TEXT NOT NULL,
    error TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    envelope TEXT NOT NULL,
    PRIMARY KEY (id, endpoint_hash)
);
CREATE TABLE IF NOT EXISTS dead_letters (
    id TEXT PRIMARY KEY,
    endpoint_hash TEXT,
    message_id TEXT NOT NULL,
    reason TEXT NOT NULL,
    envelope TEXT NOT NULL,
    failed_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_subject ON messages(subject, created_at);
CREATE INDEX IF NOT EXISTS idx_messages_status ON messages(status, created_at);
CREATE INDEX IF NOT EXISTS idx_dead_letters_endpoint ON dead_letters(endpoint_hash, failed_at);
"#;

/// Filter for message listings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageFilter {
    pub subject: Option<String>,
    pub status: Option<MessageStatus>,
    pub endpoint_hash: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Filter for dead-letter listings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterFilter {
    pub endpoint_hash: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// One indexed (message, endpoint) row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub endpoint_hash: String,
    pub status: MessageStatus,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub envelope: Envelope,
}

/// Row counts for metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreCounts {
    pub endpoints: u64,
    pub pending: u64,
    pub delivered: u64,
    pub failed: u64,
    pub dead_letters: u64,
}

/// SQLite index guarded by a mutex; every call is one short transaction.
pub struct Index {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index").finish_non_exhaustive()
    }
}

fn ts(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_ts(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn encode_err(e: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(e))
}

fn decode_err(idx: usize, e: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

impl Index {
    /// Open the index file with WAL journaling.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::Persistence(format!("sqlite open: {}", e)))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init(conn)
    }

    /// In-memory index, for tests and ephemeral relays.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Persistence(format!("sqlite open: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::Persistence(format!("sqlite init: {}", e)))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Persistence("index lock poisoned".to_string()))
    }

    pub fn upsert_endpoint(&self, endpoint: &Endpoint) -> Result<()> {
        let conn = self.conn()?;
        insert_endpoint(&conn, endpoint)?;
        Ok(())
    }

    pub fn delete_endpoint(&self, hash: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM endpoints WHERE hash = ?1", params![hash])?;
        conn.execute("DELETE FROM messages WHERE endpoint_hash = ?1", params![hash])?;
        Ok(())
    }

    pub fn list_endpoints(&self) -> Result<Vec<Endpoint>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT hash, subject, mailbox, registered_at FROM endpoints ORDER BY registered_at",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Endpoint {
                hash: row.get(0)?,
                subject: row.get(1)?,
                mailbox: row.get::<_, String>(2)?.into(),
                registered_at: from_ts(row.get(3)?),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Insert or advance the state of a (message, endpoint) row.
    pub fn record_message(
        &self,
        endpoint_hash: &str,
        envelope: &Envelope,
        status: MessageStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        insert_message(&conn, endpoint_hash, envelope, status, error, at)?;
        Ok(())
    }

    /// Update only the state of an existing row.
    pub fn update_status(
        &self,
        endpoint_hash: &str,
        message_id: &str,
        status: MessageStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE messages SET status = ?1, error = ?2, updated_at = ?3 WHERE id = ?4 AND endpoint_hash = ?5",
            params![status.as_str(), error, ts(at), message_id, endpoint_hash],
        )?;
        Ok(())
    }

    pub fn insert_dead_letter(&self, dead_letter: &DeadLetter) -> Result<()> {
        let conn = self.conn()?;
        insert_dead_letter(&conn, dead_letter)?;
        Ok(())
    }

    pub fn list_messages(&self, filter: &MessageFilter) -> Result<Vec<MessageRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT endpoint_hash, status, error, updated_at, envelope FROM messages
             WHERE (?1 IS NULL OR subject = ?1)
               AND (?2 IS NULL OR status = ?2)
               AND (?3 IS NULL OR endpoint_hash = ?3)
               AND (?4 IS NULL OR created_at >= ?4)
             ORDER BY created_at DESC, id DESC
             LIMIT ?5",
        )?;
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let rows = stmt.query_map(
            params![
                filter.subject,
                filter.status.map(|s| s.as_str()),
                filter.endpoint_hash,
                filter.since.map(ts),
                limit
            ],
            message_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// All endpoint rows for one message id.
    pub fn get_message(&self, message_id: &str) -> Result<Vec<MessageRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT endpoint_hash, status, error, updated_at, envelope FROM messages
             WHERE id = ?1 ORDER BY endpoint_hash",
        )?;
        let rows = stmt.query_map(params![message_id], message_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn dead_letters(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetter>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, endpoint_hash, message_id, reason, envelope, failed_at FROM dead_letters
             WHERE (?1 IS NULL OR endpoint_hash = ?1)
               AND (?2 IS NULL OR failed_at >= ?2)
             ORDER BY failed_at DESC, id DESC
             LIMIT ?3",
        )?;
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let rows = stmt.query_map(
            params![filter.endpoint_hash, filter.since.map(ts), limit],
            |row| {
                let envelope: String = row.get(4)?;
                Ok(DeadLetter {
                    id: row.get(0)?,
                    endpoint_hash: row.get(1)?,
                    message_id: row.get(2)?,
                    reason: row.get(3)?,
                    envelope: serde_json::from_str(&envelope).map_err(|e| decode_err(4, e))?,
                    failed_at: from_ts(row.get(5)?),
                })
            },
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Whether any dead letter exists for this message.
    pub fn is_dead_lettered(&self, message_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let found: Option<String> = conn
            .query_row(
                "SELECT id FROM dead_letters WHERE message_id = ?1 LIMIT 1",
                params![message_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn counts(&self) -> Result<StoreCounts> {
        let conn = self.conn()?;
        let count = |sql: &str| -> rusqlite::Result<u64> {
            conn.query_row(sql, [], |row| row.get::<_, i64>(0))
                .map(|n| n as u64)
        };
        Ok(StoreCounts {
            endpoints: count("SELECT COUNT(*) FROM endpoints")?,
            pending: count("SELECT COUNT(*) FROM messages WHERE status = 'pending'")?,
            delivered: count("SELECT COUNT(*) FROM messages WHERE status = 'delivered'")?,
            failed: count("SELECT COUNT(*) FROM messages WHERE status = 'failed'")?,
            dead_letters: count("SELECT COUNT(*) FROM dead_letters")?,
        })
    }

    /// Replace the whole index with the given state in one transaction.
    pub fn rebuild(
        &self,
        endpoints: &[(Endpoint, Vec<MailboxEntry>)],
        dead_letters: &[DeadLetter],
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute_batch("DELETE FROM messages; DELETE FROM endpoints; DELETE FROM dead_letters;")?;

        for (endpoint, entries) in endpoints {
            insert_endpoint(&tx, endpoint)?;
            for entry in entries {
                insert_message(
                    &tx,
                    &endpoint.hash,
                    &entry.envelope,
                    entry.status,
                    entry.error.as_deref(),
                    entry.updated_at,
                )?;
            }
        }
        for dead_letter in dead_letters {
            insert_dead_letter(&tx, dead_letter)?;
        }

        tx.commit()?;
        Ok(())
    }
}

fn insert_endpoint(conn: &Connection, endpoint: &Endpoint) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO endpoints (hash, subject, mailbox, registered_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(hash) DO UPDATE SET subject = excluded.subject, mailbox = excluded.mailbox",
        params![
            endpoint.hash,
            endpoint.subject,
            endpoint.mailbox.to_string_lossy(),
            ts(endpoint.registered_at)
        ],
    )
}

fn insert_message(
    conn: &Connection,
    endpoint_hash: &str,
    envelope: &Envelope,
    status: MessageStatus,
    error: Option<&str>,
    at: DateTime<Utc>,
) -> rusqlite::Result<usize> {
    let json = serde_json::to_string(envelope).map_err(encode_err)?;
    conn.execute(
        "INSERT INTO messages (id, endpoint_hash, subject, sender, status, error, created_at, updated_at, envelope)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id, endpoint_hash) DO UPDATE SET
            status = excluded.status, error = excluded.error, updated_at = excluded.updated_at",
        params![
            envelope.id(),
            endpoint_hash,
            envelope.subject(),
            envelope.from(),
            status.as_str(),
            error,
            ts(envelope.created_at()),
            ts(at),
            json
        ],
    )
}

fn insert_dead_letter(conn: &Connection, dead_letter: &DeadLetter) -> rusqlite::Result<usize> {
    let json = serde_json::to_string(&dead_letter.envelope).map_err(encode_err)?;
    conn.execute(
        "INSERT OR IGNORE INTO dead_letters (id, endpoint_hash, message_id, reason, envelope, failed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            dead_letter.id,
            dead_letter.endpoint_hash,
            dead_letter.message_id,
            dead_letter.reason,
            json,
            ts(dead_letter.failed_at)
        ],
    )
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    let status: String = row.get(1)?;
    let envelope: String = row.get(4)?;
    Ok(MessageRecord {
        endpoint_hash: row.get(0)?,
        status: MessageStatus::parse(&status).unwrap_or(MessageStatus::Pending),
        error: row.get(2)?,
        updated_at: from_ts(row.get(3)?),
        envelope: serde_json::from_str(&envelope).map_err(|e| decode_err(4, e))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EnvelopeBuilder;
    use serde_json::json;

    fn endpoint(subject: &str) -> Endpoint {
        Endpoint {
            subject: subject.to_string(),
            hash: crate::store::mailbox::endpoint_hash(subject),
            mailbox: "/tmp/mailbox".into(),
            registered_at: Utc::now(),
        }
    }

    #[test]
    fn test_record_and_filter_messages() {
        let index = Index::open_in_memory().unwrap();
        let ep = endpoint("relay.agent.proj1.bot");
        index.upsert_endpoint(&ep).unwrap();

        let env = EnvelopeBuilder::new("relay.agent.proj1.bot", json!("hi"))
            .build()
            .unwrap();
        index
            .record_message(&ep.hash, &env, MessageStatus::Pending, None, Utc::now())
            .unwrap();
        index
            .update_status(&ep.hash, env.id(), MessageStatus::Delivered, None, Utc::now())
            .unwrap();

        let delivered = index
            .list_messages(&MessageFilter {
                status: Some(MessageStatus::Delivered),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].envelope.id(), env.id());

        let pending = index
            .list_messages(&MessageFilter {
                status: Some(MessageStatus::Pending),
                ..Default::default()
            })
            .unwrap();
        assert!(pending.is_empty());

        let counts = index.counts().unwrap();
        assert_eq!(counts.endpoints, 1);
        assert_eq!(counts.delivered, 1);
    }

    #[test]
    fn test_dead_letter_insert_is_idempotent() {
        let index = Index::open_in_memory().unwrap();
        let env = EnvelopeBuilder::new("a.b", json!(null)).build().unwrap();
        let dl = DeadLetter::new(&env, None, "no matching endpoints or adapters");

        index.insert_dead_letter(&dl).unwrap();
        index.insert_dead_letter(&dl).unwrap();

        let all = index.dead_letters(&DeadLetterFilter::default()).unwrap();
        assert_eq!(all.len(), 1);
        assert!(index.is_dead_lettered(env.id()).unwrap());
    }
}
