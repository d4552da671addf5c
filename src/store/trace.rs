//! Best-effort delivery span recording.
//!
//! Spans are keyed by message id. Every write goes through [`TraceStore::record`],
//! which logs and swallows failures so tracing can never break delivery.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Span lifecycle state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Pending,
    Delivered,
    Failed,
}

impl SpanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanStatus::Pending => "pending",
            SpanStatus::Delivered => "delivered",
            SpanStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "delivered" => SpanStatus::Delivered,
            "failed" => SpanStatus::Failed,
            _ => SpanStatus::Pending,
        }
    }
}

/// Observability record of one delivery's lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceSpan {
    pub message_id: String,
    pub trace_id: String,
    pub subject: String,
    pub status: SpanStatus,
    pub sent_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub metadata: Value,
}

impl TraceSpan {
    pub fn pending(message_id: &str, trace_id: &str, subject: &str) -> Self {
        Self {
            message_id: message_id.to_string(),
            trace_id: trace_id.to_string(),
            subject: subject.to_string(),
            status: SpanStatus::Pending,
            sent_at: Utc::now(),
            delivered_at: None,
            processed_at: None,
            error: None,
            metadata: Value::Object(Default::default()),
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Partial update applied to an existing span.
#[derive(Debug, Clone, Default)]
pub struct SpanUpdate {
    pub status: Option<SpanStatus>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Merged into the existing metadata object.
    pub metadata: Option<Value>,
}

impl SpanUpdate {
    pub fn delivered() -> Self {
        let now = Utc::now();
        Self {
            status: Some(SpanStatus::Delivered),
            delivered_at: Some(now),
            processed_at: Some(now),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(SpanStatus::Failed),
            processed_at: Some(Utc::now()),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Aggregate delivery metrics derived from spans.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceMetrics {
    pub total: u64,
    pub pending: u64,
    pub delivered: u64,
    pub failed: u64,
    pub avg_latency_ms: Option<f64>,
}

/// SQLite-backed span store.
pub struct TraceStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for TraceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceStore").finish_non_exhaustive()
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS spans (
    message_id TEXT PRIMARY KEY,
    trace_id TEXT NOT NULL,
    subject TEXT NOT NULL,
    status TEXT NOT NULL,
    sent_at INTEGER NOT NULL,
    delivered_at INTEGER,
    processed_at INTEGER,
    error TEXT,
    metadata TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_spans_trace ON spans(trace_id, sent_at);
"#;

fn ts(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_ts(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

impl TraceStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::TraceRecording(format!("sqlite open: {}", e)))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::TraceRecording(format!("sqlite open: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::TraceRecording(format!("sqlite init: {}", e)))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| Error::TraceRecording("trace lock poisoned".to_string()))?;
        f(&conn).map_err(|e| Error::TraceRecording(e.to_string()))
    }

    fn record(&self, op: &str, message_id: &str, result: Result<()>) {
        if let Err(e) = result {
            tracing::warn!("Trace {} for {} failed: {}", op, message_id, e);
        }
    }

    /// Insert a span, replacing any earlier span for the same message.
    pub fn insert_span(&self, span: &TraceSpan) {
        let result = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO spans (message_id, trace_id, subject, status, sent_at, delivered_at, processed_at, error, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(message_id) DO UPDATE SET
                    status = excluded.status,
                    delivered_at = excluded.delivered_at,
                    processed_at = excluded.processed_at,
                    error = excluded.error,
                    metadata = excluded.metadata",
                params![
                    span.message_id,
                    span.trace_id,
                    span.subject,
                    span.status.as_str(),
                    ts(span.sent_at),
                    span.delivered_at.map(ts),
                    span.processed_at.map(ts),
                    span.error,
                    span.metadata.to_string()
                ],
            )
            .map(|_| ())
        });
        self.record("insert", &span.message_id, result);
    }

    /// Apply a partial update to an existing span.
    pub fn update_span(&self, message_id: &str, update: SpanUpdate) {
        let result = self.apply_update(message_id, update);
        self.record("update", message_id, result);
    }

    fn apply_update(&self, message_id: &str, update: SpanUpdate) -> Result<()> {
        let Some(mut span) = self.get_span(message_id)? else {
            return Err(Error::TraceRecording(format!("no span for {}", message_id)));
        };

        if let Some(status) = update.status {
            span.status = status;
        }
        if update.delivered_at.is_some() {
            span.delivered_at = update.delivered_at;
        }
        if update.processed_at.is_some() {
            span.processed_at = update.processed_at;
        }
        if update.error.is_some() {
            span.error = update.error;
        }
        if let Some(Value::Object(extra)) = update.metadata {
            if let Value::Object(existing) = &mut span.metadata {
                existing.extend(extra);
            } else {
                span.metadata = Value::Object(extra);
            }
        }

        self.with_conn(|conn| {
            conn.execute(
                "UPDATE spans SET status = ?1, delivered_at = ?2, processed_at = ?3, error = ?4, metadata = ?5
                 WHERE message_id = ?6",
                params![
                    span.status.as_str(),
                    span.delivered_at.map(ts),
                    span.processed_at.map(ts),
                    span.error,
                    span.metadata.to_string(),
                    message_id
                ],
            )
            .map(|_| ())
        })
    }

    pub fn get_span(&self, message_id: &str) -> Result<Option<TraceSpan>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT message_id, trace_id, subject, status, sent_at, delivered_at, processed_at, error, metadata
                 FROM spans WHERE message_id = ?1",
                params![message_id],
                span_from_row,
            )
            .optional()
        })
    }

    pub fn spans_for_trace(&self, trace_id: &str) -> Result<Vec<TraceSpan>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT message_id, trace_id, subject, status, sent_at, delivered_at, processed_at, error, metadata
                 FROM spans WHERE trace_id = ?1 ORDER BY sent_at",
            )?;
            let rows = stmt.query_map(params![trace_id], span_from_row)?;
            rows.collect()
        })
    }

    pub fn metrics(&self) -> Result<TraceMetrics> {
        self.with_conn(|conn| {
            let mut metrics = TraceMetrics::default();
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM spans GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?;
            for row in rows {
                let (status, count) = row?;
                metrics.total += count;
                match SpanStatus::parse(&status) {
                    SpanStatus::Pending => metrics.pending += count,
                    SpanStatus::Delivered => metrics.delivered += count,
                    SpanStatus::Failed => metrics.failed += count,
                }
            }
            metrics.avg_latency_ms = conn.query_row(
                "SELECT AVG(delivered_at - sent_at) FROM spans WHERE delivered_at IS NOT NULL",
                [],
                |row| row.get::<_, Option<f64>>(0),
            )?;
            Ok(metrics)
        })
    }
}

fn span_from_row(row: &Row<'_>) -> rusqlite::Result<TraceSpan> {
    let status: String = row.get(3)?;
    let metadata: String = row.get(8)?;
    Ok(TraceSpan {
        message_id: row.get(0)?,
        trace_id: row.get(1)?,
        subject: row.get(2)?,
        status: SpanStatus::parse(&status),
        sent_at: from_ts(row.get(4)?),
        delivered_at: row.get::<_, Option<i64>>(5)?.map(from_ts),
        processed_at: row.get::<_, Option<i64>>(6)?.map(from_ts),
        error: row.get(7)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_span_transitions() {
        let store = TraceStore::open_in_memory().unwrap();
        store.insert_span(&TraceSpan::pending("m1", "t1", "relay.agent.a.b"));

        let span = store.get_span("m1").unwrap().unwrap();
        assert_eq!(span.status, SpanStatus::Pending);

        store.update_span("m1", SpanUpdate::delivered().with_metadata(json!({"adapter": "runtime"})));
        let span = store.get_span("m1").unwrap().unwrap();
        assert_eq!(span.status, SpanStatus::Delivered);
        assert!(span.delivered_at.is_some());
        assert_eq!(span.metadata["adapter"], "runtime");
    }

    #[test]
    fn test_update_of_missing_span_is_swallowed() {
        let store = TraceStore::open_in_memory().unwrap();
        store.update_span("missing", SpanUpdate::failed("boom"));
        assert!(store.get_span("missing").unwrap().is_none());
    }

    #[test]
    fn test_metrics() {
        let store = TraceStore::open_in_memory().unwrap();
        store.insert_span(&TraceSpan::pending("m1", "t1", "a.b"));
        store.insert_span(&TraceSpan::pending("m2", "t1", "a.b"));
        store.update_span("m1", SpanUpdate::delivered());
        store.update_span("m2", SpanUpdate::failed("boom"));

        let metrics = store.metrics().unwrap();
        assert_eq!(metrics.total, 2);
        assert_eq!(metrics.delivered, 1);
        assert_eq!(metrics.failed, 1);
        assert!(metrics.avg_latency_ms.is_some());
        assert_eq!(store.spans_for_trace("t1").unwrap().len(), 2);
    }
}
