// SPDX-License-Identifier: Apache-2.0

//! Core data model: the structured record shipped to the broker, the
//! per-line commit cursor, and the sender's batch.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Index of a monitored source file, assigned once at startup.
pub type SourceId = usize;

/// One structured log record. Serialization matches the broker wire format:
/// parser output is flattened into the top-level object, and the error
/// fields only appear when a parse failed.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Record {
    pub id: String,
    pub file: String,
    pub host: String,
    pub handler: String,
    pub raw: String,
    pub timestamp: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_tb: Option<String>,
}

impl Record {
    /// Build a record for one raw line, with a fresh id and a UTC timestamp.
    /// Fields start empty; the tailer merges in parser output or marks the
    /// record errored.
    pub fn new(file: &str, host: &str, handler: &str, raw: String) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            file: file.to_string(),
            host: host.to_string(),
            handler: handler.to_string(),
            raw,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            fields: Map::new(),
            error: false,
            error_tb: None,
        }
    }

    pub fn with_fields(mut self, fields: Map<String, Value>) -> Self {
        self.fields = fields;
        self
    }

    /// Mark the record as failed to parse, keeping the raw line. Fields stay
    /// empty; the record is still shipped.
    pub fn with_parse_error(mut self, trace: String) -> Self {
        self.error = true;
        self.error_tb = Some(trace);
        self
    }
}

/// Commit token for one line of one source file.
///
/// `seq` increases by one per enqueued line of a source, `offset` is the byte
/// position just past the line's newline. Committing a cursor advances the
/// source's durable read position; commits are idempotent and monotonic, so
/// a stale or duplicate cursor is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineCursor {
    pub source: SourceId,
    pub seq: u64,
    pub offset: u64,
}

/// The unit moved through the delivery queue.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub record: Record,
    pub cursor: LineCursor,
}

/// Accumulates queue items until the flush trigger fires: the batch is
/// non-empty and has either reached `max_size` items or `timeout` has
/// elapsed since the last flush. A taken batch is published as a single
/// request and committed atomically; it is never split or merged.
pub struct Batch {
    items: Vec<QueueItem>,
    max_size: usize,
    timeout: Duration,
    last_flush: Instant,
}

impl Batch {
    pub fn new(max_size: usize, timeout: Duration) -> Self {
        Self {
            items: Vec::with_capacity(max_size),
            max_size,
            timeout,
            last_flush: Instant::now(),
        }
    }

    pub fn push(&mut self, item: QueueItem) {
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn should_flush(&self, now: Instant) -> bool {
        !self.items.is_empty()
            && (self.items.len() >= self.max_size || self.last_flush + self.timeout <= now)
    }

    /// Hand off the accumulated items and restart the flush timer.
    pub fn take(&mut self) -> Vec<QueueItem> {
        self.last_flush = Instant::now();
        std::mem::take(&mut self.items)
    }
}
