// SPDX-License-Identifier: Apache-2.0

//! Per-file tailer.
//!
//! One tailer task per monitored file. A pass reads every complete line
//! appended since the committed cursor, builds a record per line, and
//! enqueues it together with its commit token; the enqueue suspends while
//! the delivery queue is full, so broker backpressure stalls file reading.
//! After exhausting available lines the tailer waits until every token from
//! the pass has been committed before starting the next pass, which bounds
//! the crash-replay window to a single pass.
//!
//! I/O failures (deletion, permissions) are non-fatal: the pass is retried
//! after a fixed delay, forever. A file that shrank below the committed
//! offset was rotated or truncated; the cursor rewinds to the start so the
//! replacement content is picked up.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::bounded_channel::QueueSender;
use crate::config::Source;
use crate::error::{Error, Result};
use crate::offsets::OffsetStore;
use crate::record::{QueueItem, Record, SourceId};

pub struct Tailer {
    source: Source,
    source_id: SourceId,
    host: String,
    offsets: Arc<OffsetStore>,
    queue: QueueSender<QueueItem>,
    pass_retry_delay: Duration,
    ack_poll_delay: Duration,
}

impl Tailer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Source,
        source_id: SourceId,
        host: String,
        offsets: Arc<OffsetStore>,
        queue: QueueSender<QueueItem>,
        pass_retry_delay: Duration,
        ack_poll_delay: Duration,
    ) -> Self {
        Self {
            source,
            source_id,
            host,
            offsets,
            queue,
            pass_retry_delay,
            ack_poll_delay,
        }
    }

    /// Run until process exit (or until the delivery queue closes because
    /// the rest of the pipeline is gone).
    pub async fn run(self) {
        let path = self.source.path.display().to_string();
        info!(file = %path, handler = %self.source.handler, "Tailer started.");

        loop {
            match self.run_pass(&path).await {
                Ok(()) => {}
                Err(Error::ChannelSend) => {
                    debug!(file = %path, "Delivery queue closed; tailer exiting.");
                    return;
                }
                Err(e) => {
                    warn!(file = %path, error = %e, "Tailer pass failed; will retry.");
                }
            }

            tokio::time::sleep(self.pass_retry_delay).await;
        }
    }

    /// Read and enqueue all complete lines past the committed cursor, then
    /// wait for the whole pass to be committed.
    async fn run_pass(&self, path: &str) -> Result<()> {
        let mut start = self.offsets.committed_offset(self.source_id);

        let mut file = File::open(&self.source.path)?;

        // A file shorter than the committed offset was rotated or truncated;
        // seeking past EOF would read nothing forever, so restart at the top.
        let len = file.metadata()?.len();
        if len < start {
            info!(
                file = %path,
                committed = start,
                length = len,
                "File shrank below the committed offset; rereading from the start."
            );
            self.offsets.rewind(self.source_id);
            start = 0;
        }

        file.seek(SeekFrom::Start(start))?;
        let mut reader = BufReader::new(file);

        let mut offset = start;
        let mut buf = String::new();
        loop {
            buf.clear();
            let n = reader.read_line(&mut buf)?;
            if n == 0 {
                break;
            }
            // A partial trailing line stays in the file for the next pass.
            if !buf.ends_with('\n') {
                break;
            }
            offset += n as u64;

            let line = buf.strip_suffix('\n').unwrap_or(&buf).to_string();
            let record = self.build_record(path, line);
            let cursor = self.offsets.note_enqueued(self.source_id, offset);

            self.queue
                .send(QueueItem { record, cursor })
                .await
                .map_err(|_| Error::ChannelSend)?;
        }

        while !self.offsets.all_committed(self.source_id) {
            tokio::time::sleep(self.ack_poll_delay).await;
        }

        Ok(())
    }

    /// Build the record for one line. A parser failure never drops the line:
    /// the record ships with empty fields, `error=true`, and the failure
    /// rendered into the trace.
    fn build_record(&self, path: &str, line: String) -> Record {
        let record = Record::new(path, &self.host, &self.source.handler, line);

        match self.source.parser.parse(&record.raw) {
            Ok(fields) => record.with_fields(fields),
            Err(e) => {
                warn!(file = %path, error = %e, "Failed to parse log line.");
                let trace = format!("handler {} failed: {}", self.source.handler, e);
                record.with_parse_error(trace)
            }
        }
    }
}
