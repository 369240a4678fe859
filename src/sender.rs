// SPDX-License-Identifier: Apache-2.0

//! Batch sender: the single consumer of the delivery queue.
//!
//! Items are accumulated into a batch that flushes when it reaches the size
//! limit or when the time limit has elapsed, whichever comes first. Before
//! every publish attempt the sender waits out the throttle flag; while it
//! waits nothing is dequeued, so the queue fills and the tailers stall —
//! that is the intended end-to-end backpressure path. A batch publishes as
//! one bulk request and commits atomically: on success every item's cursor
//! is committed, on failure the identical batch is retried after a fixed
//! delay, without limit. Nothing is ever partially committed.
//!
//! Worst-case memory while the broker is saturated is one resident batch
//! plus one full delivery queue; both are bounded by configuration.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bounded_channel::{Dequeue, QueueReceiver};
use crate::broker::BrokerClient;
use crate::config::Limits;
use crate::depth::ThrottleFlag;
use crate::offsets::OffsetStore;
use crate::record::{Batch, QueueItem};

pub struct BatchSender {
    queue: QueueReceiver<QueueItem>,
    client: BrokerClient,
    offsets: Arc<OffsetStore>,
    throttle: ThrottleFlag,
    batch_max_records: usize,
    batch_max_delay: Duration,
    queue_timeout: Duration,
    publish_retry_delay: Duration,
    throttle_poll_delay: Duration,
}

impl BatchSender {
    pub fn new(
        queue: QueueReceiver<QueueItem>,
        client: BrokerClient,
        offsets: Arc<OffsetStore>,
        throttle: ThrottleFlag,
        limits: &Limits,
    ) -> Self {
        Self {
            queue,
            client,
            offsets,
            throttle,
            batch_max_records: limits.batch_max_records,
            batch_max_delay: limits.batch_max_delay,
            queue_timeout: limits.queue_timeout,
            publish_retry_delay: limits.publish_retry_delay,
            throttle_poll_delay: limits.depth_poll_interval,
        }
    }

    /// Run until the delivery queue closes (all tailers gone), flushing any
    /// resident batch first.
    pub async fn run(mut self) {
        info!(
            max_records = self.batch_max_records,
            max_delay = ?self.batch_max_delay,
            "Batch sender started."
        );

        let mut batch = Batch::new(self.batch_max_records, self.batch_max_delay);

        loop {
            match self.queue.next_timeout(self.queue_timeout).await {
                Dequeue::Item(item) => batch.push(item),
                Dequeue::TimedOut => {}
                Dequeue::Disconnected => {
                    if !batch.is_empty() {
                        self.publish_and_commit(batch.take()).await;
                    }
                    debug!("Delivery queue closed; batch sender exiting.");
                    return;
                }
            }

            if batch.should_flush(Instant::now()) {
                self.publish_and_commit(batch.take()).await;
            }
        }
    }

    /// Publish one batch, retrying the identical payload until the broker
    /// accepts it, then commit every item's cursor in order.
    async fn publish_and_commit(&self, items: Vec<QueueItem>) {
        // Encode once so retries send a byte-identical body.
        let body = loop {
            match BrokerClient::encode_batch(items.iter().map(|i| &i.record)) {
                Ok(body) => break body,
                Err(e) => {
                    error!(error = %e, "Failed to encode batch; will retry.");
                    tokio::time::sleep(self.publish_retry_delay).await;
                }
            }
        };

        let mut attempts = 0u64;
        loop {
            // The gate is re-checked before every attempt, including retries.
            while self.throttle.is_engaged() {
                debug!("Publishing throttled; waiting for broker backlog to drain.");
                tokio::time::sleep(self.throttle_poll_delay).await;
            }

            attempts += 1;
            match self.client.mpub(body.clone()).await {
                Ok(()) => {
                    info!(records = items.len(), attempts, "Published batch to broker.");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, attempts, "Publish failed; will retry after delay.");
                    tokio::time::sleep(self.publish_retry_delay).await;
                }
            }
        }

        for item in &items {
            self.offsets.commit(item.cursor);
        }
        if let Err(e) = self.offsets.sync() {
            // Non-fatal: the in-memory cursors advanced; a crash before the
            // next successful checkpoint replays lines, which at-least-once
            // delivery permits.
            error!(error = %e, "Failed to checkpoint offsets.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded_channel::{QueueSender, bounded};
    use crate::record::{LineCursor, Record};
    use httpmock::prelude::*;
    use tokio::time::timeout;

    struct Fixture {
        tx: QueueSender<QueueItem>,
        offsets: Arc<OffsetStore>,
        throttle: ThrottleFlag,
        source_id: usize,
    }

    fn start_sender(server: &MockServer, limits: Limits) -> Fixture {
        let offsets = Arc::new(OffsetStore::in_memory());
        let source_id = offsets.register("/var/log/app.log");
        let throttle = ThrottleFlag::new();
        let (tx, rx) = bounded(limits.queue_capacity);

        let client = BrokerClient::new(&server.address().to_string(), "logs").unwrap();
        let sender = BatchSender::new(rx, client, offsets.clone(), throttle.clone(), &limits);
        tokio::spawn(sender.run());

        Fixture {
            tx,
            offsets,
            throttle,
            source_id,
        }
    }

    fn test_limits() -> Limits {
        Limits {
            queue_capacity: 100,
            batch_max_records: 100,
            batch_max_delay: Duration::from_millis(100),
            queue_timeout: Duration::from_millis(20),
            publish_retry_delay: Duration::from_millis(20),
            depth_poll_interval: Duration::from_millis(20),
            ..Limits::default()
        }
    }

    impl Fixture {
        async fn enqueue(&self, n: usize) -> Vec<LineCursor> {
            let mut cursors = Vec::new();
            for i in 0..n {
                let cursor = self
                    .offsets
                    .note_enqueued(self.source_id, ((i + 1) * 10) as u64);
                let record =
                    Record::new("/var/log/app.log", "host1", "raw", format!("line {}", i));
                self.tx.send(QueueItem { record, cursor }).await.unwrap();
                cursors.push(cursor);
            }
            cursors
        }

        async fn wait_all_committed(&self) {
            timeout(Duration::from_secs(5), async {
                while !self.offsets.all_committed(self.source_id) {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("timed out waiting for commits");
        }
    }

    #[tokio::test]
    async fn time_trigger_flushes_whole_batch_once() {
        let server = MockServer::start();
        let mpub = server.mock(|when, then| {
            when.method(POST)
                .path("/mpub")
                .query_param("topic", "logs")
                .body_contains("line 0")
                .body_contains("line 1")
                .body_contains("line 2");
            then.status(200).body("OK");
        });

        let fixture = start_sender(&server, test_limits());
        fixture.enqueue(3).await;
        fixture.wait_all_committed().await;

        // One request carried all three records.
        mpub.assert_hits(1);
        assert_eq!(30, fixture.offsets.committed_offset(fixture.source_id));
    }

    #[tokio::test]
    async fn size_trigger_flushes_before_time_limit() {
        let server = MockServer::start();
        let mpub = server.mock(|when, then| {
            when.method(POST).path("/mpub");
            then.status(200).body("OK");
        });

        let limits = Limits {
            batch_max_records: 5,
            batch_max_delay: Duration::from_secs(60),
            ..test_limits()
        };
        let fixture = start_sender(&server, limits);
        fixture.enqueue(5).await;
        fixture.wait_all_committed().await;

        mpub.assert_hits(1);
    }

    #[tokio::test]
    async fn failed_publish_retries_identical_batch_without_commit() {
        let server = MockServer::start();
        let mut failing = server.mock(|when, then| {
            when.method(POST).path("/mpub");
            then.status(502);
        });

        let fixture = start_sender(&server, test_limits());
        fixture.enqueue(5).await;

        // Let at least two attempts fail; no cursor may advance meanwhile.
        timeout(Duration::from_secs(5), async {
            while failing.hits() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for failed attempts");
        assert_eq!(0, fixture.offsets.committed_offset(fixture.source_id));

        failing.delete();
        let success = server.mock(|when, then| {
            when.method(POST)
                .path("/mpub")
                .body_contains("line 0")
                .body_contains("line 4");
            then.status(200).body("OK");
        });

        fixture.wait_all_committed().await;

        // The batch content survived the retries unchanged and committed
        // exactly once, wholly.
        success.assert_hits(1);
        assert_eq!(50, fixture.offsets.committed_offset(fixture.source_id));
    }

    #[tokio::test]
    async fn no_publish_while_throttled() {
        let server = MockServer::start();
        let mpub = server.mock(|when, then| {
            when.method(POST).path("/mpub");
            then.status(200).body("OK");
        });

        let fixture = start_sender(&server, test_limits());
        fixture.throttle.set(true);
        fixture.enqueue(3).await;

        // The flush trigger has long fired, but the gate holds everything.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(0, mpub.hits());
        assert_eq!(0, fixture.offsets.committed_offset(fixture.source_id));

        fixture.throttle.set(false);
        fixture.wait_all_committed().await;
        mpub.assert_hits(1);
    }

    #[tokio::test]
    async fn drains_resident_batch_on_queue_close() {
        let server = MockServer::start();
        let mpub = server.mock(|when, then| {
            when.method(POST).path("/mpub");
            then.status(200).body("OK");
        });

        let limits = Limits {
            batch_max_delay: Duration::from_secs(60),
            ..test_limits()
        };
        let fixture = start_sender(&server, limits);
        fixture.enqueue(2).await;

        // Closing the producer side flushes whatever accumulated.
        let Fixture { tx, offsets, source_id, .. } = fixture;
        drop(tx);

        timeout(Duration::from_secs(5), async {
            while !offsets.all_committed(source_id) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for drain");
        mpub.assert_hits(1);
    }
}
