// SPDX-License-Identifier: Apache-2.0

//! Broker backlog monitoring and the advisory throttle flag.
//!
//! The monitor is the flag's single writer and the batch sender its single
//! reader. Reads and writes use relaxed atomics: a stale read costs at most
//! one extra publish attempt or one extra wait cycle, never a correctness
//! violation, so no stronger ordering is needed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::broker::BrokerClient;

/// Advisory gate on publishing. Lives for the process lifetime.
#[derive(Clone, Default)]
pub struct ThrottleFlag {
    engaged: Arc<AtomicBool>,
}

impl ThrottleFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, engaged: bool) {
        self.engaged.store(engaged, Ordering::Relaxed);
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::Relaxed)
    }
}

/// Polls the broker's per-topic backlog depth at a fixed interval and
/// engages the throttle flag while the depth exceeds the limit. A failed
/// or unreadable poll leaves the flag at its previous value; a transient
/// monitoring outage must not throttle or unthrottle the pipeline by
/// itself.
pub struct DepthMonitor {
    client: BrokerClient,
    flag: ThrottleFlag,
    depth_limit: u64,
    poll_interval: Duration,
}

impl DepthMonitor {
    pub fn new(
        client: BrokerClient,
        flag: ThrottleFlag,
        depth_limit: u64,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client,
            flag,
            depth_limit,
            poll_interval,
        }
    }

    /// Run until process exit. No backoff growth; the interval is fixed.
    pub async fn run(self) {
        loop {
            self.poll_once().await;
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn poll_once(&self) {
        match self.client.topic_depth().await {
            Ok(Some(depth)) => {
                let engage = depth > self.depth_limit;
                if engage != self.flag.is_engaged() {
                    warn!(
                        depth,
                        limit = self.depth_limit,
                        throttled = engage,
                        "Broker backlog crossed the depth limit."
                    );
                }
                debug!(depth, "Polled broker backlog depth.");
                self.flag.set(engage);
            }
            Ok(None) => {
                debug!("Topic not present in broker stats; throttle unchanged.");
            }
            Err(e) => {
                debug!(error = %e, "Depth poll failed; throttle unchanged.");
            }
        }
    }
}
