// SPDX-License-Identifier: Apache-2.0

//! Bounded delivery queue between tailers and the batch sender.
//!
//! A thin wrapper over a flume bounded channel. `send` suspends the calling
//! task while the queue is at capacity, which is the mechanism that carries
//! broker backpressure all the way back to file reading: when the sender
//! stops draining, tailers stall on their next enqueue.

use flume::{Receiver, Sender};
use std::fmt;
use std::time::Duration;

#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    Disconnected,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Disconnected => write!(f, "delivery queue disconnected"),
        }
    }
}

impl std::error::Error for SendError {}

pub struct QueueSender<T> {
    tx: Sender<T>,
}

impl<T> QueueSender<T> {
    /// Enqueue one item, suspending while the queue is full.
    pub async fn send(&self, item: T) -> Result<(), SendError> {
        match self.tx.send_async(item).await {
            Ok(()) => Ok(()),
            Err(_e) => Err(SendError::Disconnected), // receiver closed
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

/// Outcome of a bounded dequeue attempt.
pub enum Dequeue<T> {
    Item(T),
    /// No item arrived within the timeout; the caller re-evaluates its
    /// elapsed-time flush trigger and tries again.
    TimedOut,
    /// All senders dropped and the queue is drained.
    Disconnected,
}

pub struct QueueReceiver<T> {
    rx: Receiver<T>,
}

impl<T> QueueReceiver<T> {
    pub async fn next(&mut self) -> Option<T> {
        match self.rx.recv_async().await {
            Ok(item) => Some(item),
            Err(_e) => None, // disconnected
        }
    }

    /// Dequeue with an upper bound on the wait. The timeout exists so the
    /// consumer wakes up while idle, not to abandon work.
    pub async fn next_timeout(&mut self, timeout: Duration) -> Dequeue<T> {
        match tokio::time::timeout(timeout, self.rx.recv_async()).await {
            Ok(Ok(item)) => Dequeue::Item(item),
            Ok(Err(_)) => Dequeue::Disconnected,
            Err(_elapsed) => Dequeue::TimedOut,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Create a delivery queue with a fixed capacity.
pub fn bounded<T>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = flume::bounded::<T>(capacity);

    (QueueSender { tx }, QueueReceiver { rx })
}
