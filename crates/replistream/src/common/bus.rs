//! Message-bus seams
//!
//! The transport itself is an external collaborator; the engine only needs
//! publish/subscribe, a durable per-consumer delivery queue with
//! at-least-once semantics, and a dispatcher pause/resume control. Everything
//! here is a trait plus an in-memory implementation used by tests and
//! single-process deployments.

use crate::common::record::ChangeRecord;
use crate::common::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// An opaque message on the bus: payload plus string attributes.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Raw payload
    pub payload: Bytes,
    /// String key/value attributes
    pub attributes: HashMap<String, String>,
}

impl BusMessage {
    /// Create a message with an empty attribute set.
    pub fn new(payload: Bytes) -> Self {
        Self {
            payload,
            attributes: HashMap::new(),
        }
    }

    /// Attach an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Read an attribute.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|s| s.as_str())
    }
}

/// Publish/subscribe transport.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a message to a topic.
    async fn publish(&self, topic: &str, message: BusMessage) -> Result<()>;
}

/// Durable per-consumer delivery queue with at-least-once semantics.
///
/// The queue owns redelivery; the state machine only removes entries it has
/// decided are duplicates or consumed out of band.
#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    /// Remove one specific record from durable storage.
    async fn remove(&self, record: &ChangeRecord) -> Result<()>;

    /// Clear the whole queue, returning the number of removed entries.
    async fn clear(&self) -> Result<u64>;
}

/// Outbound dispatcher control for one consumer.
///
/// Pausing keeps the delivery callback from running while a bulk snapshot is
/// in flight; the paused flag is persisted by the caller so a restart does
/// not silently resume mid-snapshot.
#[async_trait]
pub trait DispatcherControl: Send + Sync {
    /// Stop outbound delivery.
    async fn pause(&self, reason: &str) -> Result<()>;

    /// Resume outbound delivery.
    async fn resume(&self) -> Result<()>;

    /// Whether delivery is currently paused.
    async fn is_paused(&self) -> bool;
}

/// In-memory bus that records published messages per topic.
#[derive(Default)]
pub struct MemoryBus {
    topics: Mutex<HashMap<String, Vec<BusMessage>>>,
}

impl MemoryBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages published to a topic so far.
    pub async fn published(&self, topic: &str) -> Vec<BusMessage> {
        self.topics
            .lock()
            .await
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, topic: &str, message: BusMessage) -> Result<()> {
        debug!(topic, attributes = message.attributes.len(), "publish");
        self.topics
            .lock()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(message);
        Ok(())
    }
}

/// In-memory durable queue keyed by record sequence.
#[derive(Default)]
pub struct MemoryQueue {
    entries: Mutex<Vec<ChangeRecord>>,
}

impl MemoryQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a record (delivery-side helper for tests).
    pub async fn push(&self, record: ChangeRecord) {
        self.entries.lock().await.push(record);
    }

    /// Number of entries still stored.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether the queue is empty.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl DeliveryQueue for MemoryQueue {
    async fn remove(&self, record: &ChangeRecord) -> Result<()> {
        let mut entries = self.entries.lock().await;
        // Sequence identifies a record; sequence-less control records fall
        // back to pointer-free structural match on transaction id + action.
        if let Some(pos) = entries.iter().position(|e| match record.sequence {
            Some(seq) => e.sequence == Some(seq),
            None => {
                e.sequence.is_none()
                    && e.transaction_id == record.transaction_id
                    && e.action == record.action
            }
        }) {
            entries.remove(pos);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<u64> {
        let mut entries = self.entries.lock().await;
        let n = entries.len() as u64;
        entries.clear();
        Ok(n)
    }
}

/// In-memory dispatcher control tracking the paused flag.
#[derive(Default)]
pub struct MemoryDispatcher {
    paused: Mutex<bool>,
}

impl MemoryDispatcher {
    /// Create a running (non-paused) dispatcher.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DispatcherControl for MemoryDispatcher {
    async fn pause(&self, reason: &str) -> Result<()> {
        debug!(reason, "dispatcher paused");
        *self.paused.lock().await = true;
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        debug!("dispatcher resumed");
        *self.paused.lock().await = false;
        Ok(())
    }

    async fn is_paused(&self) -> bool {
        *self.paused.lock().await
    }
}

/// Shared handles bundling the bus-side collaborators of one consumer.
#[derive(Clone)]
pub struct ConsumerChannels {
    /// Durable delivery queue
    pub queue: Arc<dyn DeliveryQueue>,
    /// Outbound dispatcher control
    pub dispatcher: Arc<dyn DispatcherControl>,
}
