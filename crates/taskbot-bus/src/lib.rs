//! Topic-keyed in-process broadcast bus.
//!
//! The sync client publishes connection state, entity changes, presence and
//! notifications here; UI consumers subscribe per topic (or to everything)
//! without holding a reference to the client itself.

use std::collections::HashMap;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage<M> {
    pub topic: String,
    pub payload: M,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus receiver lagged behind by {0} messages")]
    Lagged(u64),
}

pub type BusResult<T> = Result<T, BusError>;

pub trait Bus<M>: Send + Sync {
    fn subscribe(&self, topic: &str) -> BusReceiver<M>;
    /// Receives every message regardless of topic.
    fn subscribe_all(&self) -> BusReceiver<M>;
    /// Publishes to the topic and the firehose; returns how many receivers
    /// were reached. Publishing with nobody listening is not an error.
    fn publish(&self, topic: &str, payload: M) -> usize;
}

/// Receiving half handed to consumers.
pub struct BusReceiver<M> {
    inner: broadcast::Receiver<BusMessage<M>>,
}

impl<M: Clone> BusReceiver<M> {
    pub async fn recv(&mut self) -> BusResult<BusMessage<M>> {
        self.inner.recv().await.map_err(|err| match err {
            broadcast::error::RecvError::Closed => BusError::Closed,
            broadcast::error::RecvError::Lagged(skipped) => BusError::Lagged(skipped),
        })
    }

    /// Non-blocking variant; `Ok(None)` when nothing is pending.
    pub fn try_recv(&mut self) -> BusResult<Option<BusMessage<M>>> {
        match self.inner.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Closed) => Err(BusError::Closed),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => Err(BusError::Lagged(skipped)),
        }
    }
}

#[derive(Debug)]
pub struct LocalBus<M> {
    topics: RwLock<HashMap<String, broadcast::Sender<BusMessage<M>>>>,
    firehose: broadcast::Sender<BusMessage<M>>,
    capacity: usize,
}

impl<M: Clone + Send + 'static> LocalBus<M> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            topics: RwLock::new(HashMap::new()),
            firehose: broadcast::channel(capacity).0,
            capacity,
        }
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage<M>> {
        if let Some(sender) = self.topics.read().get(topic) {
            return sender.clone();
        }
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl<M: Clone + Send + 'static> Default for LocalBus<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Clone + Send + Sync + 'static> Bus<M> for LocalBus<M> {
    fn subscribe(&self, topic: &str) -> BusReceiver<M> {
        BusReceiver {
            inner: self.sender_for(topic).subscribe(),
        }
    }

    fn subscribe_all(&self) -> BusReceiver<M> {
        BusReceiver {
            inner: self.firehose.subscribe(),
        }
    }

    fn publish(&self, topic: &str, payload: M) -> usize {
        let message = BusMessage {
            topic: topic.to_string(),
            payload,
        };
        let direct = self.sender_for(topic).send(message.clone()).unwrap_or(0);
        let firehose = self.firehose.send(message).unwrap_or(0);
        direct + firehose
    }
}
