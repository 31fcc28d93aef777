use std::collections::VecDeque;

use taskbot_proto::Envelope;

use crate::metrics;

/// Envelopes accepted while the socket was down, in the order they were
/// sent. Nothing is ever evicted; the queue only empties by flushing.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    items: VecDeque<Envelope>,
    total_queued: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub total_queued: u64,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, envelope: Envelope) {
        self.items.push_back(envelope);
        self.total_queued += 1;
        metrics::QUEUED.set(self.items.len() as i64);
    }

    /// Puts an envelope back at the head after a failed write.
    pub fn requeue_front(&mut self, envelope: Envelope) {
        self.items.push_front(envelope);
        metrics::QUEUED.set(self.items.len() as i64);
    }

    pub fn pop(&mut self) -> Option<Envelope> {
        let item = self.items.pop_front();
        metrics::QUEUED.set(self.items.len() as i64);
        item
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.items.len(),
            total_queued: self.total_queued,
        }
    }
}
