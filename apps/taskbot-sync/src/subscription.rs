use std::collections::HashMap;

use taskbot_proto::Topic;

/// Reference-counted set of topics the client wants pushes for.
///
/// The registry only decides *when* a topic crosses the 0 ↔ 1 boundary; the
/// connection driver turns those edges into subscribe/unsubscribe frames.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    counts: HashMap<Topic, usize>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a reference. Returns `true` when this is the first one, i.e. the
    /// topic just became active and must be subscribed on the wire.
    pub fn acquire(&mut self, topic: Topic) -> bool {
        let count = self.counts.entry(topic).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Drops a reference. Returns `true` when the last one went away. An
    /// unknown topic is a no-op.
    pub fn release(&mut self, topic: &Topic) -> bool {
        let Some(count) = self.counts.get_mut(topic) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            self.counts.remove(topic);
            true
        } else {
            false
        }
    }

    pub fn ref_count(&self, topic: &Topic) -> usize {
        self.counts.get(topic).copied().unwrap_or(0)
    }

    pub fn is_active(&self, topic: &Topic) -> bool {
        self.counts.contains_key(topic)
    }

    /// Active topics, in no particular order.
    pub fn active(&self) -> impl Iterator<Item = &Topic> {
        self.counts.keys()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}
