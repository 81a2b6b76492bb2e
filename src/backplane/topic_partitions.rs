//! Preallocated partition handles.
//!
//! The send and receive paths address partitions by [`TopicPartition`]. All
//! handles for a topic are built once for `[0, partition_count)` and shared
//! afterwards, so routing a message never allocates. Readers go through an
//! [`ArcSwap`] snapshot and never take a lock; the rare refresh after a
//! rebalance swaps in a new snapshot.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::types::PartitionIndex;

/// Cheap value handle naming one partition of one topic.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopicPartition {
    topic: Arc<str>,
    partition: PartitionIndex,
}

impl TopicPartition {
    pub fn new(topic: impl Into<Arc<str>>, partition: PartitionIndex) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    #[inline]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[inline]
    pub fn partition(&self) -> PartitionIndex {
        self.partition
    }
}

impl fmt::Debug for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

type Snapshot = HashMap<String, Arc<[TopicPartition]>>;

/// Arena of [`TopicPartition`] handles indexed by topic and partition.
pub struct TopicPartitionCache {
    topics: ArcSwap<Snapshot>,
    // Serializes writers so concurrent refreshes do not lose each other.
    write_lock: Mutex<()>,
}

impl TopicPartitionCache {
    pub fn new() -> Self {
        Self {
            topics: ArcSwap::from_pointee(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Build handles for every partition of every topic.
    pub fn with_topics<'a>(topics: impl IntoIterator<Item = &'a str>, partition_count: u32) -> Self {
        let cache = Self::new();
        for topic in topics {
            cache.ensure(topic, partition_count);
        }
        cache
    }

    /// Make sure `topic` has handles for at least `partition_count` partitions.
    ///
    /// Existing handles are kept; the table only grows. Returns true when new
    /// handles were allocated.
    pub fn ensure(&self, topic: &str, partition_count: u32) -> bool {
        let _guard = self.write_lock.lock();
        let current = self.topics.load();
        let existing = current.get(topic).map(|h| h.len()).unwrap_or(0);
        if existing >= partition_count as usize {
            return false;
        }

        let previous = current.get(topic);
        let name: Arc<str> = previous
            .and_then(|h| h.first())
            .map(|tp| Arc::clone(&tp.topic))
            .unwrap_or_else(|| Arc::from(topic));
        let handles: Arc<[TopicPartition]> = previous
            .into_iter()
            .flat_map(|h| h.iter().cloned())
            .chain((existing as i32..partition_count as i32).map(|p| TopicPartition {
                topic: Arc::clone(&name),
                partition: PartitionIndex(p),
            }))
            .collect();

        let mut next: Snapshot = (**current).clone();
        next.insert(topic.to_string(), handles);
        self.topics.store(Arc::new(next));
        true
    }

    /// Handle for `(topic, partition)`, if allocated.
    #[inline]
    pub fn get(&self, topic: &str, partition: PartitionIndex) -> Option<TopicPartition> {
        self.topics
            .load()
            .get(topic)
            .and_then(|handles| handles.get(partition.as_usize()))
            .filter(|_| partition.value() >= 0)
            .cloned()
    }

    /// Number of allocated handles for `topic`.
    pub fn partition_count(&self, topic: &str) -> usize {
        self.topics.load().get(topic).map(|h| h.len()).unwrap_or(0)
    }
}

impl Default for TopicPartitionCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_topics_preallocates() {
        let cache = TopicPartitionCache::with_topics(["a", "b"], 4);
        assert_eq!(cache.partition_count("a"), 4);
        assert_eq!(cache.partition_count("b"), 4);
        let handle = cache.get("a", PartitionIndex(3)).unwrap();
        assert_eq!(handle.topic(), "a");
        assert_eq!(handle.partition(), PartitionIndex(3));
    }

    #[test]
    fn test_out_of_range_is_none() {
        let cache = TopicPartitionCache::with_topics(["a"], 2);
        assert!(cache.get("a", PartitionIndex(2)).is_none());
        assert!(cache.get("a", PartitionIndex(-1)).is_none());
        assert!(cache.get("missing", PartitionIndex(0)).is_none());
    }

    #[test]
    fn test_handles_share_topic_name() {
        let cache = TopicPartitionCache::with_topics(["a"], 2);
        let h0 = cache.get("a", PartitionIndex(0)).unwrap();
        let h1 = cache.get("a", PartitionIndex(1)).unwrap();
        assert!(Arc::ptr_eq(&h0.topic, &h1.topic));
    }

    #[test]
    fn test_ensure_only_grows() {
        let cache = TopicPartitionCache::with_topics(["a"], 4);
        assert!(!cache.ensure("a", 2));
        assert_eq!(cache.partition_count("a"), 4);
        assert!(cache.ensure("a", 6));
        assert_eq!(cache.partition_count("a"), 6);
    }

    #[test]
    fn test_display() {
        let tp = TopicPartition::new("messages", PartitionIndex(5));
        assert_eq!(tp.to_string(), "messages[5]");
    }
}
