//! Instance ids for producers and consumers.
//!
//! Ids only label log records. The counters live in one [`InstanceIds`] owned
//! by the composition root and handed to whatever creates clients.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct InstanceIds {
    producers: AtomicU64,
    consumers: AtomicU64,
}

impl InstanceIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next producer id, formatted `"<n>@<context>"`, starting at 1.
    pub fn next_producer_id(&self, context: &str) -> String {
        let n = self.producers.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}@{}", n, context)
    }

    /// Next consumer id, formatted `"<kind>-<n>"`, starting at 1.
    pub fn next_consumer_id(&self, kind: &str) -> String {
        let n = self.consumers.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}", kind, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_producer_ids_increment() {
        let ids = InstanceIds::new();
        assert_eq!(ids.next_producer_id("router"), "1@router");
        assert_eq!(ids.next_producer_id("router"), "2@router");
    }

    #[test]
    fn test_consumer_ids_are_independent_of_producers() {
        let ids = InstanceIds::new();
        ids.next_producer_id("router");
        assert_eq!(ids.next_consumer_id("receivers"), "receivers-1");
        assert_eq!(ids.next_consumer_id("state-sender"), "state-sender-2");
    }
}
