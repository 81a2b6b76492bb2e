//! Bookkeeping for broker-driven partition reassignment.
//!
//! One [`PartitionChangeHandler`] belongs to one consumer. It runs inside that
//! consumer's poll, so it never races with the loop that reads it. It keeps no
//! record of offsets and never replays anything: gained partitions resume from
//! the group's committed offset inside the consumer itself.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::{debug, info};

use super::consumer::AssignmentChange;
use super::topic_partitions::{TopicPartition, TopicPartitionCache};
use crate::metrics;
use crate::runtime::LoopHealth;

pub struct PartitionChangeHandler {
    consumer_id: String,
    cache: Arc<TopicPartitionCache>,
    health: Arc<LoopHealth>,
    owned: RwLock<BTreeSet<TopicPartition>>,
    // Set when the change arrived during the poll that is completing now.
    changed_this_poll: AtomicBool,
    // No assignment seen yet since the group was joined.
    joining: AtomicBool,
}

impl PartitionChangeHandler {
    /// The loop counts as rebalancing from here until the poll after its
    /// first assignment, since joining the group is itself a rebalance.
    pub fn new(
        consumer_id: impl Into<String>,
        cache: Arc<TopicPartitionCache>,
        health: Arc<LoopHealth>,
    ) -> Self {
        health.set_rebalancing(true);
        Self {
            consumer_id: consumer_id.into(),
            cache,
            health,
            owned: RwLock::new(BTreeSet::new()),
            changed_this_poll: AtomicBool::new(false),
            joining: AtomicBool::new(true),
        }
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Apply an assignment change and mark the loop as rebalancing.
    ///
    /// An empty change is ignored, except as the first assignment: a member
    /// left without partitions has still finished joining.
    pub fn on_assignment_change(&self, change: &AssignmentChange) {
        let joined = self.joining.swap(false, Ordering::AcqRel);
        if change.is_empty() && !joined {
            return;
        }
        self.health.set_rebalancing(true);
        self.changed_this_poll.store(true, Ordering::Release);

        for tp in &change.assigned {
            self.cache
                .ensure(tp.topic(), tp.partition().value() as u32 + 1);
        }

        let owned_count = {
            let mut owned = self.owned.write();
            for tp in &change.revoked {
                owned.remove(tp);
            }
            owned.extend(change.assigned.iter().cloned());
            owned.len()
        };

        if !change.revoked.is_empty() {
            metrics::record_rebalance(&self.consumer_id, "revoked");
            info!(
                consumer_id = %self.consumer_id,
                lost = ?change.revoked,
                "Lost partitions"
            );
        }
        if !change.assigned.is_empty() {
            metrics::record_rebalance(&self.consumer_id, "assigned");
            info!(
                consumer_id = %self.consumer_id,
                gained = ?change.assigned,
                "Gained partitions"
            );
        }
        metrics::set_owned_partitions(&self.consumer_id, owned_count);
    }

    /// Called after every successful poll.
    ///
    /// Readiness comes back on the first successful poll after the one that
    /// delivered the reassignment.
    pub fn on_poll_complete(&self) {
        if self.joining.load(Ordering::Acquire) {
            return;
        }
        if self.changed_this_poll.swap(false, Ordering::AcqRel) {
            return;
        }
        if self.health.is_rebalancing() {
            self.health.set_rebalancing(false);
            debug!(consumer_id = %self.consumer_id, "Assignment stable");
        }
    }

    pub fn owned_partitions(&self) -> Vec<TopicPartition> {
        self.owned.read().iter().cloned().collect()
    }

    pub fn owns(&self, partition: &TopicPartition) -> bool {
        self.owned.read().contains(partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PartitionIndex;

    fn tp(p: i32) -> TopicPartition {
        TopicPartition::new("messages", PartitionIndex(p))
    }

    fn handler() -> (PartitionChangeHandler, Arc<LoopHealth>, Arc<TopicPartitionCache>) {
        let health = Arc::new(LoopHealth::new("receivers"));
        health.mark_started();
        let cache = Arc::new(TopicPartitionCache::new());
        let handler =
            PartitionChangeHandler::new("receivers-1", Arc::clone(&cache), Arc::clone(&health));
        (handler, health, cache)
    }

    /// A handler past its first assignment, with readiness restored.
    fn settled_handler() -> (PartitionChangeHandler, Arc<LoopHealth>) {
        let (handler, health, _) = handler();
        handler.on_assignment_change(&AssignmentChange {
            assigned: vec![tp(0)],
            revoked: vec![],
        });
        handler.on_poll_complete();
        handler.on_poll_complete();
        assert!(health.is_ready());
        (handler, health)
    }

    #[test]
    fn test_assignment_updates_owned_set() {
        let (handler, _, _) = handler();
        handler.on_assignment_change(&AssignmentChange {
            assigned: vec![tp(0), tp(1), tp(2)],
            revoked: vec![],
        });
        handler.on_assignment_change(&AssignmentChange {
            assigned: vec![],
            revoked: vec![tp(1)],
        });
        assert_eq!(handler.owned_partitions(), vec![tp(0), tp(2)]);
        assert!(!handler.owns(&tp(1)));
    }

    #[test]
    fn test_assignment_refreshes_cache() {
        let (handler, _, cache) = handler();
        handler.on_assignment_change(&AssignmentChange {
            assigned: vec![tp(5)],
            revoked: vec![],
        });
        assert_eq!(cache.get("messages", PartitionIndex(5)), Some(tp(5)));
    }

    #[test]
    fn test_not_ready_until_first_assignment() {
        let (handler, health, _) = handler();
        assert!(health.is_rebalancing());
        for _ in 0..3 {
            handler.on_poll_complete();
        }
        assert!(!health.is_ready());

        handler.on_assignment_change(&AssignmentChange {
            assigned: vec![tp(0)],
            revoked: vec![],
        });
        handler.on_poll_complete();
        assert!(!health.is_ready());
        handler.on_poll_complete();
        assert!(health.is_ready());
    }

    #[test]
    fn test_empty_first_assignment_completes_join() {
        let (handler, health, _) = handler();
        handler.on_assignment_change(&AssignmentChange::default());
        handler.on_poll_complete();
        handler.on_poll_complete();
        assert!(health.is_ready());
        assert!(handler.owned_partitions().is_empty());
    }

    #[test]
    fn test_readiness_returns_after_next_poll() {
        let (handler, health) = settled_handler();
        handler.on_assignment_change(&AssignmentChange {
            assigned: vec![tp(1)],
            revoked: vec![tp(0)],
        });
        assert!(!health.is_ready());

        // The poll that delivered the change.
        handler.on_poll_complete();
        assert!(!health.is_ready());

        handler.on_poll_complete();
        assert!(health.is_ready());
    }

    #[test]
    fn test_empty_change_is_ignored() {
        let (handler, health) = settled_handler();
        handler.on_assignment_change(&AssignmentChange::default());
        assert!(health.is_ready());
    }
}
