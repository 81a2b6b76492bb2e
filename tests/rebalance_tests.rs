//! Group rebalancing as seen by a consume loop: revoked partitions stop
//! producing records, gained partitions resume from the committed offset and
//! readiness drops for the duration of the change.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chat_backplane::backplane::{ConsumedRecord, MemoryConsumer};
use chat_backplane::prelude::*;

const TOPIC: &str = "rebalance-topic";
const PARTITIONS: u32 = 4;
const POLL: Duration = Duration::from_millis(30);

struct Member {
    consumer: MemoryConsumer,
    handler: Arc<PartitionChangeHandler>,
    health: Arc<LoopHealth>,
}

fn join(broker: &Arc<MemoryBroker>, cache: &Arc<TopicPartitionCache>, id: &str) -> Member {
    let health = Arc::new(LoopHealth::new(id));
    health.mark_started();
    let handler = Arc::new(PartitionChangeHandler::new(id, Arc::clone(cache), Arc::clone(&health)));

    let mut consumer = broker.consumer(id, &ConsumerOptions::new("rebalance-group"));
    let listener = Arc::clone(&handler);
    consumer.on_assignment_change(Box::new(move |change| listener.on_assignment_change(change)));
    consumer.subscribe(&[TOPIC]).unwrap();
    Member {
        consumer,
        handler,
        health,
    }
}

fn tp(partition: i32) -> TopicPartition {
    TopicPartition::new(TOPIC, PartitionIndex(partition))
}

fn record(id: i64) -> Bytes {
    Envelope::Message(MessageEnvelope::plain_text(MessageId(id), UserId(1), UserId(2), "r"))
        .encode()
        .unwrap()
}

fn poll(member: &mut Member) -> Vec<ConsumedRecord> {
    let records = member.consumer.poll(POLL).unwrap();
    member.handler.on_poll_complete();
    records
}

#[test]
fn test_first_assignment_takes_all_partitions() {
    let broker = MemoryBroker::new();
    broker.create_topic(TOPIC, PARTITIONS);
    let cache = Arc::new(TopicPartitionCache::new());
    let mut a = join(&broker, &cache, "a");

    poll(&mut a);
    assert_eq!(a.handler.owned_partitions(), (0..4).map(tp).collect::<Vec<_>>());
    assert_eq!(cache.partition_count(TOPIC), PARTITIONS as usize);
    // Still rebalancing until the poll after the change completes.
    assert!(a.health.is_rebalancing());

    poll(&mut a);
    assert!(!a.health.is_rebalancing());
    assert!(a.health.is_ready());
}

#[test]
fn test_second_member_splits_partitions_and_resumes_from_commit() {
    let broker = MemoryBroker::new();
    broker.create_topic(TOPIC, PARTITIONS);
    let cache = Arc::new(TopicPartitionCache::new());

    let mut a = join(&broker, &cache, "a");
    for p in 0..4 {
        broker.append(&tp(p), record(p as i64 + 1)).unwrap();
    }
    let records = poll(&mut a);
    assert_eq!(records.len(), 4);
    a.consumer.commit(&records).unwrap();
    poll(&mut a);
    assert!(a.health.is_ready());

    let mut b = join(&broker, &cache, "b");
    assert!(poll(&mut a).is_empty());
    assert_eq!(a.handler.owned_partitions(), vec![tp(0), tp(1)]);
    assert!(a.health.is_rebalancing());

    broker.append(&tp(3), record(10)).unwrap();
    let gained = poll(&mut b);
    assert_eq!(b.handler.owned_partitions(), vec![tp(2), tp(3)]);
    assert_eq!(gained.len(), 1);
    assert_eq!(gained[0].partition, tp(3));
    assert_eq!(gained[0].offset, 1);
    assert_eq!(
        gained[0].envelope.as_ref().unwrap().message_id(),
        MessageId(10)
    );

    // The revoked side never sees the new record.
    assert!(poll(&mut a).is_empty());
    assert!(!a.health.is_rebalancing());
    assert!(!a.handler.owns(&tp(3)));
}

#[test]
fn test_uncommitted_records_are_redelivered_to_new_owner() {
    let broker = MemoryBroker::new();
    broker.create_topic(TOPIC, PARTITIONS);
    let cache = Arc::new(TopicPartitionCache::new());

    let mut a = join(&broker, &cache, "a");
    broker.append(&tp(3), record(1)).unwrap();
    assert_eq!(poll(&mut a).len(), 1);
    // No commit: the record is still owed to whoever owns partition 3 next.

    let mut b = join(&broker, &cache, "b");
    poll(&mut a);
    let redelivered = poll(&mut b);
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].offset, 0);
}

#[test]
fn test_leaving_member_hands_partitions_back() {
    let broker = MemoryBroker::new();
    broker.create_topic(TOPIC, PARTITIONS);
    let cache = Arc::new(TopicPartitionCache::new());

    let mut a = join(&broker, &cache, "a");
    let mut b = join(&broker, &cache, "b");
    poll(&mut a);
    poll(&mut b);
    assert_eq!(a.handler.owned_partitions().len(), 2);

    drop(b);
    poll(&mut a);
    assert_eq!(a.handler.owned_partitions().len(), 4);
}

#[test]
fn test_commit_of_revoked_partition_is_ignored() {
    let broker = MemoryBroker::new();
    broker.create_topic(TOPIC, PARTITIONS);
    let cache = Arc::new(TopicPartitionCache::new());

    let mut a = join(&broker, &cache, "a");
    broker.append(&tp(3), record(1)).unwrap();
    let records = poll(&mut a);

    let mut b = join(&broker, &cache, "b");
    poll(&mut a);
    a.consumer.commit(&records).unwrap();
    assert_eq!(broker.committed_offset("rebalance-group", &tp(3)), None);

    assert_eq!(poll(&mut b).len(), 1);
}
