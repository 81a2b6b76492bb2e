//! Integration tests for partitioning, the envelope wire format and outbound
//! routing over the in-process broker.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chat_backplane::backplane::DeliveryCallback;
use chat_backplane::prelude::*;

const PARTITIONS: u32 = 8;

fn broker_and_router() -> (Arc<MemoryBroker>, SendersRouter, TopicConfig) {
    broker_and_router_with(log_delivery_failures())
}

fn broker_and_router_with(callback: DeliveryCallback) -> (Arc<MemoryBroker>, SendersRouter, TopicConfig) {
    let topics = TopicConfig::default();
    let broker = MemoryBroker::new();
    broker.create_topic(&topics.messages, PARTITIONS);
    broker.create_topic(&topics.sender, PARTITIONS);
    let producer = Arc::new(broker.producer("1@routing-tests", callback));
    let router = SendersRouter::new(
        producer,
        Arc::new(TopicPartitionCache::new()),
        topics.clone(),
        PARTITIONS,
    );
    (broker, router, topics)
}

// ============================================================================
// Partitioner
// ============================================================================

#[test]
fn test_partition_is_stable_across_calls() {
    for user in [-5_i64, 0, 1, 42, 1_000_000_007, i64::MAX] {
        let first = partition_for(UserId(user), 12);
        for _ in 0..10 {
            assert_eq!(partition_for(UserId(user), 12), first);
        }
    }
}

#[test]
fn test_partition_always_in_range() {
    for count in [1_u32, 2, 3, 12, 64, 1000] {
        for user in -500_i64..500 {
            let p = partition_for(UserId(user), count).value();
            assert!(p >= 0 && (p as u32) < count, "user {user} -> {p} of {count}");
        }
    }
}

#[test]
fn test_single_partition_takes_everything() {
    for user in [i64::MIN, -1, 0, 1, i64::MAX] {
        assert_eq!(partition_for(UserId(user), 1), PartitionIndex(0));
    }
}

#[test]
fn test_sequential_users_spread_evenly() {
    let mut counts = HashMap::new();
    for user in 0..8000_i64 {
        *counts.entry(partition_for(UserId(user), PARTITIONS)).or_insert(0) += 1;
    }
    assert_eq!(counts.len(), PARTITIONS as usize);
    assert!(counts.values().all(|&c| c == 1000), "{counts:?}");
}

// ============================================================================
// Envelope codec
// ============================================================================

#[test]
fn test_message_survives_the_wire() {
    let envelope = Envelope::Message(MessageEnvelope::plain_text(
        MessageId(7_000_000_000),
        UserId(11),
        UserId(22),
        "hello, world",
    ));
    let decoded = Envelope::decode(envelope.encode().unwrap()).unwrap();
    assert_eq!(decoded, envelope);
    assert_eq!(decoded.recipient(), UserId(22));
}

#[test]
fn test_ack_is_addressed_to_original_sender() {
    let message = MessageEnvelope::plain_text(MessageId(9), UserId(11), UserId(22), "x");
    let ack = Envelope::Ack(AckEnvelope::for_message(&message, StatusKind::Seen));
    let decoded = Envelope::decode(ack.encode().unwrap()).unwrap();
    assert_eq!(decoded, ack);
    assert_eq!(decoded.recipient(), UserId(11));
    assert_eq!(decoded.kind_name(), "seen");
}

#[test]
fn test_garbage_is_rejected_with_codec_error() {
    for data in [&b""[..], b"\x01", b"not an envelope at all, really not"] {
        let result = Envelope::decode(bytes::Bytes::copy_from_slice(data));
        assert!(matches!(result, Err(Error::Codec { .. })), "{data:?}");
    }
}

#[test]
fn test_unknown_version_is_rejected() {
    let envelope = Envelope::Message(MessageEnvelope::plain_text(
        MessageId(1),
        UserId(1),
        UserId(2),
        "hi",
    ));
    let mut data = envelope.encode().unwrap().to_vec();
    data[0] = 99;
    assert!(Envelope::decode(bytes::Bytes::from(data)).is_err());
}

// ============================================================================
// Router
// ============================================================================

#[test]
fn test_message_lands_on_receiver_and_sender_partitions() {
    let (broker, router, topics) = broker_and_router();
    let message = MessageEnvelope::plain_text(MessageId(100), UserId(1), UserId(2), "hi");
    router.route(message.clone());

    let receiver_partition = partition_for(UserId(2), PARTITIONS);
    let sender_partition = partition_for(UserId(1), PARTITIONS);
    assert_eq!(
        broker.envelopes(&topics.messages, receiver_partition),
        vec![Envelope::Message(message.clone())]
    );
    assert_eq!(
        broker.envelopes(&topics.sender, sender_partition),
        vec![Envelope::Message(message)]
    );
}

#[test]
fn test_acks_follow_the_routing_table() {
    let (broker, router, topics) = broker_and_router();
    let message = MessageEnvelope::plain_text(MessageId(5), UserId(3), UserId(4), "hi");
    let sender_partition = partition_for(UserId(3), PARTITIONS);

    router.route_ack(AckEnvelope::for_message(&message, StatusKind::Processed));
    router.route_ack(AckEnvelope::for_message(&message, StatusKind::Delivered));
    router.route_ack(AckEnvelope::for_message(&message, StatusKind::Seen));

    let on_sender_topic = broker.envelopes(&topics.sender, sender_partition);
    assert_eq!(on_sender_topic.len(), 1);
    assert_eq!(on_sender_topic[0].kind_name(), "processed");

    let kinds: Vec<_> = broker
        .envelopes(&topics.messages, sender_partition)
        .iter()
        .map(Envelope::kind_name)
        .collect();
    assert_eq!(kinds, ["delivered", "seen"]);
}

#[test]
fn test_per_user_order_is_preserved() {
    let (broker, router, topics) = broker_and_router();
    for id in 1..=50 {
        router.route(MessageEnvelope::plain_text(
            MessageId(id),
            UserId(id % 3),
            UserId(77),
            format!("m{id}"),
        ));
    }

    let ids: Vec<i64> = broker
        .envelopes(&topics.messages, partition_for(UserId(77), PARTITIONS))
        .iter()
        .map(|e| e.message_id().value())
        .collect();
    assert_eq!(ids, (1..=50).collect::<Vec<_>>());
}

#[test]
fn test_failed_publish_reaches_delivery_callback_only() {
    let failures = Arc::new(AtomicUsize::new(0));
    let callback: DeliveryCallback = {
        let failures = Arc::clone(&failures);
        Arc::new(move |report| {
            if !report.is_success() {
                failures.fetch_add(1, Ordering::SeqCst);
            }
        })
    };
    let (broker, router, topics) = broker_and_router_with(callback);

    broker.fail_next_publishes(1);
    router.route(MessageEnvelope::plain_text(MessageId(1), UserId(1), UserId(2), "hi"));

    assert_eq!(failures.load(Ordering::SeqCst), 1);
    // Only the first of the two publishes failed.
    assert!(broker.envelopes(&topics.messages, partition_for(UserId(2), PARTITIONS)).is_empty());
    assert_eq!(
        broker.partition_len(&topics.sender, partition_for(UserId(1), PARTITIONS)),
        1
    );
}
