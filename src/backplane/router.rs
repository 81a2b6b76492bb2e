//! Outbound routing of messages and acknowledgements.
//!
//! | envelope                 | topic    | partition key         |
//! |--------------------------|----------|-----------------------|
//! | message                  | messages | receiver              |
//! | message (companion copy) | sender   | sender                |
//! | processed ack            | sender   | original sender       |
//! | delivered / seen ack     | messages | original sender       |
//!
//! Everything is fire-and-forget: a failed publish shows up only in the
//! producer's delivery callback.

use std::sync::Arc;

use tracing::error;

use super::partitioner::partition_for;
use super::producer::EnvelopeProducer;
use super::topic_partitions::TopicPartitionCache;
use crate::config::TopicConfig;
use crate::envelope::{AckEnvelope, Envelope, MessageEnvelope, StatusKind};
use crate::types::UserId;

pub struct SendersRouter {
    producer: Arc<dyn EnvelopeProducer>,
    partitions: Arc<TopicPartitionCache>,
    topics: TopicConfig,
    partition_count: u32,
}

impl SendersRouter {
    pub fn new(
        producer: Arc<dyn EnvelopeProducer>,
        partitions: Arc<TopicPartitionCache>,
        topics: TopicConfig,
        partition_count: u32,
    ) -> Self {
        partitions.ensure(&topics.messages, partition_count);
        partitions.ensure(&topics.sender, partition_count);
        Self {
            producer,
            partitions,
            topics,
            partition_count,
        }
    }

    pub fn producer(&self) -> &Arc<dyn EnvelopeProducer> {
        &self.producer
    }

    /// Route a new message to its receiver, plus the companion copy that
    /// records the processed transition on the sender's partition.
    pub fn route(&self, message: MessageEnvelope) {
        let receiver = message.receiver_id;
        let sender = message.sender_id;
        let envelope = Envelope::Message(message);
        self.publish(&self.topics.messages, receiver, &envelope);
        self.publish(&self.topics.sender, sender, &envelope);
    }

    /// Route a status transition back towards the message's sender.
    pub fn route_ack(&self, ack: AckEnvelope) {
        let topic = match ack.status {
            StatusKind::Processed => &self.topics.sender,
            StatusKind::Delivered | StatusKind::Seen => &self.topics.messages,
        };
        self.publish(topic, ack.sender_id, &Envelope::Ack(ack));
    }

    fn publish(&self, topic: &str, key: UserId, envelope: &Envelope) {
        let partition = partition_for(key, self.partition_count);
        match self.partitions.get(topic, partition) {
            Some(tp) => self.producer.publish(envelope, &tp),
            None => error!(
                producer_id = self.producer.id(),
                topic,
                partition = partition.value(),
                message_id = envelope.message_id().value(),
                "No partition handle, dropping envelope"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backplane::memory::MemoryBroker;
    use crate::backplane::producer::log_delivery_failures;
    use crate::types::{MessageId, PartitionIndex};

    const PARTITIONS: u32 = 4;

    fn setup() -> (Arc<MemoryBroker>, SendersRouter, TopicConfig) {
        let topics = TopicConfig::default();
        let broker = MemoryBroker::new();
        broker.create_topic(&topics.messages, PARTITIONS);
        broker.create_topic(&topics.sender, PARTITIONS);
        let producer = Arc::new(broker.producer("1@router", log_delivery_failures()));
        let router = SendersRouter::new(
            producer,
            Arc::new(TopicPartitionCache::new()),
            topics.clone(),
            PARTITIONS,
        );
        (broker, router, topics)
    }

    fn partition(user: i64) -> PartitionIndex {
        partition_for(UserId(user), PARTITIONS)
    }

    #[test]
    fn test_route_publishes_to_both_topics() {
        let (broker, router, topics) = setup();
        let message = MessageEnvelope::plain_text(MessageId(5), UserId(1), UserId(2), "hello");
        router.route(message.clone());

        let received = broker.envelopes(&topics.messages, partition(2));
        assert_eq!(received, vec![Envelope::Message(message.clone())]);
        let companion = broker.envelopes(&topics.sender, partition(1));
        assert_eq!(companion, vec![Envelope::Message(message)]);
    }

    #[test]
    fn test_acks_follow_original_sender() {
        let (broker, router, topics) = setup();
        let message = MessageEnvelope::plain_text(MessageId(5), UserId(1), UserId(2), "hello");
        router.route_ack(AckEnvelope::for_message(&message, StatusKind::Processed));
        router.route_ack(AckEnvelope::for_message(&message, StatusKind::Seen));

        let sender_topic = broker.envelopes(&topics.sender, partition(1));
        assert_eq!(sender_topic.len(), 1);
        assert_eq!(sender_topic[0].kind_name(), "processed");

        let messages_topic = broker.envelopes(&topics.messages, partition(1));
        assert_eq!(messages_topic.len(), 1);
        assert_eq!(messages_topic[0].kind_name(), "seen");
    }

    #[test]
    fn test_same_receiver_keeps_publish_order() {
        let (broker, router, topics) = setup();
        for id in 1..=20 {
            router.route(MessageEnvelope::plain_text(
                MessageId(id),
                UserId(id % 3),
                UserId(7),
                "x",
            ));
        }
        let ids: Vec<i64> = broker
            .envelopes(&topics.messages, partition(7))
            .iter()
            .map(|e| e.message_id().value())
            .collect();
        assert_eq!(ids, (1..=20).collect::<Vec<_>>());
    }
}
