//! librdkafka backend.
//!
//! The producer is a [`ThreadedProducer`]: librdkafka's own thread drives the
//! network and invokes [`ProducerContext::delivery`] for every record. The
//! consumer is a [`BaseConsumer`] polled from the loop's dedicated thread, so
//! rebalance callbacks run there too, serialized with polling.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::message::Message;
use rdkafka::producer::{BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::ClientContext;
use tracing::{trace, warn};

use super::consumer::{AssignmentChange, AssignmentListener, ConsumedRecord, EnvelopeConsumer};
use super::producer::{DeliveryCallback, DeliveryReport, EnvelopeProducer, encode_or_report};
use super::topic_partitions::TopicPartition;
use crate::config::{BackplaneConfig, ConsumerOptions};
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::metrics;
use crate::types::{MessageId, PartitionIndex};

const COMMITTED_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// librdkafka properties for the backplane producer.
pub fn producer_client_config(config: &BackplaneConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", config.bootstrap_servers_joined())
        .set("acks", config.producer.acks.as_client_value())
        .set("linger.ms", config.producer.linger.as_millis().to_string())
        .set(
            "message.timeout.ms",
            config.producer.message_timeout.as_millis().to_string(),
        )
        .set(
            "message.send.max.retries",
            config.producer.max_send_retries.to_string(),
        );
    client
}

/// librdkafka properties for a backplane consumer in `options.group_id`.
pub fn consumer_client_config(config: &BackplaneConfig, options: &ConsumerOptions) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", config.bootstrap_servers_joined())
        .set("group.id", &options.group_id)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .set("enable.partition.eof", "false");
    client
}

pub struct DeliveryContext {
    producer_id: Arc<str>,
    on_delivery: DeliveryCallback,
}

impl ClientContext for DeliveryContext {}

impl ProducerContext for DeliveryContext {
    type DeliveryOpaque = Box<(TopicPartition, MessageId)>;

    fn delivery(&self, result: &DeliveryResult<'_>, opaque: Self::DeliveryOpaque) {
        let (partition, message_id) = *opaque;
        let result = match result {
            Ok(message) => Ok(message.offset()),
            Err((e, _)) => Err(Error::from(e.clone())),
        };
        (self.on_delivery)(&DeliveryReport {
            producer_id: Arc::clone(&self.producer_id),
            partition,
            message_id,
            result,
        });
    }
}

pub struct KafkaProducer {
    id: Arc<str>,
    producer: ThreadedProducer<DeliveryContext>,
}

impl KafkaProducer {
    pub fn new(
        config: &BackplaneConfig,
        id: impl Into<Arc<str>>,
        on_delivery: DeliveryCallback,
    ) -> Result<Self> {
        let id = id.into();
        let context = DeliveryContext {
            producer_id: Arc::clone(&id),
            on_delivery,
        };
        let producer = producer_client_config(config).create_with_context(context)?;
        metrics::record_producer_created();
        Ok(Self { id, producer })
    }
}

impl EnvelopeProducer for KafkaProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn publish(&self, envelope: &Envelope, partition: &TopicPartition) {
        metrics::record_published(partition.topic());
        trace!(
            producer_id = %self.id,
            topic = partition.topic(),
            partition = partition.partition().value(),
            message_id = envelope.message_id().value(),
            kind = envelope.kind_name(),
            "Publishing envelope"
        );

        let callback = &self.producer.context().on_delivery;
        let Some(data) = encode_or_report(&self.id, envelope, partition, callback) else {
            return;
        };

        let record = BaseRecord::<(), [u8], _>::with_opaque_to(
            partition.topic(),
            Box::new((partition.clone(), envelope.message_id())),
        )
        .partition(partition.partition().value())
        .payload(&data[..]);

        // A full queue or unknown partition is rejected synchronously; route
        // it through the same callback as asynchronous failures.
        if let Err((e, record)) = self.producer.send(record) {
            let (partition, message_id) = *record.delivery_opaque;
            callback(&DeliveryReport {
                producer_id: Arc::clone(&self.id),
                partition,
                message_id,
                result: Err(Error::from(e)),
            });
        }
    }

    fn flush(&self, timeout: Duration) -> Result<()> {
        self.producer.flush(timeout)?;
        Ok(())
    }
}

/// Forwards librdkafka rebalances as [`AssignmentChange`]s.
pub struct RebalanceContext {
    consumer_id: String,
    listener: Mutex<Option<AssignmentListener>>,
    owned: Mutex<BTreeSet<TopicPartition>>,
}

impl RebalanceContext {
    fn notify(&self, change: AssignmentChange) {
        if let Some(listener) = self.listener.lock().as_mut() {
            listener(&change);
        }
    }
}

fn to_partitions(list: &TopicPartitionList) -> BTreeSet<TopicPartition> {
    list.elements()
        .iter()
        .map(|e| TopicPartition::new(e.topic(), PartitionIndex(e.partition())))
        .collect()
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(list) => {
                let target = to_partitions(list);
                let change = {
                    let mut owned = self.owned.lock();
                    let change = AssignmentChange {
                        assigned: target.difference(&owned).cloned().collect(),
                        revoked: owned.difference(&target).cloned().collect(),
                    };
                    *owned = target;
                    change
                };
                self.notify(change);
            }
            Rebalance::Revoke(list) => {
                let revoked = to_partitions(list);
                let change = {
                    let mut owned = self.owned.lock();
                    let change = AssignmentChange {
                        assigned: Vec::new(),
                        revoked: owned.intersection(&revoked).cloned().collect(),
                    };
                    owned.retain(|tp| !revoked.contains(tp));
                    change
                };
                // An empty revoke carries nothing; an empty assign still ends a join.
                if !change.is_empty() {
                    self.notify(change);
                }
            }
            Rebalance::Error(e) => {
                warn!(consumer_id = %self.consumer_id, error = %e, "Rebalance error");
            }
        }
    }
}

pub struct KafkaConsumer {
    id: String,
    consumer: BaseConsumer<RebalanceContext>,
    max_poll_records: usize,
}

impl KafkaConsumer {
    pub fn new(
        config: &BackplaneConfig,
        options: &ConsumerOptions,
        id: impl Into<String>,
    ) -> Result<Self> {
        let id = id.into();
        let context = RebalanceContext {
            consumer_id: id.clone(),
            listener: Mutex::new(None),
            owned: Mutex::new(BTreeSet::new()),
        };
        let consumer = consumer_client_config(config, options).create_with_context(context)?;
        Ok(Self {
            id,
            consumer,
            max_poll_records: options.max_poll_records.max(1),
        })
    }

    fn to_record<M: Message>(message: &M) -> ConsumedRecord {
        let partition = TopicPartition::new(message.topic(), PartitionIndex(message.partition()));
        let envelope = match message.payload() {
            Some(payload) => Envelope::decode(Bytes::copy_from_slice(payload)),
            None => Err(Error::codec("record without payload", Bytes::new())),
        };
        ConsumedRecord {
            partition,
            offset: message.offset(),
            envelope,
        }
    }
}

impl EnvelopeConsumer for KafkaConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn subscribe(&mut self, topics: &[&str]) -> Result<()> {
        self.consumer.subscribe(topics)?;
        Ok(())
    }

    fn on_assignment_change(&mut self, listener: AssignmentListener) {
        *self.consumer.context().listener.lock() = Some(listener);
    }

    fn poll(&mut self, timeout: Duration) -> Result<Vec<ConsumedRecord>> {
        let mut records = Vec::new();
        let mut wait = timeout;
        while records.len() < self.max_poll_records {
            match self.consumer.poll(wait) {
                Some(Ok(message)) => records.push(Self::to_record(&message)),
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
            // Drain what is already buffered without waiting again.
            wait = Duration::ZERO;
        }
        Ok(records)
    }

    fn commit(&mut self, records: &[ConsumedRecord]) -> Result<()> {
        let mut next: std::collections::BTreeMap<&TopicPartition, i64> = Default::default();
        for record in records {
            let offset = next.entry(&record.partition).or_insert(0);
            *offset = (*offset).max(record.offset + 1);
        }

        let mut list = TopicPartitionList::new();
        for (tp, offset) in next {
            list.add_partition_offset(tp.topic(), tp.partition().value(), Offset::Offset(offset))?;
        }
        self.consumer.commit(&list, CommitMode::Sync)?;
        Ok(())
    }

    fn seek_to_committed(&mut self) -> Result<()> {
        let committed = self.consumer.committed(COMMITTED_LOOKUP_TIMEOUT)?;
        for element in committed.elements() {
            let offset = match element.offset() {
                Offset::Offset(n) => Offset::Offset(n),
                _ => Offset::Beginning,
            };
            self.consumer.seek(
                element.topic(),
                element.partition(),
                offset,
                COMMITTED_LOOKUP_TIMEOUT,
            )?;
        }
        Ok(())
    }

    fn assignment(&self) -> Vec<TopicPartition> {
        self.consumer
            .context()
            .owned
            .lock()
            .iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Acks;

    #[test]
    fn test_producer_client_config() {
        let mut config = BackplaneConfig::default();
        config.producer.acks = Acks::Leader;
        config.producer.linger = Duration::from_millis(7);
        let client = producer_client_config(&config);
        assert_eq!(client.get("acks"), Some("1"));
        assert_eq!(client.get("linger.ms"), Some("7"));
        assert_eq!(client.get("bootstrap.servers"), Some("127.0.0.1:9092"));
    }

    #[test]
    fn test_consumer_client_config_disables_auto_commit() {
        let config = BackplaneConfig::default();
        let client = consumer_client_config(&config, &config.state_sender);
        assert_eq!(client.get("enable.auto.commit"), Some("false"));
        assert_eq!(client.get("group.id"), Some(config.state_sender.group_id.as_str()));
    }
}
