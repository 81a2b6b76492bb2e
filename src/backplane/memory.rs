//! In-process partitioned log broker.
//!
//! Implements the parts of a Kafka-style broker the backplane relies on:
//! append-only partition logs, consumer groups with range assignment, a new
//! generation on every join or leave, and committed offsets that newly
//! assigned partitions resume from. Assignment changes are delivered inside
//! [`MemoryConsumer::poll`], on the polling thread, like librdkafka's
//! rebalance callbacks.
//!
//! Used by tests and by the binary when built without the `kafka` feature.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace};

use super::consumer::{AssignmentChange, AssignmentListener, ConsumedRecord, EnvelopeConsumer};
use super::producer::{
    DeliveryCallback, DeliveryReport, EnvelopeProducer, encode_or_report, unknown_partition,
};
use super::topic_partitions::TopicPartition;
use crate::config::ConsumerOptions;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::metrics;
use crate::types::PartitionIndex;

type Logs = HashMap<String, Vec<Vec<Bytes>>>;

#[derive(Default)]
struct BrokerState {
    topics: Logs,
    groups: HashMap<String, GroupState>,
    next_member_id: u64,
}

#[derive(Default)]
struct GroupState {
    generation: u64,
    /// Member id to subscribed topics.
    members: BTreeMap<u64, Vec<String>>,
    assignments: HashMap<u64, BTreeSet<TopicPartition>>,
    /// Next offset to read, per partition.
    committed: HashMap<TopicPartition, i64>,
}

impl GroupState {
    /// Range-assign every subscribed topic's partitions over its subscribers,
    /// in member id order.
    fn rebalance(&mut self, logs: &Logs) {
        self.generation += 1;
        self.assignments = self
            .members
            .keys()
            .map(|id| (*id, BTreeSet::new()))
            .collect();

        let subscribed: BTreeSet<&String> = self.members.values().flatten().collect();
        for topic in subscribed {
            let Some(partitions) = logs.get(topic) else {
                continue;
            };
            let subscribers: Vec<u64> = self
                .members
                .iter()
                .filter(|(_, topics)| topics.contains(topic))
                .map(|(id, _)| *id)
                .collect();

            let per_member = partitions.len() / subscribers.len();
            let remainder = partitions.len() % subscribers.len();
            let mut next = 0;
            for (i, member) in subscribers.iter().enumerate() {
                let count = per_member + usize::from(i < remainder);
                let owned = self.assignments.entry(*member).or_default();
                for p in next..next + count {
                    owned.insert(TopicPartition::new(topic.as_str(), PartitionIndex(p as i32)));
                }
                next += count;
            }
        }
    }

    fn owns(&self, member: u64, partition: &TopicPartition) -> bool {
        self.assignments
            .get(&member)
            .is_some_and(|owned| owned.contains(partition))
    }
}

pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    changed: Condvar,
    failing_publishes: AtomicUsize,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BrokerState::default()),
            changed: Condvar::new(),
            failing_publishes: AtomicUsize::new(0),
        })
    }

    /// Create `name` with `partitions` partitions, or grow it to that many.
    pub fn create_topic(&self, name: &str, partitions: u32) {
        let mut state = self.state.lock();
        let BrokerState { topics, groups, .. } = &mut *state;

        let logs = topics.entry(name.to_string()).or_default();
        if logs.len() >= partitions as usize {
            return;
        }
        logs.resize_with(partitions as usize, Vec::new);

        for group in groups.values_mut() {
            if group.members.values().any(|t| t.iter().any(|t| t == name)) {
                group.rebalance(topics);
            }
        }
        drop(state);
        self.changed.notify_all();
    }

    /// Make the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: usize) {
        self.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Append raw bytes to a partition, returning the new record's offset.
    pub fn append(&self, partition: &TopicPartition, data: Bytes) -> Result<i64> {
        if self
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Broker("injected publish failure".to_string()));
        }

        let mut state = self.state.lock();
        let log = state
            .topics
            .get_mut(partition.topic())
            .and_then(|logs| logs.get_mut(partition.partition().as_usize()))
            .filter(|_| partition.partition().value() >= 0)
            .ok_or_else(|| unknown_partition(partition))?;
        log.push(data);
        let offset = log.len() as i64 - 1;
        drop(state);
        self.changed.notify_all();
        Ok(offset)
    }

    /// Decoded contents of one partition, in log order. Undecodable records
    /// are left out.
    pub fn envelopes(&self, topic: &str, partition: PartitionIndex) -> Vec<Envelope> {
        let state = self.state.lock();
        state
            .topics
            .get(topic)
            .and_then(|logs| logs.get(partition.as_usize()))
            .map(|log| {
                log.iter()
                    .filter_map(|data| Envelope::decode(data.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of records in one partition.
    pub fn partition_len(&self, topic: &str, partition: PartitionIndex) -> usize {
        let state = self.state.lock();
        state
            .topics
            .get(topic)
            .and_then(|logs| logs.get(partition.as_usize()))
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn committed_offset(&self, group_id: &str, partition: &TopicPartition) -> Option<i64> {
        let state = self.state.lock();
        state
            .groups
            .get(group_id)
            .and_then(|g| g.committed.get(partition).copied())
    }

    pub fn producer(
        self: &Arc<Self>,
        id: impl Into<Arc<str>>,
        on_delivery: DeliveryCallback,
    ) -> MemoryProducer {
        metrics::record_producer_created();
        MemoryProducer {
            id: id.into(),
            broker: Arc::clone(self),
            on_delivery,
        }
    }

    pub fn consumer(self: &Arc<Self>, id: impl Into<String>, options: &ConsumerOptions) -> MemoryConsumer {
        MemoryConsumer {
            id: id.into(),
            broker: Arc::clone(self),
            group_id: options.group_id.clone(),
            max_poll_records: options.max_poll_records.max(1),
            member_id: None,
            generation: 0,
            positions: BTreeMap::new(),
            fetch_cursor: 0,
            listener: None,
        }
    }
}

pub struct MemoryProducer {
    id: Arc<str>,
    broker: Arc<MemoryBroker>,
    on_delivery: DeliveryCallback,
}

impl EnvelopeProducer for MemoryProducer {
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

        let Some(data) = encode_or_report(&self.id, envelope, partition, &self.on_delivery) else {
            return;
        };
        let result = self.broker.append(partition, data);
        (self.on_delivery)(&DeliveryReport {
            producer_id: Arc::clone(&self.id),
            partition: partition.clone(),
            message_id: envelope.message_id(),
            result,
        });
    }

    fn flush(&self, _timeout: Duration) -> Result<()> {
        // Appends are synchronous; nothing is ever buffered.
        Ok(())
    }
}

pub struct MemoryConsumer {
    id: String,
    broker: Arc<MemoryBroker>,
    group_id: String,
    max_poll_records: usize,
    member_id: Option<u64>,
    generation: u64,
    /// Assigned partitions and the next offset to read from each.
    positions: BTreeMap<TopicPartition, i64>,
    /// Index of the assigned partition the next fetch starts from.
    fetch_cursor: usize,
    listener: Option<AssignmentListener>,
}

impl MemoryConsumer {
    fn sync_assignment(&mut self, state: &BrokerState) -> Option<AssignmentChange> {
        let member = self.member_id?;
        let group = state.groups.get(&self.group_id)?;
        if group.generation == self.generation {
            return None;
        }
        self.generation = group.generation;

        let target = group.assignments.get(&member).cloned().unwrap_or_default();
        let revoked: Vec<TopicPartition> = self
            .positions
            .keys()
            .filter(|tp| !target.contains(*tp))
            .cloned()
            .collect();
        let assigned: Vec<TopicPartition> = target
            .iter()
            .filter(|tp| !self.positions.contains_key(*tp))
            .cloned()
            .collect();

        for tp in &revoked {
            self.positions.remove(tp);
        }
        for tp in &assigned {
            let offset = group.committed.get(tp).copied().unwrap_or(0);
            self.positions.insert(tp.clone(), offset);
        }

        debug!(
            consumer_id = %self.id,
            generation = self.generation,
            assigned = assigned.len(),
            revoked = revoked.len(),
            "Joined new group generation"
        );
        Some(AssignmentChange { assigned, revoked })
    }

    /// Read up to `max_poll_records`, visiting partitions round-robin so a
    /// busy partition cannot starve the ones after it.
    fn fetch(&mut self, state: &BrokerState) -> Vec<ConsumedRecord> {
        let mut records = Vec::new();
        let assigned = self.positions.len();
        if assigned == 0 {
            return records;
        }

        let start = self.fetch_cursor % assigned;
        let order: Vec<TopicPartition> = self
            .positions
            .keys()
            .cycle()
            .skip(start)
            .take(assigned)
            .cloned()
            .collect();

        for (step, tp) in order.into_iter().enumerate() {
            let Some(log) = state
                .topics
                .get(tp.topic())
                .and_then(|logs| logs.get(tp.partition().as_usize()))
            else {
                continue;
            };
            let Some(position) = self.positions.get_mut(&tp) else {
                continue;
            };
            while (*position as usize) < log.len() && records.len() < self.max_poll_records {
                let data = log[*position as usize].clone();
                records.push(ConsumedRecord {
                    partition: tp.clone(),
                    offset: *position,
                    envelope: Envelope::decode(data),
                });
                *position += 1;
            }
            if records.len() >= self.max_poll_records {
                self.fetch_cursor = (start + step + 1) % assigned;
                break;
            }
        }
        records
    }

    fn not_subscribed(&self) -> Error {
        Error::Broker(format!("consumer {} is not subscribed", self.id))
    }
}

impl EnvelopeConsumer for MemoryConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn subscribe(&mut self, topics: &[&str]) -> Result<()> {
        let mut state = self.broker.state.lock();
        let member = match self.member_id {
            Some(id) => id,
            None => {
                state.next_member_id += 1;
                let id = state.next_member_id;
                self.member_id = Some(id);
                id
            }
        };

        let BrokerState {
            topics: logs,
            groups,
            ..
        } = &mut *state;
        let group = groups.entry(self.group_id.clone()).or_default();
        group
            .members
            .insert(member, topics.iter().map(|t| t.to_string()).collect());
        group.rebalance(logs);

        drop(state);
        self.broker.changed.notify_all();
        Ok(())
    }

    fn on_assignment_change(&mut self, listener: AssignmentListener) {
        self.listener = Some(listener);
    }

    fn poll(&mut self, timeout: Duration) -> Result<Vec<ConsumedRecord>> {
        if self.member_id.is_none() {
            return Err(self.not_subscribed());
        }

        let broker = Arc::clone(&self.broker);
        let deadline = Instant::now() + timeout;
        let mut state = broker.state.lock();
        loop {
            if let Some(change) = self.sync_assignment(&state) {
                // Forwarded even when empty: a member left without partitions
                // learns that its join completed.
                if let Some(listener) = self.listener.as_mut() {
                    MutexGuard::unlocked(&mut state, || listener(&change));
                }
                // The generation may have moved while unlocked.
                continue;
            }

            let records = self.fetch(&state);
            if !records.is_empty() {
                return Ok(records);
            }
            if broker.changed.wait_until(&mut state, deadline).timed_out() {
                return Ok(Vec::new());
            }
        }
    }

    fn commit(&mut self, records: &[ConsumedRecord]) -> Result<()> {
        let member = self.member_id.ok_or_else(|| self.not_subscribed())?;

        let mut next: BTreeMap<&TopicPartition, i64> = BTreeMap::new();
        for record in records {
            let offset = next.entry(&record.partition).or_insert(0);
            *offset = (*offset).max(record.offset + 1);
        }

        let mut state = self.broker.state.lock();
        let Some(group) = state.groups.get_mut(&self.group_id) else {
            return Err(Error::Broker(format!("unknown group {}", self.group_id)));
        };
        for (tp, offset) in next {
            if group.owns(member, tp) {
                group.committed.insert(tp.clone(), offset);
            } else {
                debug!(consumer_id = %self.id, partition = %tp, "Skipping commit for partition no longer owned");
            }
        }
        Ok(())
    }

    fn seek_to_committed(&mut self) -> Result<()> {
        let state = self.broker.state.lock();
        let committed = state.groups.get(&self.group_id).map(|g| &g.committed);
        for (tp, position) in self.positions.iter_mut() {
            *position = committed.and_then(|c| c.get(tp).copied()).unwrap_or(0);
        }
        Ok(())
    }

    fn assignment(&self) -> Vec<TopicPartition> {
        self.positions.keys().cloned().collect()
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        let Some(member) = self.member_id.take() else {
            return;
        };
        let mut state = self.broker.state.lock();
        let BrokerState { topics, groups, .. } = &mut *state;
        if let Some(group) = groups.get_mut(&self.group_id) {
            group.members.remove(&member);
            group.assignments.remove(&member);
            group.rebalance(topics);
        }
        drop(state);
        self.broker.changed.notify_all();
        debug!(consumer_id = %self.id, "Left consumer group");
    }
}
