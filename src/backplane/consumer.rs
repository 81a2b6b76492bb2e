//! Envelope consumer abstraction and the blocking consume loop.
//!
//! A consumer is owned by exactly one dedicated thread. Assignment callbacks
//! run on that thread from inside [`EnvelopeConsumer::poll`], so anything they
//! update is visible as soon as `poll` returns.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::rebalance::PartitionChangeHandler;
use super::topic_partitions::TopicPartition;
use crate::envelope::Envelope;
use crate::error::Result;
use crate::metrics;

/// One record returned by a poll.
///
/// Decoding happens in the consumer so the loop can skip a malformed record
/// and still commit past it.
#[derive(Debug, Clone)]
pub struct ConsumedRecord {
    pub partition: TopicPartition,
    pub offset: i64,
    pub envelope: Result<Envelope>,
}

/// Partitions gained and lost in one rebalance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentChange {
    pub assigned: Vec<TopicPartition>,
    pub revoked: Vec<TopicPartition>,
}

impl AssignmentChange {
    pub fn is_empty(&self) -> bool {
        self.assigned.is_empty() && self.revoked.is_empty()
    }
}

/// Called from inside `poll` whenever the broker hands this consumer a new
/// assignment. The change is empty when the join left it without partitions.
pub type AssignmentListener = Box<dyn FnMut(&AssignmentChange) + Send>;

/// Blocking, group-managed consumer of [`Envelope`]s.
pub trait EnvelopeConsumer: Send {
    fn id(&self) -> &str;

    /// Join the consumer group for `topics`.
    fn subscribe(&mut self, topics: &[&str]) -> Result<()>;

    /// Replace the assignment listener.
    fn on_assignment_change(&mut self, listener: AssignmentListener);

    /// Wait up to `timeout` for records. An empty batch is a timeout, not an
    /// error.
    fn poll(&mut self, timeout: Duration) -> Result<Vec<ConsumedRecord>>;

    /// Commit the offsets following `records`, per partition.
    fn commit(&mut self, records: &[ConsumedRecord]) -> Result<()>;

    /// Rewind every assigned partition to its committed offset so the
    /// uncommitted records are delivered again.
    fn seek_to_committed(&mut self) -> Result<()>;

    /// Partitions currently assigned.
    fn assignment(&self) -> Vec<TopicPartition>;
}

/// Per-envelope work of a consume loop.
pub trait EnvelopeProcessor: Send {
    /// Handle one envelope. A retriable error aborts the batch, which is then
    /// redelivered; any other error stops the loop.
    fn process(&mut self, envelope: &Envelope) -> Result<()>;
}

impl<P: EnvelopeProcessor + ?Sized> EnvelopeProcessor for Box<P> {
    fn process(&mut self, envelope: &Envelope) -> Result<()> {
        (**self).process(envelope)
    }
}

/// Poll, process and commit until cancelled.
pub struct ConsumeLoop<C, P> {
    consumer: C,
    processor: P,
    partitions: Arc<PartitionChangeHandler>,
    poll_timeout: Duration,
    cancel: CancellationToken,
}

impl<C, P> ConsumeLoop<C, P>
where
    C: EnvelopeConsumer,
    P: EnvelopeProcessor,
{
    /// Subscribe `consumer` to `topics` and route its assignment changes to
    /// `partitions`.
    pub fn new(
        mut consumer: C,
        topics: &[&str],
        processor: P,
        partitions: Arc<PartitionChangeHandler>,
        poll_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let handler = Arc::clone(&partitions);
        consumer.on_assignment_change(Box::new(move |change| handler.on_assignment_change(change)));
        consumer.subscribe(topics)?;
        info!(consumer_id = consumer.id(), topics = ?topics, "Subscribed");

        Ok(Self {
            consumer,
            processor,
            partitions,
            poll_timeout,
            cancel,
        })
    }

    pub fn consumer(&self) -> &C {
        &self.consumer
    }

    /// Run until the cancellation token fires.
    ///
    /// Returns an error only for failures that must stop the loop. The
    /// consumer is dropped on return, which releases its broker handle.
    pub fn run(mut self) -> Result<()> {
        let consumer_id = self.consumer.id().to_string();
        info!(consumer_id = %consumer_id, "Consume loop started");

        while !self.cancel.is_cancelled() {
            let records = self.consumer.poll(self.poll_timeout)?;
            self.partitions.on_poll_complete();
            if records.is_empty() {
                continue;
            }

            let started = Instant::now();
            match self.process_batch(&consumer_id, &records) {
                Ok(processed) => {
                    self.consumer.commit(&records)?;
                    metrics::record_batch(&consumer_id, processed, started.elapsed().as_secs_f64());
                    debug!(consumer_id = %consumer_id, records = records.len(), processed, "Committed batch");
                }
                Err(e) if e.is_retriable() => {
                    warn!(consumer_id = %consumer_id, error = %e, "Batch failed, rewinding to committed offsets");
                    metrics::record_batch_retry(&consumer_id);
                    self.consumer.seek_to_committed()?;
                }
                Err(e) => return Err(e),
            }
        }

        info!(consumer_id = %consumer_id, "Consume loop stopped");
        Ok(())
    }

    fn process_batch(&mut self, consumer_id: &str, records: &[ConsumedRecord]) -> Result<usize> {
        let mut processed = 0;
        for record in records {
            match &record.envelope {
                Ok(envelope) => {
                    self.processor.process(envelope)?;
                    processed += 1;
                }
                Err(e) => {
                    metrics::record_skipped(consumer_id);
                    warn!(
                        consumer_id,
                        topic = record.partition.topic(),
                        partition = record.partition.partition().value(),
                        offset = record.offset,
                        error = %e,
                        "Skipping undecodable record"
                    );
                }
            }
        }
        Ok(processed)
    }
}
