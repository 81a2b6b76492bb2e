//! Envelope producer abstraction.
//!
//! Publishing is fire-and-forget: [`EnvelopeProducer::publish`] enqueues into
//! the client's buffer and returns. The outcome arrives later through the
//! producer's [`DeliveryCallback`], which by default only logs failures. This
//! layer never retries; retries belong to the broker client and are bounded by
//! [`ProducerOptions::max_send_retries`](crate::config::ProducerOptions).

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info};

use super::topic_partitions::TopicPartition;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::metrics;
use crate::types::MessageId;

/// Outcome of one publish, reported after the broker client settles it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub producer_id: Arc<str>,
    pub partition: TopicPartition,
    pub message_id: MessageId,
    /// Offset assigned by the broker, or the delivery error.
    pub result: Result<i64>,
}

impl DeliveryReport {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Invoked once per published envelope, from a broker client thread.
pub type DeliveryCallback = Arc<dyn Fn(&DeliveryReport) + Send + Sync>;

/// Default callback: count and log failed deliveries.
pub fn log_delivery_failures() -> DeliveryCallback {
    Arc::new(|report: &DeliveryReport| {
        if let Err(e) = &report.result {
            metrics::record_delivery_failure(report.partition.topic());
            error!(
                producer_id = %report.producer_id,
                topic = report.partition.topic(),
                partition = report.partition.partition().value(),
                message_id = report.message_id.value(),
                error = %e,
                "Failed to deliver envelope"
            );
        }
    })
}

/// Non-blocking publisher of [`Envelope`]s to explicit partitions.
pub trait EnvelopeProducer: Send + Sync {
    /// Id used in every log record of this producer.
    fn id(&self) -> &str;

    /// Enqueue `envelope` for `partition`.
    ///
    /// Never blocks on the network and never fails: errors, including
    /// encoding errors, are reported through the delivery callback.
    fn publish(&self, envelope: &Envelope, partition: &TopicPartition);

    /// Block until buffered envelopes are sent or `timeout` elapses.
    fn flush(&self, timeout: Duration) -> Result<()>;

    /// [`flush`](Self::flush) with start, success and failure logged.
    fn flush_pending(&self, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        info!(producer_id = self.id(), timeout_ms = timeout.as_millis() as u64, "Flushing pending envelopes");
        match self.flush(timeout) {
            Ok(()) => {
                info!(
                    producer_id = self.id(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Flushed pending envelopes"
                );
                Ok(())
            }
            Err(e) => {
                error!(producer_id = self.id(), error = %e, "Failed to flush pending envelopes");
                Err(e)
            }
        }
    }
}

/// Encode `envelope`, reporting an encoding failure through `callback`.
///
/// Shared by producer implementations so that `publish` stays infallible.
pub(crate) fn encode_or_report(
    producer_id: &Arc<str>,
    envelope: &Envelope,
    partition: &TopicPartition,
    callback: &DeliveryCallback,
) -> Option<bytes::Bytes> {
    match envelope.encode() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            callback(&DeliveryReport {
                producer_id: Arc::clone(producer_id),
                partition: partition.clone(),
                message_id: envelope.message_id(),
                result: Err(e),
            });
            None
        }
    }
}

/// Error reported when a publish targets a partition the broker does not have.
pub(crate) fn unknown_partition(partition: &TopicPartition) -> Error {
    Error::Broker(format!("unknown topic or partition {}", partition))
}
