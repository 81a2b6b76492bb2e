//! Message backplane: routing, consumption and delivery-state reconciliation.
//!
//! ```text
//! client -> SendersRouter -> messages topic (by receiver) -> receivers loop -> session
//!                         \-> sender topic (by sender)
//! acks   -> SendersRouter -> sender / messages topic -> state loops -> ChatStateStore
//! ```
//!
//! The broker is reached only through [`EnvelopeProducer`] and
//! [`EnvelopeConsumer`]. [`memory`] provides an in-process broker; `kafka`
//! (feature `kafka`) binds librdkafka.

pub mod consumer;
pub mod ids;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod partitioner;
pub mod producer;
pub mod rebalance;
pub mod receivers;
pub mod router;
pub mod state;
pub mod state_consumer;
pub mod state_store;
pub mod topic_partitions;

pub use consumer::{
    AssignmentChange, AssignmentListener, ConsumeLoop, ConsumedRecord, EnvelopeConsumer,
    EnvelopeProcessor,
};
pub use ids::InstanceIds;
pub use memory::{MemoryBroker, MemoryConsumer, MemoryProducer};
pub use partitioner::partition_for;
pub use producer::{DeliveryCallback, DeliveryReport, EnvelopeProducer, log_delivery_failures};
pub use rebalance::PartitionChangeHandler;
pub use receivers::{DeliveryOutcome, ReceiversProcessor, SessionRegistry, SessionSink};
pub use router::SendersRouter;
pub use state::{ChatField, ChatKey, ChatState};
pub use state_consumer::{StateProcessor, StateSource};
pub use state_store::{ChatStateStore, MemoryChatStateStore, UserChat};
pub use topic_partitions::{TopicPartition, TopicPartitionCache};
