//! # Chat backplane
//! Partition-aware message routing and delivery-state reconciliation for a
//! horizontally scaled chat service.
//!
//! Messages are routed through a partitioned log broker keyed by user, so all
//! traffic of one user stays ordered on one partition. Three blocking consume
//! loops run on their own threads:
//!
//! - the receivers loop forwards envelopes to connected sessions and
//!   acknowledges delivered messages,
//! - two state loops (one per topic) fold messages and acknowledgements into
//!   per-chat high-water marks.
//!
//! Delivery is at-least-once. State updates are max-merges, so redelivered
//! or reordered events converge to the same state.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chat_backplane::prelude::*;
//!
//! let config = BackplaneConfig::default();
//! let broker = MemoryBroker::new();
//! broker.create_topic(&config.topics.messages, config.partition_count);
//! broker.create_topic(&config.topics.sender, config.partition_count);
//!
//! let ids = InstanceIds::new();
//! let producer = Arc::new(broker.producer(
//!     ids.next_producer_id(&config.producer.id_context),
//!     log_delivery_failures(),
//! ));
//! let router = SendersRouter::new(
//!     producer,
//!     Arc::new(TopicPartitionCache::new()),
//!     config.topics.clone(),
//!     config.partition_count,
//! );
//! router.route(MessageEnvelope::plain_text(MessageId(1), UserId(1), UserId(2), "hi"));
//! ```

#![forbid(unsafe_code)]

mod encode;
pub mod error;
mod parser;
pub mod types;

pub mod backplane;
pub mod config;
pub mod constants;
pub mod envelope;
pub mod metrics;
pub mod runtime;
pub mod server;
pub mod telemetry;

pub mod prelude {
    //! Types needed to wire a backplane instance together.
    pub use crate::backplane::{
        ChatField, ChatKey, ChatState, ChatStateStore, ConsumeLoop, EnvelopeConsumer,
        EnvelopeProcessor, EnvelopeProducer, InstanceIds, MemoryBroker, MemoryChatStateStore,
        PartitionChangeHandler, ReceiversProcessor, SendersRouter, SessionRegistry, SessionSink,
        StateProcessor, StateSource, TopicPartition, TopicPartitionCache, log_delivery_failures,
        partition_for,
    };
    pub use crate::config::{Acks, BackplaneConfig, ConsumerOptions, ProducerOptions, TopicConfig};
    pub use crate::envelope::{AckEnvelope, Envelope, MessageEnvelope, PayloadType, StatusKind};
    pub use crate::error::{Error, Result};
    pub use crate::runtime::{BackplaneRuntime, HealthRegistry, LoopHealth, RuntimeConfig};
    pub use crate::types::{ChatId, MessageId, PartitionIndex, UserId};

    pub use bytes;
}
