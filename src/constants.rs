//! Centralized wire and configuration constants.
//!
//! # Categories
//!
//! - **Wire Constants**: envelope layout and limits
//! - **Snowflake Constants**: layout of timestamp-derived message ids
//! - **Defaults**: values used when configuration is not provided

// =============================================================================
// Wire Constants
// =============================================================================

/// Version byte written at the start of every encoded envelope.
pub const ENVELOPE_VERSION: u8 = 1;

/// Fixed header size: version (1) + message_id (8) + sender_id (8) +
/// receiver_id (8) + kind (1) + payload length (4).
pub const ENVELOPE_HEADER_SIZE: usize = 30;

/// Largest payload accepted by the codec (1 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

// =============================================================================
// Snowflake Constants
// =============================================================================

/// Epoch for timestamp-derived message ids: 2021-01-01T00:00:00Z in unix millis.
pub const SNOWFLAKE_EPOCH_MILLIS: i64 = 1_609_459_200_000;

/// Bits below the timestamp (generator id + sequence).
pub const SNOWFLAKE_TIMESTAMP_SHIFT: u32 = 22;

// =============================================================================
// Defaults
// =============================================================================

/// Default broker bootstrap list.
pub const DEFAULT_BOOTSTRAP_SERVERS: &str = "127.0.0.1:9092";

/// Default partition count for both backplane topics.
pub const DEFAULT_PARTITION_COUNT: u32 = 12;

/// Topic keyed by the envelope recipient.
pub const DEFAULT_MESSAGES_TOPIC: &str = "messages-by-receiver";

/// Topic keyed by the message sender.
pub const DEFAULT_SENDER_TOPIC: &str = "messages-by-sender";

/// Default consumer group of the receivers consumer.
pub const DEFAULT_RECEIVERS_GROUP_ID: &str = "backplane-receivers";

/// Default consumer group of the state loop reading the sender topic.
pub const DEFAULT_STATE_SENDER_GROUP_ID: &str = "backplane-state-sender";

/// Default consumer group of the state loop reading the messages topic.
pub const DEFAULT_STATE_RECEIVER_GROUP_ID: &str = "backplane-state-receiver";

/// Default bound on a single poll call.
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 1_000;

/// Default upper bound on records returned by one poll.
pub const DEFAULT_MAX_POLL_RECORDS: usize = 500;

/// Default producer batching delay.
pub const DEFAULT_LINGER_MS: u64 = 5;

/// Default time a produced message may wait for delivery.
pub const DEFAULT_MESSAGE_TIMEOUT_MS: u64 = 30_000;

/// Default retry budget handed to the broker client.
pub const DEFAULT_MAX_SEND_RETRIES: u32 = 3;

/// Default deadline for flushing buffered messages on shutdown.
pub const DEFAULT_FLUSH_TIMEOUT_MS: u64 = 10_000;

/// Default port of the HTTP health surface.
pub const DEFAULT_HEALTH_PORT: u16 = 8080;

/// Default number of control runtime worker threads.
pub const DEFAULT_CONTROL_THREADS: usize = 1;
