//! Configuration for the backplane.
//!
//! The backplane does not own its configuration source. The composition root
//! reads it with [`BackplaneConfig::from_env`] and validates it before any
//! broker client is created:
//!
//! ```rust,no_run
//! use chat_backplane::config::BackplaneConfig;
//!
//! let config = BackplaneConfig::from_env().expect("invalid environment");
//! config.validate_or_panic();
//! ```

use std::time::Duration;

use crate::constants::{
    DEFAULT_BOOTSTRAP_SERVERS, DEFAULT_CONTROL_THREADS, DEFAULT_FLUSH_TIMEOUT_MS,
    DEFAULT_HEALTH_PORT, DEFAULT_LINGER_MS, DEFAULT_MAX_POLL_RECORDS, DEFAULT_MAX_SEND_RETRIES,
    DEFAULT_MESSAGE_TIMEOUT_MS, DEFAULT_MESSAGES_TOPIC, DEFAULT_PARTITION_COUNT,
    DEFAULT_POLL_TIMEOUT_MS, DEFAULT_RECEIVERS_GROUP_ID, DEFAULT_SENDER_TOPIC,
    DEFAULT_STATE_RECEIVER_GROUP_ID, DEFAULT_STATE_SENDER_GROUP_ID,
};
use crate::error::{Error, Result};

/// Producer acknowledgement mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Acks {
    /// Wait for all in-sync replicas.
    #[default]
    All,
    /// Wait for the partition leader only.
    Leader,
    /// Do not wait for the broker.
    None,
}

impl Acks {
    /// Value of the librdkafka `acks` property.
    pub fn as_client_value(&self) -> &'static str {
        match self {
            Acks::All => "all",
            Acks::Leader => "1",
            Acks::None => "0",
        }
    }
}

impl std::str::FromStr for Acks {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "all" | "-1" => Ok(Acks::All),
            "leader" | "1" => Ok(Acks::Leader),
            "none" | "0" => Ok(Acks::None),
            _ => Err(format!(
                "Unknown acks mode '{}'. Valid modes: all, leader, none",
                s
            )),
        }
    }
}

/// Names of the two backplane topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicConfig {
    /// Keyed by recipient: messages by receiver, acknowledgements by the
    /// original sender.
    pub messages: String,
    /// Keyed by sender: companion envelopes recording the processed transition.
    pub sender: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            messages: DEFAULT_MESSAGES_TOPIC.to_string(),
            sender: DEFAULT_SENDER_TOPIC.to_string(),
        }
    }
}

/// Producer tuning handed to the broker client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerOptions {
    /// Suffix of producer ids, e.g. `"3@router"`.
    pub id_context: String,
    pub acks: Acks,
    /// Batching delay before a buffered message is sent.
    pub linger: Duration,
    /// Time a message may wait for delivery before it is reported failed.
    pub message_timeout: Duration,
    /// Bounded retries performed by the broker client. The backplane itself
    /// never retries a publish.
    pub max_send_retries: u32,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self {
            id_context: "backplane".to_string(),
            acks: Acks::default(),
            linger: Duration::from_millis(DEFAULT_LINGER_MS),
            message_timeout: Duration::from_millis(DEFAULT_MESSAGE_TIMEOUT_MS),
            max_send_retries: DEFAULT_MAX_SEND_RETRIES,
        }
    }
}

/// Consumer group membership and polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerOptions {
    pub group_id: String,
    /// Upper bound on a single blocking poll.
    pub poll_timeout: Duration,
    /// Upper bound on records handed to the loop per poll.
    pub max_poll_records: usize,
}

impl ConsumerOptions {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            max_poll_records: DEFAULT_MAX_POLL_RECORDS,
        }
    }
}

/// Full backplane configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackplaneConfig {
    pub bootstrap_servers: Vec<String>,
    /// Partition count of both topics. Must match the broker and must be the
    /// same on every instance, since routing depends on it.
    pub partition_count: u32,
    pub topics: TopicConfig,
    pub producer: ProducerOptions,
    pub receivers: ConsumerOptions,
    /// State loop over the sender topic. Each loop has its own group so that
    /// one leaving never rebalances another.
    pub state_sender: ConsumerOptions,
    /// State loop over the messages topic.
    pub state_receiver: ConsumerOptions,
    /// Deadline for flushing buffered envelopes on shutdown.
    pub flush_timeout: Duration,
    /// Port of the HTTP health surface. 0 disables it.
    pub health_port: u16,
    /// Worker threads of the async control runtime.
    pub control_threads: usize,
}

impl Default for BackplaneConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: vec![DEFAULT_BOOTSTRAP_SERVERS.to_string()],
            partition_count: DEFAULT_PARTITION_COUNT,
            topics: TopicConfig::default(),
            producer: ProducerOptions::default(),
            receivers: ConsumerOptions::new(DEFAULT_RECEIVERS_GROUP_ID),
            state_sender: ConsumerOptions::new(DEFAULT_STATE_SENDER_GROUP_ID),
            state_receiver: ConsumerOptions::new(DEFAULT_STATE_RECEIVER_GROUP_ID),
            flush_timeout: Duration::from_millis(DEFAULT_FLUSH_TIMEOUT_MS),
            health_port: DEFAULT_HEALTH_PORT,
            control_threads: DEFAULT_CONTROL_THREADS,
        }
    }
}

impl BackplaneConfig {
    /// Bootstrap list in the comma-joined form broker clients expect.
    pub fn bootstrap_servers_joined(&self) -> String {
        self.bootstrap_servers.join(",")
    }

    /// Validate the configuration, collecting every violation.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.bootstrap_servers.is_empty()
            || self.bootstrap_servers.iter().any(|s| s.trim().is_empty())
        {
            errors.push("bootstrap_servers must list at least one non-empty address".to_string());
        }

        if self.partition_count == 0 {
            errors.push("partition_count must be at least 1".to_string());
        }
        if self.partition_count > i32::MAX as u32 {
            errors.push(format!(
                "partition_count ({}) exceeds the broker partition index range",
                self.partition_count
            ));
        }

        if self.topics.messages.is_empty() || self.topics.sender.is_empty() {
            errors.push("topic names must not be empty".to_string());
        }
        if self.topics.messages == self.topics.sender {
            errors.push(format!(
                "messages topic and sender topic must differ (both '{}')",
                self.topics.messages
            ));
        }

        let consumers = [
            ("receivers", &self.receivers),
            ("state_sender", &self.state_sender),
            ("state_receiver", &self.state_receiver),
        ];
        for (name, consumer) in consumers {
            if consumer.group_id.is_empty() {
                errors.push(format!("{} group_id must not be empty", name));
            }
            if consumer.poll_timeout.is_zero() {
                errors.push(format!("{} poll_timeout must be greater than zero", name));
            }
            if consumer.max_poll_records == 0 {
                errors.push(format!("{} max_poll_records must be at least 1", name));
            }
        }

        for (i, (name, consumer)) in consumers.iter().enumerate() {
            if let Some((other, _)) = consumers[..i]
                .iter()
                .find(|(_, c)| !c.group_id.is_empty() && c.group_id == consumer.group_id)
            {
                errors.push(format!(
                    "{} and {} group_id must differ (both '{}')",
                    other, name, consumer.group_id
                ));
            }
        }

        if self.producer.message_timeout.is_zero() {
            errors.push("producer message_timeout must be greater than zero".to_string());
        }

        if self.flush_timeout.is_zero() {
            errors.push("flush_timeout must be greater than zero".to_string());
        }

        if self.control_threads == 0 {
            errors.push("control_threads must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate and panic with every violation listed.
    pub fn validate_or_panic(&self) {
        if let Err(errors) = self.validate() {
            eprintln!("=== Configuration Validation Failed ===");
            for (i, error) in errors.iter().enumerate() {
                eprintln!("  {}. {}", i + 1, error);
            }
            eprintln!("========================================");
            panic!("Invalid configuration - {} error(s) found", errors.len());
        }
    }

    /// Create configuration from environment variables.
    ///
    /// - `BACKPLANE_BOOTSTRAP_SERVERS`: comma separated broker list
    /// - `BACKPLANE_PARTITIONS`: partition count of both topics
    /// - `BACKPLANE_MESSAGES_TOPIC`, `BACKPLANE_SENDER_TOPIC`: topic names
    /// - `PRODUCER_ID_CONTEXT`, `PRODUCER_ACKS`, `PRODUCER_LINGER_MS`,
    ///   `PRODUCER_MESSAGE_TIMEOUT_MS`, `PRODUCER_MAX_RETRIES`
    /// - `CONSUMER_POLL_TIMEOUT_MS`, `CONSUMER_MAX_POLL_RECORDS`
    /// - `RECEIVERS_GROUP_ID`, `STATE_SENDER_GROUP_ID`, `STATE_RECEIVER_GROUP_ID`
    /// - `FLUSH_TIMEOUT_MS`, `HEALTH_PORT`, `CONTROL_THREADS`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reading from any key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let bootstrap_servers = match lookup("BACKPLANE_BOOTSTRAP_SERVERS") {
            Some(list) => list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => defaults.bootstrap_servers,
        };

        let partition_count = parse_or(&lookup, "BACKPLANE_PARTITIONS", defaults.partition_count)?;

        let topics = TopicConfig {
            messages: lookup("BACKPLANE_MESSAGES_TOPIC").unwrap_or(defaults.topics.messages),
            sender: lookup("BACKPLANE_SENDER_TOPIC").unwrap_or(defaults.topics.sender),
        };

        let acks = match lookup("PRODUCER_ACKS") {
            Some(value) => value
                .parse()
                .map_err(|e: String| Error::Config(format!("Invalid PRODUCER_ACKS: {}", e)))?,
            None => defaults.producer.acks,
        };

        let producer = ProducerOptions {
            id_context: lookup("PRODUCER_ID_CONTEXT").unwrap_or(defaults.producer.id_context),
            acks,
            linger: parse_millis_or(&lookup, "PRODUCER_LINGER_MS", defaults.producer.linger)?,
            message_timeout: parse_millis_or(
                &lookup,
                "PRODUCER_MESSAGE_TIMEOUT_MS",
                defaults.producer.message_timeout,
            )?,
            max_send_retries: parse_or(
                &lookup,
                "PRODUCER_MAX_RETRIES",
                defaults.producer.max_send_retries,
            )?,
        };

        let poll_timeout = parse_millis_or(
            &lookup,
            "CONSUMER_POLL_TIMEOUT_MS",
            defaults.receivers.poll_timeout,
        )?;
        let max_poll_records = parse_or(
            &lookup,
            "CONSUMER_MAX_POLL_RECORDS",
            defaults.receivers.max_poll_records,
        )?;

        let receivers = ConsumerOptions {
            group_id: lookup("RECEIVERS_GROUP_ID").unwrap_or(defaults.receivers.group_id),
            poll_timeout,
            max_poll_records,
        };
        let state_sender = ConsumerOptions {
            group_id: lookup("STATE_SENDER_GROUP_ID").unwrap_or(defaults.state_sender.group_id),
            poll_timeout,
            max_poll_records,
        };
        let state_receiver = ConsumerOptions {
            group_id: lookup("STATE_RECEIVER_GROUP_ID").unwrap_or(defaults.state_receiver.group_id),
            poll_timeout,
            max_poll_records,
        };

        Ok(Self {
            bootstrap_servers,
            partition_count,
            topics,
            producer,
            receivers,
            state_sender,
            state_receiver,
            flush_timeout: parse_millis_or(&lookup, "FLUSH_TIMEOUT_MS", defaults.flush_timeout)?,
            health_port: parse_or(&lookup, "HEALTH_PORT", defaults.health_port)?,
            control_threads: parse_or(&lookup, "CONTROL_THREADS", defaults.control_threads)?,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("Invalid {}: {}", key, e))),
        None => Ok(default),
    }
}

fn parse_millis_or<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let millis: u64 = parse_or(lookup, key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(BackplaneConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_partitions_fails() {
        let config = BackplaneConfig {
            partition_count: 0,
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("partition_count")));
    }

    #[test]
    fn test_same_topic_names_fail() {
        let mut config = BackplaneConfig::default();
        config.topics.sender = config.topics.messages.clone();
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("must differ")));
    }

    #[test]
    fn test_multiple_errors_collected() {
        let mut config = BackplaneConfig {
            bootstrap_servers: vec![],
            partition_count: 0,
            flush_timeout: Duration::ZERO,
            ..Default::default()
        };
        config.state_sender.group_id.clear();
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn test_shared_group_ids_fail() {
        let mut config = BackplaneConfig::default();
        config.state_receiver.group_id = config.state_sender.group_id.clone();
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1, "{errors:?}");
        assert!(errors[0].contains("state_sender and state_receiver group_id must differ"));

        config.state_receiver.group_id = config.receivers.group_id.clone();
        let errors = config.validate().unwrap_err();
        assert!(errors[0].contains("receivers and state_receiver"));
    }

    #[test]
    #[should_panic(expected = "Invalid configuration")]
    fn test_validate_or_panic_with_invalid_config() {
        let config = BackplaneConfig {
            partition_count: 0,
            ..Default::default()
        };
        config.validate_or_panic();
    }

    #[test]
    fn test_acks_parse() {
        assert_eq!("all".parse::<Acks>().unwrap(), Acks::All);
        assert_eq!("LEADER".parse::<Acks>().unwrap(), Acks::Leader);
        assert_eq!("0".parse::<Acks>().unwrap(), Acks::None);
        assert!("most".parse::<Acks>().is_err());
    }

    #[test]
    fn test_acks_client_values() {
        assert_eq!(Acks::All.as_client_value(), "all");
        assert_eq!(Acks::Leader.as_client_value(), "1");
        assert_eq!(Acks::None.as_client_value(), "0");
    }

    #[test]
    fn test_bootstrap_servers_joined() {
        let config = BackplaneConfig {
            bootstrap_servers: vec!["a:9092".into(), "b:9092".into()],
            ..Default::default()
        };
        assert_eq!(config.bootstrap_servers_joined(), "a:9092,b:9092");
    }
}
