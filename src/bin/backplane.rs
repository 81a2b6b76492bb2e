//! Backplane instance.
//!
//! Runs the receivers loop and both state loops on dedicated threads, plus
//! the health surface on the control runtime, until Ctrl-C.
//!
//! ## Running
//!
//! With the in-process broker (single instance, nothing external needed):
//! ```bash
//! cargo run --bin backplane
//! ```
//!
//! Against Kafka:
//! ```bash
//! BACKPLANE_BOOTSTRAP_SERVERS=localhost:9092 BACKPLANE_PARTITIONS=12 \
//!     cargo run --features kafka --bin backplane
//! ```
//!
//! With JSON logging:
//! ```bash
//! LOG_FORMAT=json RUST_LOG=info cargo run --bin backplane
//! ```
//!
//! ## Health Endpoints
//!
//! Exposed on `HEALTH_PORT` (default 8080, 0 disables):
//! - `GET /health` - Process is up
//! - `GET /live` - 503 once a consume loop has died
//! - `GET /ready` - 503 while any loop is starting or rebalancing
//! - `GET /metrics` - Prometheus metrics

use std::sync::Arc;

use chat_backplane::backplane::{
    ChatStateStore, ConsumeLoop, EnvelopeConsumer, EnvelopeProcessor, InstanceIds,
    MemoryChatStateStore, PartitionChangeHandler, ReceiversProcessor, SendersRouter,
    SessionRegistry, StateProcessor, StateSource, TopicPartitionCache, log_delivery_failures,
};
use chat_backplane::config::{BackplaneConfig, ConsumerOptions};
use chat_backplane::error::Result;
use chat_backplane::metrics;
use chat_backplane::runtime::{BackplaneRuntime, RuntimeConfig};
use chat_backplane::server::HealthServer;
use chat_backplane::telemetry::{LogFormat, init_logging};
use tracing::{info, warn};

/// Creates one group consumer per loop.
trait ConsumerFactory {
    type Consumer: EnvelopeConsumer + 'static;

    fn create(&self, options: &ConsumerOptions, id: String) -> Result<Self::Consumer>;
}

#[cfg(not(feature = "kafka"))]
mod backend {
    use std::sync::Arc;

    use chat_backplane::backplane::{DeliveryCallback, EnvelopeProducer, MemoryBroker, MemoryConsumer};
    use chat_backplane::config::{BackplaneConfig, ConsumerOptions};
    use chat_backplane::error::Result;
    use tracing::info;

    use super::ConsumerFactory;

    pub struct Backend {
        broker: Arc<MemoryBroker>,
    }

    impl Backend {
        pub fn connect(config: &BackplaneConfig) -> Result<Self> {
            let broker = MemoryBroker::new();
            broker.create_topic(&config.topics.messages, config.partition_count);
            broker.create_topic(&config.topics.sender, config.partition_count);
            info!(
                partitions = config.partition_count,
                "Using in-process broker; build with --features kafka for a real one"
            );
            Ok(Self { broker })
        }

        pub fn producer(
            &self,
            _config: &BackplaneConfig,
            id: String,
            on_delivery: DeliveryCallback,
        ) -> Result<Arc<dyn EnvelopeProducer>> {
            Ok(Arc::new(self.broker.producer(id, on_delivery)))
        }
    }

    impl ConsumerFactory for Backend {
        type Consumer = MemoryConsumer;

        fn create(&self, options: &ConsumerOptions, id: String) -> Result<MemoryConsumer> {
            Ok(self.broker.consumer(id, options))
        }
    }
}

#[cfg(feature = "kafka")]
mod backend {
    use std::sync::Arc;

    use chat_backplane::backplane::kafka::{KafkaConsumer, KafkaProducer};
    use chat_backplane::backplane::{DeliveryCallback, EnvelopeProducer};
    use chat_backplane::config::{BackplaneConfig, ConsumerOptions};
    use chat_backplane::error::Result;
    use tracing::info;

    use super::ConsumerFactory;

    pub struct Backend {
        config: BackplaneConfig,
    }

    impl Backend {
        pub fn connect(config: &BackplaneConfig) -> Result<Self> {
            info!(bootstrap_servers = %config.bootstrap_servers_joined(), "Using Kafka broker");
            Ok(Self {
                config: config.clone(),
            })
        }

        pub fn producer(
            &self,
            config: &BackplaneConfig,
            id: String,
            on_delivery: DeliveryCallback,
        ) -> Result<Arc<dyn EnvelopeProducer>> {
            Ok(Arc::new(KafkaProducer::new(config, id, on_delivery)?))
        }
    }

    impl ConsumerFactory for Backend {
        type Consumer = KafkaConsumer;

        fn create(&self, options: &ConsumerOptions, id: String) -> Result<KafkaConsumer> {
            KafkaConsumer::new(&self.config, options, id)
        }
    }
}

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    init_logging(LogFormat::from_env()).map_err(|e| -> Box<dyn std::error::Error> { e })?;

    let config = BackplaneConfig::from_env()?;
    config.validate_or_panic();
    metrics::init_metrics();

    info!(
        bootstrap_servers = %config.bootstrap_servers_joined(),
        partitions = config.partition_count,
        messages_topic = %config.topics.messages,
        sender_topic = %config.topics.sender,
        health_port = config.health_port,
        "Starting chat backplane"
    );

    let mut runtime = BackplaneRuntime::new(RuntimeConfig {
        control_threads: config.control_threads,
        ..Default::default()
    })?;

    let backend = backend::Backend::connect(&config)?;
    let ids = InstanceIds::new();
    let cache = Arc::new(TopicPartitionCache::new());

    let producer = backend.producer(
        &config,
        ids.next_producer_id(&config.producer.id_context),
        log_delivery_failures(),
    )?;
    let router = Arc::new(SendersRouter::new(
        Arc::clone(&producer),
        Arc::clone(&cache),
        config.topics.clone(),
        config.partition_count,
    ));

    let sessions = Arc::new(SessionRegistry::new());
    let store: Arc<dyn ChatStateStore> = Arc::new(MemoryChatStateStore::new());

    let loops = [
        LoopPlan {
            kind: "receivers",
            topic: config.topics.messages.clone(),
            options: config.receivers.clone(),
            processor: Box::new(ReceiversProcessor::new(sessions, Arc::clone(&router))),
        },
        LoopPlan {
            kind: StateSource::SenderTopic.as_str(),
            topic: config.topics.sender.clone(),
            options: config.state_sender.clone(),
            processor: Box::new(StateProcessor::new(StateSource::SenderTopic, Arc::clone(&store))),
        },
        LoopPlan {
            kind: StateSource::MessagesTopic.as_str(),
            topic: config.topics.messages.clone(),
            options: config.state_receiver.clone(),
            processor: Box::new(StateProcessor::new(StateSource::MessagesTopic, store)),
        },
    ];
    for plan in loops {
        start_loop(&mut runtime, &backend, &ids, &cache, plan)?;
    }

    let cancel = runtime.cancel_token();
    let health = runtime.health();
    let health_port = config.health_port;
    runtime.block_on_control(async move {
        if health_port > 0 {
            let addr = format!("0.0.0.0:{}", health_port);
            match HealthServer::new(&addr, health).await {
                Ok(server) => {
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.run(cancel).await {
                            warn!(error = %e, "Health server stopped");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Failed to start health server - continuing without it"),
            }
        } else {
            info!("Health server disabled (HEALTH_PORT=0)");
        }

        info!("Backplane running; press Ctrl-C to stop");
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                }
            }
            _ = cancel.cancelled() => {}
        }
    });

    runtime.shutdown(producer.as_ref(), config.flush_timeout);
    Ok(())
}

struct LoopPlan {
    kind: &'static str,
    topic: String,
    options: ConsumerOptions,
    processor: Box<dyn EnvelopeProcessor>,
}

/// Create the loop's consumer and hand it to a new dedicated thread, which
/// subscribes it and owns it from then on.
fn start_loop<F: ConsumerFactory>(
    runtime: &mut BackplaneRuntime,
    factory: &F,
    ids: &InstanceIds,
    cache: &Arc<TopicPartitionCache>,
    plan: LoopPlan,
) -> Result<()> {
    let consumer_id = ids.next_consumer_id(plan.kind);
    let consumer = factory.create(&plan.options, consumer_id.clone())?;
    let health = runtime.register_loop(plan.kind);
    let partitions = Arc::new(PartitionChangeHandler::new(
        consumer_id.clone(),
        Arc::clone(cache),
        Arc::clone(&health),
    ));

    info!(
        loop_name = plan.kind,
        consumer_id = %consumer_id,
        group_id = %plan.options.group_id,
        topic = %plan.topic,
        "Starting consume loop"
    );

    let poll_timeout = plan.options.poll_timeout;
    runtime.spawn_registered(health, move |cancel| {
        ConsumeLoop::new(
            consumer,
            &[plan.topic.as_str()],
            plan.processor,
            partitions,
            poll_timeout,
            cancel,
        )?
        .run()
    })
}
