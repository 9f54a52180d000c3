//! rdkafka-backed wire adapters

use crate::consumer::config::ConsumerConfig;
use crate::consumer::error::{ConsumerError, ConsumerResult};
use crate::consumer::wire::{RawMessage, WireConsumer, WireProducer};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Header, Headers, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Message, Offset, TopicPartitionList};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Client properties callers may override
const ALLOWED_KAFKA_PROPS: &[&str] = &[
    // Compression settings
    "compression.type",
    "compression.level",
    // Fetch settings
    "fetch.min.bytes",
    "fetch.max.wait.ms",
    "fetch.max.bytes",
    "max.partition.fetch.bytes",
    // Request settings
    "request.timeout.ms",
    "metadata.max.age.ms",
    // Consumer settings
    "session.timeout.ms",
    "max.poll.interval.ms",
    "queued.min.messages",
    "queued.max.messages.kbytes",
    "fetch.error.backoff.ms",
    // Connection settings
    "reconnect.backoff.ms",
    "reconnect.backoff.max.ms",
    "socket.keepalive.enable",
    // Security
    "security.protocol",
    "sasl.mechanisms",
    "sasl.username",
    "sasl.password",
    // Monitoring
    "statistics.interval.ms",
];

/// Default delivery timeout for produced records
const PRODUCE_TIMEOUT: Duration = Duration::from_secs(30);

fn apply_properties(
    client_config: &mut ClientConfig,
    properties: &HashMap<String, String>,
) -> ConsumerResult<()> {
    for (key, value) in properties {
        if !ALLOWED_KAFKA_PROPS.contains(&key.as_str()) {
            return Err(ConsumerError::MissingConfiguration(format!(
                "Disallowed Kafka property '{}'. Allowed properties: {:?}",
                key, ALLOWED_KAFKA_PROPS
            )));
        }
        client_config.set(key, value);
    }
    Ok(())
}

/// Map a client error to a fatal or transient transport error
fn classify(error: KafkaError) -> ConsumerError {
    let fatal = matches!(error, KafkaError::MessageConsumptionFatal(_))
        || error.rdkafka_error_code() == Some(RDKafkaErrorCode::Fatal);

    if fatal {
        ConsumerError::TransportFault(error.to_string())
    } else {
        ConsumerError::Transport(error.to_string())
    }
}

fn to_raw(message: &BorrowedMessage<'_>) -> RawMessage {
    let mut raw = RawMessage::new(
        message.topic(),
        message.partition(),
        message.offset(),
        message.payload().unwrap_or_default().to_vec(),
    );
    raw.key = message.key().map(<[u8]>::to_vec);

    if let Some(headers) = message.headers() {
        for header in headers.iter() {
            let value = header.value.map(<[u8]>::to_vec).unwrap_or_default();
            raw.headers.insert(header.key.to_string(), value);
        }
    }
    raw
}

/// Consumer side of the Kafka adapter, committing offsets manually
pub struct KafkaWireConsumer {
    consumer: StreamConsumer,
}

impl KafkaWireConsumer {
    /// Create a consumer from the validated config
    pub fn new(config: &ConsumerConfig) -> ConsumerResult<Self> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("allow.auto.create.topics", "false");
        apply_properties(&mut client_config, &config.kafka_properties)?;

        let consumer: StreamConsumer = client_config
            .create()
            .map_err(|e| ConsumerError::TransportFault(format!("Failed to create consumer: {}", e)))?;

        info!(
            "Created Kafka consumer for group {} on {}",
            config.group_id, config.brokers
        );
        Ok(Self { consumer })
    }
}

#[async_trait]
impl WireConsumer for KafkaWireConsumer {
    async fn subscribe(&self, topics: &[String]) -> ConsumerResult<()> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&topics)
            .map_err(|e| ConsumerError::TransportFault(format!("Failed to subscribe: {}", e)))
    }

    async fn consume(&self, cancel: &CancellationToken) -> ConsumerResult<RawMessage> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConsumerError::Cancelled),
            received = self.consumer.recv() => match received {
                Ok(message) => Ok(to_raw(&message)),
                Err(e) => Err(classify(e)),
            },
        }
    }

    async fn commit(&self, message: &RawMessage) -> ConsumerResult<()> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(
                &message.topic,
                message.partition,
                Offset::Offset(message.offset + 1),
            )
            .map_err(classify)?;

        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(classify)
    }
}

/// Producer side of the Kafka adapter
pub struct KafkaWireProducer {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaWireProducer {
    /// Create a producer for `brokers`
    pub fn new(brokers: &str, properties: &HashMap<String, String>) -> ConsumerResult<Self> {
        if brokers.trim().is_empty() {
            return Err(ConsumerError::MissingConfiguration(
                "The bootstrap servers for producer must be specified".to_string(),
            ));
        }

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", PRODUCE_TIMEOUT.as_millis().to_string());
        apply_properties(&mut client_config, properties)?;

        let producer: FutureProducer = client_config
            .create()
            .map_err(|e| ConsumerError::Produce(format!("Failed to create producer: {}", e)))?;

        Ok(Self {
            producer,
            timeout: PRODUCE_TIMEOUT,
        })
    }

    /// Override the delivery timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl WireProducer for KafkaWireProducer {
    async fn produce(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
        headers: &[(String, Vec<u8>)],
    ) -> ConsumerResult<()> {
        let mut owned = OwnedHeaders::new();
        for (name, value) in headers {
            owned = owned.insert(Header {
                key: name,
                value: Some(value),
            });
        }

        let record = FutureRecord::to(topic)
            .key(key)
            .payload(payload)
            .headers(owned);

        match self.producer.send(record, Timeout::After(self.timeout)).await {
            Ok((partition, offset)) => {
                debug!("Produced to {}[{}]@{}", topic, partition, offset);
                Ok(())
            }
            Err((e, _)) => Err(ConsumerError::Produce(e.to_string())),
        }
    }
}
