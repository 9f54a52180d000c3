//! Typed message producer
//!
//! Messages are routed to topics by their Rust type, serialized as JSON and
//! published with a fresh key and an optional `refid` header.

use crate::consumer::error::{ConsumerError, ConsumerResult};
use crate::consumer::handler::short_type_name;
use crate::consumer::wire::{WireProducer, REFID_HEADER};
use serde::Serialize;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Producer configuration: brokers and the type → topic map
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Kafka broker addresses (comma-separated)
    pub brokers: String,
    topics: HashMap<TypeId, String>,
}

impl ProducerConfig {
    /// Create a new producer config builder
    pub fn builder() -> ProducerConfigBuilder {
        ProducerConfigBuilder::default()
    }

    /// Topic registered for `T`
    pub fn topic_for<T: 'static>(&self) -> Option<&str> {
        self.topics.get(&TypeId::of::<T>()).map(String::as_str)
    }
}

/// Builder for ProducerConfig
#[derive(Debug, Default)]
pub struct ProducerConfigBuilder {
    brokers: String,
    topics: HashMap<TypeId, String>,
}

impl ProducerConfigBuilder {
    /// Set the broker addresses
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = brokers.into();
        self
    }

    /// Route messages of type `T` to `topic`
    pub fn topic_for<T: 'static>(mut self, topic: impl Into<String>) -> Self {
        let topic = topic.into();
        if let Some(previous) = self.topics.insert(TypeId::of::<T>(), topic.clone()) {
            warn!(
                "Message type {} was mapped to {}, now {}",
                short_type_name::<T>(),
                previous,
                topic
            );
        }
        self
    }

    /// Validate and build
    pub fn build(self) -> ConsumerResult<ProducerConfig> {
        if self.brokers.trim().is_empty() {
            return Err(ConsumerError::MissingConfiguration(
                "The bootstrap servers for producer must be specified".to_string(),
            ));
        }

        if let Some(topic) = self.topics.values().find(|t| t.trim().is_empty()) {
            return Err(ConsumerError::MissingConfiguration(format!(
                "Topic name '{}' is blank",
                topic
            )));
        }

        Ok(ProducerConfig {
            brokers: self.brokers,
            topics: self.topics,
        })
    }
}

/// Publishes typed messages through a wire producer
#[derive(Clone)]
pub struct MessageProducer {
    config: Arc<ProducerConfig>,
    wire: Arc<dyn WireProducer>,
}

impl MessageProducer {
    /// Create a producer over `wire`
    pub fn new(config: ProducerConfig, wire: Arc<dyn WireProducer>) -> Self {
        Self {
            config: Arc::new(config),
            wire,
        }
    }

    /// Serialize `message` and publish it to the topic registered for `T`.
    ///
    /// `refid` is attached as the correlation header when present and non-empty.
    pub async fn produce<T>(&self, message: &T, refid: Option<&str>) -> ConsumerResult<()>
    where
        T: Serialize + 'static,
    {
        let type_name = short_type_name::<T>();
        let topic = self
            .config
            .topic_for::<T>()
            .ok_or_else(|| ConsumerError::UnregisteredMessageType(type_name.to_string()))?;

        let payload = serde_json::to_vec(message)
            .map_err(|e| ConsumerError::Produce(format!("Failed to serialize {}: {}", type_name, e)))?;

        let key = Uuid::new_v4().to_string();
        let headers: Vec<(String, Vec<u8>)> = refid
            .filter(|id| !id.is_empty())
            .map(|id| vec![(REFID_HEADER.to_string(), id.as_bytes().to_vec())])
            .unwrap_or_default();

        self.wire.produce(topic, &key, &payload, &headers).await?;
        debug!("Produced {} to {} with key {}", type_name, topic, key);
        Ok(())
    }
}

impl std::fmt::Debug for MessageProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageProducer")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    #[derive(Serialize)]
    struct TestMessage {
        text: String,
    }

    #[derive(Serialize)]
    struct UnmappedMessage;

    type Sent = (String, String, Vec<u8>, Vec<(String, Vec<u8>)>);

    #[derive(Default)]
    struct RecordingProducer {
        sent: Mutex<Vec<Sent>>,
    }

    #[async_trait]
    impl WireProducer for RecordingProducer {
        async fn produce(
            &self,
            topic: &str,
            key: &str,
            payload: &[u8],
            headers: &[(String, Vec<u8>)],
        ) -> ConsumerResult<()> {
            self.sent
                .lock()
                .push((topic.to_string(), key.to_string(), payload.to_vec(), headers.to_vec()));
            Ok(())
        }
    }

    fn producer() -> (MessageProducer, Arc<RecordingProducer>) {
        let wire = Arc::new(RecordingProducer::default());
        let config = ProducerConfig::builder()
            .brokers("localhost:9092")
            .topic_for::<TestMessage>("test-topic")
            .build()
            .unwrap();
        (MessageProducer::new(config, wire.clone()), wire)
    }

    #[tokio::test]
    async fn test_sends_to_mapped_topic() {
        let (producer, wire) = producer();
        producer
            .produce(&TestMessage { text: "Hello".into() }, Some("abc-123"))
            .await
            .unwrap();

        let sent = wire.sent.lock();
        assert_eq!(sent.len(), 1);
        let (topic, key, payload, headers) = &sent[0];
        assert_eq!(topic, "test-topic");
        assert!(!key.is_empty());
        assert!(String::from_utf8_lossy(payload).contains("Hello"));
        assert_eq!(headers, &vec![(REFID_HEADER.to_string(), b"abc-123".to_vec())]);
    }

    #[tokio::test]
    async fn test_non_ascii_is_preserved() {
        let (producer, wire) = producer();
        producer
            .produce(&TestMessage { text: "Привет".into() }, None)
            .await
            .unwrap();

        let sent = wire.sent.lock();
        assert!(String::from_utf8(sent[0].2.clone()).unwrap().contains("Привет"));
        assert!(sent[0].3.is_empty());
    }

    #[tokio::test]
    async fn test_unmapped_type_is_rejected() {
        let (producer, wire) = producer();
        let result = producer.produce(&UnmappedMessage, None).await;

        match result {
            Err(ConsumerError::UnregisteredMessageType(name)) => {
                assert!(name.contains("UnmappedMessage"))
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(wire.sent.lock().is_empty());
    }

    #[test]
    fn test_missing_brokers() {
        let result = ProducerConfig::builder().topic_for::<TestMessage>("t").build();
        assert!(matches!(result, Err(ConsumerError::MissingConfiguration(_))));
    }
}
