//! Dead Letter Queue (DLQ) handling for failed messages

use crate::consumer::error::{ConsumerError, ConsumerResult};
use crate::consumer::wire::{WireProducer, MESSAGE_ID_HEADER, REFID_HEADER};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Header carrying the failure reason
pub const DLQ_ERROR_HEADER: &str = "dlq.error.message";
/// Header carrying the topic the message was consumed from
pub const DLQ_ORIGINAL_TOPIC_HEADER: &str = "dlq.original.topic";

/// Everything published for one poison message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterEnvelope {
    /// Fresh unique record key
    pub key: String,
    /// Original serialized payload, untouched
    pub payload: Vec<u8>,
    /// Correlation id of the original message, empty when absent
    pub correlation_id: String,
    /// Message id of the original message
    pub message_id: Option<String>,
    /// Why processing gave up
    pub failure_reason: String,
    /// Topic the message was consumed from
    pub original_topic: String,
}

impl DeadLetterEnvelope {
    /// Build an envelope with a freshly generated key
    pub fn new(
        original_topic: &str,
        payload: &[u8],
        correlation_id: &str,
        message_id: Option<&str>,
        failure_reason: &str,
    ) -> Self {
        Self {
            key: Uuid::new_v4().to_string(),
            payload: payload.to_vec(),
            correlation_id: correlation_id.to_string(),
            message_id: message_id.map(str::to_string),
            failure_reason: failure_reason.to_string(),
            original_topic: original_topic.to_string(),
        }
    }

    /// Record headers; correlation and message id only when available
    pub fn headers(&self) -> Vec<(String, Vec<u8>)> {
        let mut headers = Vec::with_capacity(4);
        if !self.correlation_id.is_empty() {
            headers.push((REFID_HEADER.to_string(), self.correlation_id.as_bytes().to_vec()));
        }
        if let Some(message_id) = &self.message_id {
            headers.push((MESSAGE_ID_HEADER.to_string(), message_id.as_bytes().to_vec()));
        }
        headers.push((DLQ_ERROR_HEADER.to_string(), self.failure_reason.as_bytes().to_vec()));
        headers.push((
            DLQ_ORIGINAL_TOPIC_HEADER.to_string(),
            self.original_topic.as_bytes().to_vec(),
        ));
        headers
    }
}

/// What happened to a message handed to the dead-letter producer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterDisposition {
    /// Published to the dead-letter topic
    Published,
    /// No dead-letter topic configured
    Dropped,
    /// Publication failed and was logged
    Lost,
}

/// DLQ producer for handling failed messages
#[derive(Clone)]
pub struct DlqProducer {
    producer: Option<Arc<dyn WireProducer>>,
    topic: Option<String>,
}

impl DlqProducer {
    /// Create a DLQ producer publishing to `topic`
    pub fn new(producer: Arc<dyn WireProducer>, topic: impl Into<String>) -> Self {
        Self {
            producer: Some(producer),
            topic: Some(topic.into()),
        }
    }

    /// A producer that drops everything
    pub fn disabled() -> Self {
        warn!("No dead-letter topic configured, exhausted messages will be dropped after logging");
        Self {
            producer: None,
            topic: None,
        }
    }

    /// Configured topic, if any
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    /// Send a poison message to the DLQ.
    ///
    /// Never fails: a missing topic drops the message, a publication error is logged.
    pub async fn send_to_dead_letter(
        &self,
        original_topic: &str,
        payload: &[u8],
        correlation_id: &str,
        message_id: Option<&str>,
        failure_reason: &str,
    ) -> DeadLetterDisposition {
        let (producer, topic) = match (&self.producer, &self.topic) {
            (Some(producer), Some(topic)) => (producer, topic),
            _ => {
                warn!(
                    topic = original_topic,
                    refid = correlation_id,
                    "Dropping message without dead-lettering: {}",
                    failure_reason
                );
                return DeadLetterDisposition::Dropped;
            }
        };

        let envelope = DeadLetterEnvelope::new(
            original_topic,
            payload,
            correlation_id,
            message_id,
            failure_reason,
        );

        match self.publish(producer.as_ref(), topic, &envelope).await {
            Ok(()) => {
                debug!(
                    "Message from {} sent to DLQ topic {} with key {}",
                    original_topic, topic, envelope.key
                );
                DeadLetterDisposition::Published
            }
            Err(e) => {
                error!(
                    topic = original_topic,
                    refid = correlation_id,
                    "Failed to send message to {}: {}",
                    topic,
                    e
                );
                DeadLetterDisposition::Lost
            }
        }
    }

    async fn publish(
        &self,
        producer: &dyn WireProducer,
        topic: &str,
        envelope: &DeadLetterEnvelope,
    ) -> ConsumerResult<()> {
        producer
            .produce(topic, &envelope.key, &envelope.payload, &envelope.headers())
            .await
            .map_err(|e| ConsumerError::DeadLetter(format!("key {}: {}", envelope.key, e)))
    }
}

impl std::fmt::Debug for DlqProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DlqProducer").field("topic", &self.topic).finish()
    }
}
