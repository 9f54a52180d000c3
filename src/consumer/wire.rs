//! Wire client adapter traits
//!
//! The consume loop and the producers only talk to the broker through these
//! traits. Adapters perform no retries of their own; resilience belongs to the
//! caller.

use crate::consumer::error::ConsumerResult;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// Header carrying the end-to-end correlation id
pub const REFID_HEADER: &str = "refid";

/// Header carrying the producer-assigned message id
pub const MESSAGE_ID_HEADER: &str = "message-id";

/// One record pulled from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Topic the record was read from
    pub topic: String,
    /// Partition the record was read from
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Record key, if any
    pub key: Option<Vec<u8>>,
    /// Opaque payload
    pub payload: Vec<u8>,
    /// Record headers
    pub headers: HashMap<String, Vec<u8>>,
}

impl RawMessage {
    /// Create a message with no key and no headers
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            payload: payload.into(),
            headers: HashMap::new(),
        }
    }

    /// Attach a header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Header value decoded as UTF-8, lossy
    pub fn header_str(&self, key: &str) -> Option<String> {
        self.headers
            .get(key)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    /// Correlation id, empty when absent
    pub fn correlation_id(&self) -> String {
        self.header_str(REFID_HEADER).unwrap_or_default()
    }

    /// Message id, if the producer set one
    pub fn message_id(&self) -> Option<String> {
        self.header_str(MESSAGE_ID_HEADER).filter(|id| !id.is_empty())
    }
}

/// Consumer side of the broker client
#[async_trait]
pub trait WireConsumer: Send + Sync + 'static {
    /// Subscribe to the given topics. Called once before the loop starts.
    async fn subscribe(&self, topics: &[String]) -> ConsumerResult<()>;

    /// Wait for the next record.
    ///
    /// Returns [`ConsumerError::Cancelled`](crate::consumer::ConsumerError::Cancelled)
    /// when `cancel` fires, [`ConsumerError::TransportFault`](crate::consumer::ConsumerError::TransportFault)
    /// on unrecoverable client errors and
    /// [`ConsumerError::Transport`](crate::consumer::ConsumerError::Transport) on transient ones.
    async fn consume(&self, cancel: &CancellationToken) -> ConsumerResult<RawMessage>;

    /// Mark the record's offset as processed
    async fn commit(&self, message: &RawMessage) -> ConsumerResult<()>;
}

/// Producer side of the broker client
#[async_trait]
pub trait WireProducer: Send + Sync + 'static {
    /// Publish one record
    async fn produce(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
        headers: &[(String, Vec<u8>)],
    ) -> ConsumerResult<()>;
}
