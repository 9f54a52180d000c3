//! Typed Kafka consumer with per-topic handler dispatch
//!
//! This module provides:
//! - A dispatch registry mapping topics to message and handler types
//! - A consume loop with manual offset commits (at-least-once)
//! - Retry with backoff and a per-attempt timeout
//! - Dead letter publication for exhausted messages
//! - Optional bounded concurrent dispatch
//! - An idempotency inbox keyed by message id
//!
//! # Example
//!
//! ```no_run
//! use kafka_dispatch::consumer::{ConsumerConfig, GeneralConsumer, Handler, WireConsumer};
//! use async_trait::async_trait;
//! use serde::Deserialize;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Deserialize)]
//! struct OrderMessage {
//!     value: String,
//! }
//!
//! #[derive(Default)]
//! struct OrderHandler;
//!
//! #[async_trait]
//! impl Handler<OrderMessage> for OrderHandler {
//!     async fn handle(&self, message: &OrderMessage, _cancel: &CancellationToken) -> anyhow::Result<()> {
//!         tracing::info!("order {}", message.value);
//!         Ok(())
//!     }
//! }
//!
//! # async fn example<W: WireConsumer>(wire: Arc<W>) -> anyhow::Result<()> {
//! let config = ConsumerConfig::builder()
//!     .brokers("localhost:9092")
//!     .group_id("orders-service")
//!     .for_message::<OrderMessage>()
//!     .handler::<OrderHandler>()
//!     .topic("orders")
//!     .build()?;
//!
//! // `wire` is a `KafkaWireConsumer` with the `kafka` feature
//! let consumer = GeneralConsumer::new(config, wire, None);
//! consumer.start_consume(&CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod backpressure;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod error;
pub mod handler;
pub mod inbox;
pub mod offsets;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod retry;
pub mod state;
pub mod wire;

pub use backpressure::{BackpressurePermit, ConcurrencyGovernor, DEFAULT_MAX_IN_FLIGHT};
pub use config::{
    ConsumerConfig, ConsumerConfigBuilder, ConsumerSettings, DispatchMode, MessageConfigBuilder,
};
pub use consumer::GeneralConsumer;
pub use dlq::{DeadLetterDisposition, DeadLetterEnvelope, DlqProducer};
pub use error::{ConsumerError, ConsumerResult};
pub use handler::{Handler, TopicRoute};
pub use inbox::{Inbox, InboxAcquire, InboxRecord, InboxStatus, MemoryInbox, NoOpInbox};
pub use offsets::OffsetTracker;
#[cfg(feature = "kafka")]
pub use kafka::{KafkaWireConsumer, KafkaWireProducer};
pub use retry::{BackoffStrategy, ProcessingOutcome, RetryExecutor, RetryPolicy};
pub use state::{ConsumerStats, LoopState, LoopStatus, StatsSnapshot};
pub use wire::{RawMessage, WireConsumer, WireProducer, MESSAGE_ID_HEADER, REFID_HEADER};
