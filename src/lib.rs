//! Typed Kafka message dispatch
//!
//! This library maps Kafka topics to strongly typed messages and their
//! handlers, consumes with manual offset commits for at-least-once delivery,
//! retries failed handlers with backoff and a per-attempt timeout, and routes
//! exhausted messages to a dead letter topic.
//!
//! # Example
//!
//! ```no_run
//! use kafka_dispatch::consumer::{ConsumerConfig, Handler};
//! use async_trait::async_trait;
//! use serde::Deserialize;
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Deserialize)]
//! struct UserCreated {
//!     id: u64,
//! }
//!
//! #[derive(Default)]
//! struct UserCreatedHandler;
//!
//! #[async_trait]
//! impl Handler<UserCreated> for UserCreatedHandler {
//!     async fn handle(&self, message: &UserCreated, _cancel: &CancellationToken) -> anyhow::Result<()> {
//!         tracing::info!("user {} created", message.id);
//!         Ok(())
//!     }
//! }
//!
//! # fn example() -> anyhow::Result<()> {
//! let config = ConsumerConfig::builder()
//!     .brokers("localhost:9092")
//!     .group_id("users")
//!     .dead_letter_topic("users-dlq")
//!     .instant_retries(2)
//!     .for_message::<UserCreated>()
//!     .handler::<UserCreatedHandler>()
//!     .topic("user-created")
//!     .build()?;
//! # let _ = config;
//! # Ok(())
//! # }
//! ```
//!
//! With the `kafka` feature, `KafkaWireConsumer` and `KafkaWireProducer`
//! connect the consumer to a real cluster.

#![warn(missing_docs)]

pub mod consumer;
pub mod producer;

pub use consumer::{
    ConsumerConfig, ConsumerError, ConsumerResult, ConsumerSettings, GeneralConsumer, Handler,
    RetryPolicy,
};
pub use producer::{MessageProducer, ProducerConfig};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize tracing for the library
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}
