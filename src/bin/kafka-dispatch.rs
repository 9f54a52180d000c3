//! Command-line host for kafka-dispatch
//!
//! Consumes the configured topics as raw JSON and logs every message. Mostly
//! useful to check broker connectivity, dead-lettering and retry settings
//! before wiring real handlers.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use kafka_dispatch::consumer::{
    ConsumerConfig, ConsumerSettings, DispatchMode, GeneralConsumer, Handler, KafkaWireConsumer,
    KafkaWireProducer, MemoryInbox, WireProducer,
};
use kafka_dispatch::init_tracing;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Consume Kafka topics and dispatch JSON messages
#[derive(Parser, Debug)]
#[command(name = "kafka-dispatch")]
#[command(version = kafka_dispatch::VERSION)]
#[command(about = "Consume Kafka topics and dispatch JSON messages", long_about = None)]
struct Cli {
    /// YAML settings file
    #[arg(short, long, value_name = "FILE", env = "KAFKA_DISPATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Kafka brokers (comma-separated), overrides the settings file
    #[arg(short, long, env = "KAFKA_BROKERS")]
    brokers: Option<String>,

    /// Consumer group ID
    #[arg(short, long, env = "KAFKA_GROUP_ID")]
    group_id: Option<String>,

    /// Topics to consume, in addition to those in the settings file
    #[arg(short, long, num_args = 1..)]
    topics: Vec<String>,

    /// Dead letter topic
    #[arg(long, env = "KAFKA_DLQ_TOPIC")]
    dlq_topic: Option<String>,

    /// Immediate retries per message
    #[arg(long)]
    retries: Option<u32>,

    /// Per-attempt handler timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Process up to N messages concurrently (unordered)
    #[arg(long)]
    concurrency: Option<usize>,

    /// Process messages concurrently with the default bound
    #[arg(long, conflicts_with = "concurrency")]
    concurrent: bool,

    /// Skip messages whose message-id was already processed by this process
    #[arg(long)]
    dedupe: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Use JSON output for logs
    #[arg(long)]
    json_logs: bool,
}

/// Logs every message it receives
#[derive(Default)]
struct LoggingHandler;

#[async_trait]
impl Handler<serde_json::Value> for LoggingHandler {
    async fn handle(
        &self,
        message: &serde_json::Value,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        info!(payload = %message, "Received message");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.json_logs {
        init_tracing();
    } else {
        init_custom_tracing(&cli.log_level);
    }

    let mut settings = match &cli.config {
        Some(path) => ConsumerSettings::from_yaml_file(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => ConsumerSettings::default(),
    };
    settings.topics.extend(cli.topics.iter().cloned());
    settings.topics.sort();
    settings.topics.dedup();

    let mut builder = ConsumerConfig::builder().settings(&settings);
    if let Some(brokers) = &cli.brokers {
        builder = builder.brokers(brokers.as_str());
    }
    if let Some(group_id) = &cli.group_id {
        builder = builder.group_id(group_id.as_str());
    }
    if let Some(topic) = &cli.dlq_topic {
        builder = builder.dead_letter_topic(topic.as_str());
    }
    if let Some(retries) = cli.retries {
        builder = builder.instant_retries(retries);
    }
    if let Some(secs) = cli.timeout {
        builder = builder.timeout(Duration::from_secs(secs));
    }
    if let Some(max_in_flight) = cli.concurrency {
        builder = builder.dispatch_mode(DispatchMode::Concurrent { max_in_flight });
    } else if cli.concurrent {
        builder = builder.concurrent_default();
    }
    if cli.dedupe {
        builder = builder.inbox(Arc::new(MemoryInbox::default()));
    }
    for topic in &settings.topics {
        builder = builder
            .for_message::<serde_json::Value>()
            .handler::<LoggingHandler>()
            .topic(topic.as_str());
    }

    let config = builder.build().context("Invalid consumer configuration")?;

    let wire = Arc::new(KafkaWireConsumer::new(&config)?);
    let producer: Option<Arc<dyn WireProducer>> = match &config.dead_letter_topic {
        Some(_) => Some(Arc::new(KafkaWireProducer::new(
            &config.brokers,
            &config.kafka_properties,
        )?)),
        None => None,
    };

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                shutdown.cancel();
            }
            Err(err) => {
                error!("Failed to listen for shutdown signal: {}", err);
            }
        }
    });

    let consumer = GeneralConsumer::new(config, wire, producer);
    info!("Starting consumer for topics: {:?}", settings.topics);
    consumer.start_consume(&cancel).await?;

    let stats = consumer.stats();
    info!(
        received = stats.received,
        committed = stats.committed,
        dead_lettered = stats.dead_lettered,
        "Consumer shut down"
    );
    Ok(())
}

fn init_custom_tracing(level: &str) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
