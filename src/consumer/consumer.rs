//! The consume loop
//!
//! One task polls the wire strictly sequentially. Each record is routed by
//! topic, decoded into its registered message type, handed to a fresh handler
//! instance under the retry policy and then settled: committed after success,
//! dead-lettered and committed after exhaustion, or left uncommitted when the
//! loop is cancelled mid-flight.
//!
//! In concurrent mode messages settle out of order. Offsets then go through
//! an [`OffsetTracker`] so a partition is only committed up to its oldest
//! message still in flight.

use crate::consumer::{
    backpressure::ConcurrencyGovernor,
    config::{ConsumerConfig, DispatchMode},
    dlq::{DeadLetterDisposition, DlqProducer},
    error::{ConsumerError, ConsumerResult},
    handler::TopicRoute,
    inbox::InboxAcquire,
    offsets::OffsetTracker,
    retry::{ProcessingOutcome, RetryExecutor},
    state::{ConsumerStats, LoopState, LoopStatus, StatsSnapshot},
    wire::{RawMessage, WireConsumer, WireProducer},
};

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// How a single message left the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    /// Done with, the offset may be committed
    Settled,
    /// Cancelled mid-flight, offset left for redelivery
    Cancelled,
}

/// Result of one poll
enum Poll {
    Message(RawMessage),
    Retry,
    Stop(ConsumerResult<()>),
}

/// Generic consumer dispatching records to registered handlers
pub struct GeneralConsumer<W: WireConsumer> {
    shared: Arc<Shared<W>>,
}

struct Shared<W> {
    config: ConsumerConfig,
    wire: Arc<W>,
    dlq: DlqProducer,
    executor: RetryExecutor,
    status: LoopStatus,
    stats: Arc<ConsumerStats>,
    offsets: Mutex<OffsetTracker>,
    sequential: bool,
}

impl<W: WireConsumer> GeneralConsumer<W> {
    /// Create a consumer over `wire`.
    ///
    /// `producer` publishes poison messages when the config names a dead letter
    /// topic. Without either one exhausted messages are dropped after logging.
    pub fn new(
        config: ConsumerConfig,
        wire: Arc<W>,
        producer: Option<Arc<dyn WireProducer>>,
    ) -> Self {
        let dlq = match (&config.dead_letter_topic, producer) {
            (Some(topic), Some(producer)) => {
                info!("Created DLQ producer for topic: {}", topic);
                DlqProducer::new(producer, topic.clone())
            }
            (Some(topic), None) => {
                warn!("Dead letter topic {} configured but no producer supplied", topic);
                DlqProducer::disabled()
            }
            (None, _) => DlqProducer::disabled(),
        };

        let executor = RetryExecutor::new(config.retry_policy.clone()).with_timeout(config.timeout);
        let sequential = config.dispatch_mode == DispatchMode::Sequential;

        Self {
            shared: Arc::new(Shared {
                config,
                wire,
                dlq,
                executor,
                status: LoopStatus::new(),
                stats: Arc::new(ConsumerStats::default()),
                offsets: Mutex::new(OffsetTracker::new()),
                sequential,
            }),
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &ConsumerConfig {
        &self.shared.config
    }

    /// Shared handle to the loop state
    pub fn status(&self) -> LoopStatus {
        self.shared.status.clone()
    }

    /// Current counters
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Subscribe and consume until `cancel` fires or the transport fails fatally.
    ///
    /// Returns `Ok(())` on cancellation, which is the only graceful exit. A
    /// fatal transport fault is returned as an error. In concurrent mode all
    /// in-flight messages are awaited before this returns.
    pub async fn start_consume(&self, cancel: &CancellationToken) -> ConsumerResult<()> {
        let topics = self.shared.config.topics();
        if let Err(e) = self.shared.wire.subscribe(&topics).await {
            error!("Failed to subscribe to {:?}: {}", topics, e);
            self.shared.status.set(LoopState::Stopped);
            return Err(e);
        }
        info!("Subscribed to topics: {:?}", topics);

        let result = match self.shared.config.dispatch_mode {
            DispatchMode::Sequential => self.run_sequential(cancel).await,
            DispatchMode::Concurrent { max_in_flight } => {
                info!("Dispatching up to {} messages concurrently", max_in_flight);
                self.run_concurrent(cancel, ConcurrencyGovernor::new(max_in_flight))
                    .await
            }
        };

        self.shared.status.set(LoopState::Stopped);
        info!("Consumer stopped: {:?}", self.shared.stats.snapshot());
        result
    }

    async fn run_sequential(&self, cancel: &CancellationToken) -> ConsumerResult<()> {
        loop {
            let message = match self.shared.poll(cancel).await {
                Poll::Message(message) => message,
                Poll::Retry => continue,
                Poll::Stop(result) => return result,
            };

            match self.shared.process(&message, cancel).await {
                Settlement::Settled => self.shared.commit(&message).await,
                Settlement::Cancelled => return Ok(()),
            }
        }
    }

    async fn run_concurrent(
        &self,
        cancel: &CancellationToken,
        governor: ConcurrencyGovernor,
    ) -> ConsumerResult<()> {
        let mut tasks = JoinSet::new();

        let result = loop {
            while let Some(joined) = tasks.try_join_next() {
                log_join(joined);
            }

            // Polling waits for a free slot
            let permit = match governor.acquire(cancel).await {
                Ok(permit) => permit,
                Err(ConsumerError::Cancelled) => break Ok(()),
                Err(e) => break Err(e),
            };

            let message = match self.shared.poll(cancel).await {
                Poll::Message(message) => message,
                Poll::Retry => continue,
                Poll::Stop(result) => break result,
            };

            self.shared.offsets.lock().await.track(
                &message.topic,
                message.partition,
                message.offset,
            );

            let shared = Arc::clone(&self.shared);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let settlement = shared.process(&message, &cancel).await;
                if settlement == Settlement::Settled {
                    shared.commit_in_order(&message).await;
                }
                settlement
            });
        };

        if !tasks.is_empty() {
            info!("Waiting for {} in-flight messages", tasks.len());
        }
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }

        result
    }
}

fn log_join(joined: Result<Settlement, tokio::task::JoinError>) {
    match joined {
        Ok(Settlement::Settled) => {}
        Ok(Settlement::Cancelled) => debug!("In-flight message cancelled"),
        Err(e) => error!("Message task failed, its partition stays uncommitted: {}", e),
    }
}

impl<W: WireConsumer> Shared<W> {
    async fn poll(&self, cancel: &CancellationToken) -> Poll {
        if cancel.is_cancelled() {
            info!("Consumer cancelled, stopping");
            return Poll::Stop(Ok(()));
        }

        self.status.set(LoopState::Polling);
        match self.wire.consume(cancel).await {
            Ok(message) => Poll::Message(message),
            Err(ConsumerError::Cancelled) => {
                info!("Consumer cancelled, stopping");
                Poll::Stop(Ok(()))
            }
            Err(e) if e.is_fatal() => {
                error!("Fatal transport error, stopping consumer: {}", e);
                Poll::Stop(Err(e))
            }
            Err(e) => {
                self.stats.record_transport_error();
                let backoff = self.config.poll_error_backoff;
                warn!("Error while polling, retrying in {:?}: {}", backoff, e);

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Poll::Stop(Ok(())),
                    _ = tokio::time::sleep(backoff) => Poll::Retry,
                }
            }
        }
    }

    /// Per-message states are only meaningful when one message is in flight
    fn enter(&self, state: LoopState) {
        if self.sequential {
            self.status.set(state);
        }
    }

    async fn process(&self, message: &RawMessage, cancel: &CancellationToken) -> Settlement {
        self.stats.record_received();

        let Some(route) = self.config.route(&message.topic) else {
            error!(
                topic = %message.topic,
                "No handler registered for topic {}, skipping offset {}",
                message.topic,
                message.offset
            );
            self.stats.record_unroutable();
            return Settlement::Settled;
        };

        let correlation_id = message.correlation_id();
        let message_id = message.message_id();
        let span = info_span!(
            "message",
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            message_type = route.message_type(),
            refid = %correlation_id,
            message_id = message_id.as_deref().unwrap_or_default(),
        );

        self.dispatch(route, message, &correlation_id, message_id.as_deref(), cancel)
            .instrument(span)
            .await
    }

    async fn dispatch(
        &self,
        route: &TopicRoute,
        message: &RawMessage,
        correlation_id: &str,
        message_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Settlement {
        if let Some(id) = message_id {
            match self.config.inbox.try_acquire(id).await {
                Ok(InboxAcquire::Acquired) => {}
                Ok(skip) => {
                    info!("Skipping message {} ({:?})", id, skip);
                    self.stats.record_duplicate();
                    return Settlement::Settled;
                }
                Err(e) => warn!("Inbox lookup for {} failed, processing anyway: {}", id, e),
            }
        }

        self.enter(LoopState::Dispatching);
        debug!("Dispatching to {}", route.handler_type());

        let outcome = match route.prepare(&message.payload) {
            Ok(invocation) => {
                self.executor
                    .execute(cancel, || invocation.invoke(cancel))
                    .await
            }
            Err(e) => {
                error!("Could not decode payload: {}", e);
                ProcessingOutcome::Failed {
                    error: anyhow::Error::new(e),
                    attempts: 1,
                }
            }
        };

        match outcome {
            ProcessingOutcome::Success { attempts } => {
                self.stats.record_success(attempts);
                if let Some(id) = message_id {
                    if let Err(e) = self.config.inbox.mark_processed(id).await {
                        warn!("Failed to mark {} processed: {}", id, e);
                    }
                }
                info!(
                    "Successfully finished processing of message type {}",
                    route.message_type()
                );
                Settlement::Settled
            }
            ProcessingOutcome::Cancelled => {
                info!("Processing cancelled, offset {} left uncommitted", message.offset);
                if let Some(id) = message_id {
                    if let Err(e) = self.config.inbox.mark_failed(id, "cancelled").await {
                        warn!("Failed to release inbox record {}: {}", id, e);
                    }
                }
                Settlement::Cancelled
            }
            exhausted => {
                let reason = exhausted.failure_reason().unwrap_or_default();
                let attempts = exhausted.attempts();
                error!(
                    "Error while processing message type {} after {} attempts: {}",
                    route.message_type(),
                    attempts,
                    reason
                );

                self.enter(LoopState::DeadLettering);
                let disposition = self
                    .dlq
                    .send_to_dead_letter(
                        &message.topic,
                        &message.payload,
                        correlation_id,
                        message_id,
                        &reason,
                    )
                    .await;

                match disposition {
                    DeadLetterDisposition::Published => self.stats.record_dead_lettered(attempts),
                    DeadLetterDisposition::Dropped | DeadLetterDisposition::Lost => {
                        self.stats.record_dropped(attempts)
                    }
                }

                if let Some(id) = message_id {
                    if let Err(e) = self.config.inbox.mark_failed(id, &reason).await {
                        warn!("Failed to mark {} failed: {}", id, e);
                    }
                }

                Settlement::Settled
            }
        }
    }

    /// Commit the partition up to the oldest offset still in flight
    async fn commit_in_order(&self, message: &RawMessage) {
        // Held across the commit so watermarks reach the wire in order
        let mut offsets = self.offsets.lock().await;
        match offsets.settle(&message.topic, message.partition, message.offset) {
            Some(watermark) => {
                let mark = RawMessage::new(
                    message.topic.clone(),
                    message.partition,
                    watermark,
                    Vec::new(),
                );
                self.commit(&mark).await;
            }
            None => debug!(
                "Offset {} on {}[{}] waits for earlier messages",
                message.offset, message.topic, message.partition
            ),
        }
    }

    async fn commit(&self, message: &RawMessage) {
        self.enter(LoopState::Committing);
        match self.wire.commit(message).await {
            Ok(()) => {
                self.stats.record_committed();
                debug!(
                    "Committed {}[{}]@{}",
                    message.topic, message.partition, message.offset
                );
            }
            Err(e) => error!(
                "Failed to commit {}[{}]@{}: {}",
                message.topic, message.partition, message.offset, e
            ),
        }
    }
}

impl<W: WireConsumer> std::fmt::Debug for GeneralConsumer<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneralConsumer")
            .field("config", &self.shared.config)
            .field("dlq", &self.shared.dlq)
            .field("status", &self.shared.status.get())
            .finish()
    }
}
