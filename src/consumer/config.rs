//! Consumer configuration structures
//!
//! [`ConsumerConfig`] is the dispatch registry: broker settings plus the
//! topic → (message type, handler type) mapping. It is assembled once through
//! [`ConsumerConfigBuilder`], validated in [`ConsumerConfigBuilder::build`] and
//! read-only afterwards.

use crate::consumer::backpressure::DEFAULT_MAX_IN_FLIGHT;
use crate::consumer::error::{ConsumerError, ConsumerResult};
use crate::consumer::handler::{short_type_name, Handler, TopicRoute};
use crate::consumer::inbox::{Inbox, NoOpInbox};
use crate::consumer::retry::{RetryPolicy, DEFAULT_ATTEMPT_TIMEOUT};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// How handler invocations are scheduled relative to polling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum DispatchMode {
    /// Poll, process, commit, poll next. Strict arrival order.
    Sequential,
    /// Up to `max_in_flight` messages processed at once. Ordering across
    /// in-flight messages is not preserved; only for idempotent or
    /// order-insensitive handlers.
    Concurrent {
        /// Bound on concurrently processed messages
        max_in_flight: usize,
    },
}

impl Default for DispatchMode {
    fn default() -> Self {
        DispatchMode::Sequential
    }
}

/// Validated, immutable consumer configuration
#[derive(Clone)]
pub struct ConsumerConfig {
    /// Kafka broker addresses (comma-separated)
    pub brokers: String,

    /// Consumer group ID
    pub group_id: String,

    /// Dead letter topic, if any
    pub dead_letter_topic: Option<String>,

    /// Retry policy applied to each handler invocation
    pub retry_policy: RetryPolicy,

    /// Ceiling for a single handler attempt
    pub timeout: Duration,

    /// Sequential or bounded concurrent dispatch
    pub dispatch_mode: DispatchMode,

    /// Pause before polling again after a transient transport error
    pub poll_error_backoff: Duration,

    /// Idempotency inbox consulted for messages carrying a message id
    pub inbox: Arc<dyn Inbox>,

    /// Additional Kafka properties
    pub kafka_properties: HashMap<String, String>,

    routes: HashMap<String, TopicRoute>,
}

impl ConsumerConfig {
    /// Create a new consumer config builder
    pub fn builder() -> ConsumerConfigBuilder {
        ConsumerConfigBuilder::new()
    }

    /// Route registered for `topic`
    pub fn route(&self, topic: &str) -> Option<&TopicRoute> {
        self.routes.get(topic)
    }

    /// Registered topic names, sorted
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.routes.keys().cloned().collect();
        topics.sort();
        topics
    }
}

impl std::fmt::Debug for ConsumerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerConfig")
            .field("brokers", &self.brokers)
            .field("group_id", &self.group_id)
            .field("dead_letter_topic", &self.dead_letter_topic)
            .field("retry_policy", &self.retry_policy)
            .field("timeout", &self.timeout)
            .field("dispatch_mode", &self.dispatch_mode)
            .field("poll_error_backoff", &self.poll_error_backoff)
            .field("routes", &self.routes)
            .finish()
    }
}

/// A topic registration; `route` is `None` when no handler was declared
struct Registration {
    topic: String,
    message_type: &'static str,
    route: Option<TopicRoute>,
}

/// Builder for ConsumerConfig
pub struct ConsumerConfigBuilder {
    brokers: String,
    group_id: String,
    dead_letter_topic: Option<String>,
    retry_policy: RetryPolicy,
    timeout: Duration,
    dispatch_mode: DispatchMode,
    poll_error_backoff: Duration,
    inbox: Arc<dyn Inbox>,
    kafka_properties: HashMap<String, String>,
    registrations: Vec<Registration>,
}

impl ConsumerConfigBuilder {
    /// Create a new consumer config builder
    pub fn new() -> Self {
        Self {
            brokers: String::new(),
            group_id: String::new(),
            dead_letter_topic: None,
            retry_policy: RetryPolicy::default(),
            timeout: DEFAULT_ATTEMPT_TIMEOUT,
            dispatch_mode: DispatchMode::Sequential,
            poll_error_backoff: Duration::from_secs(1),
            inbox: Arc::new(NoOpInbox),
            kafka_properties: HashMap::new(),
            registrations: Vec::new(),
        }
    }

    /// Set the broker addresses
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = brokers.into();
        self
    }

    /// Set the consumer group ID
    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = group_id.into();
        self
    }

    /// Set the dead letter queue topic
    pub fn dead_letter_topic(mut self, topic: impl Into<String>) -> Self {
        self.dead_letter_topic = Some(topic.into());
        self
    }

    /// Number of immediate retries after a failed attempt
    pub fn instant_retries(mut self, retries: u32) -> Self {
        self.retry_policy = self.retry_policy.with_max_retries(retries);
        self
    }

    /// Set the retry policy
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Override the per-attempt timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Choose sequential or concurrent dispatch
    pub fn dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.dispatch_mode = mode;
        self
    }

    /// Opt into concurrent dispatch with at most `max_in_flight` messages
    pub fn concurrent(self, max_in_flight: usize) -> Self {
        self.dispatch_mode(DispatchMode::Concurrent { max_in_flight })
    }

    /// Opt into concurrent dispatch with the default bound
    pub fn concurrent_default(self) -> Self {
        self.concurrent(DEFAULT_MAX_IN_FLIGHT)
    }

    /// Pause after a transient transport error
    pub fn poll_error_backoff(mut self, backoff: Duration) -> Self {
        self.poll_error_backoff = backoff;
        self
    }

    /// Use an idempotency inbox
    pub fn inbox(mut self, inbox: Arc<dyn Inbox>) -> Self {
        self.inbox = inbox;
        self
    }

    /// Add a custom Kafka property
    pub fn kafka_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.kafka_properties.insert(key.into(), value.into());
        self
    }

    /// Apply file or environment settings
    pub fn settings(mut self, settings: &ConsumerSettings) -> Self {
        if let Some(brokers) = &settings.brokers {
            self.brokers = brokers.join(",");
        }
        if let Some(group_id) = &settings.group_id {
            self.group_id = group_id.clone();
        }
        if let Some(topic) = &settings.dead_letter_topic {
            self.dead_letter_topic = Some(topic.clone());
        }
        if let Some(policy) = &settings.retry_policy {
            self.retry_policy = policy.clone();
        }
        if let Some(retries) = settings.instant_retries {
            self.retry_policy = self.retry_policy.with_max_retries(retries);
        }
        if let Some(secs) = settings.timeout_secs {
            self.timeout = Duration::from_secs(secs);
        }
        if let Some(max_in_flight) = settings.max_in_flight {
            self.dispatch_mode = DispatchMode::Concurrent { max_in_flight };
        } else if settings.concurrent {
            self.dispatch_mode = DispatchMode::Concurrent {
                max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            };
        }
        for (key, value) in &settings.kafka_properties {
            self.kafka_properties.insert(key.clone(), value.clone());
        }
        self
    }

    /// Start a registration for message type `M`
    pub fn for_message<M>(self) -> MessageConfigBuilder<M>
    where
        M: DeserializeOwned + Send + Sync + 'static,
    {
        MessageConfigBuilder {
            parent: self,
            route: None,
            _marker: PhantomData,
        }
    }

    /// Validate and build the consumer configuration
    pub fn build(self) -> ConsumerResult<ConsumerConfig> {
        if self.brokers.trim().is_empty() {
            return Err(ConsumerError::MissingConfiguration(
                "The bootstrap servers for consumer must be specified".to_string(),
            ));
        }

        if self.group_id.trim().is_empty() {
            return Err(ConsumerError::MissingConfiguration(
                "Consumer group for consumer must be specified".to_string(),
            ));
        }

        if let DispatchMode::Concurrent { max_in_flight: 0 } = self.dispatch_mode {
            return Err(ConsumerError::MissingConfiguration(
                "Concurrent dispatch needs at least one processing slot".to_string(),
            ));
        }

        if self.timeout.is_zero() {
            return Err(ConsumerError::MissingConfiguration(
                "Handler timeout must be greater than 0".to_string(),
            ));
        }

        if matches!(&self.dead_letter_topic, Some(topic) if topic.trim().is_empty()) {
            return Err(ConsumerError::MissingConfiguration(
                "Dead letter topic must not be blank".to_string(),
            ));
        }

        let mut routes = HashMap::with_capacity(self.registrations.len());
        for registration in self.registrations {
            if registration.topic.trim().is_empty() {
                return Err(ConsumerError::MissingConfiguration(format!(
                    "Topic name for message type {} must be specified",
                    registration.message_type
                )));
            }

            let route = registration.route.ok_or_else(|| {
                ConsumerError::InvalidHandlerRegistration {
                    type_name: registration.message_type.to_string(),
                    reason: "no handler implementing Handler<M> was registered".to_string(),
                }
            })?;

            if let Some(previous) = routes.insert(registration.topic.clone(), route) {
                warn!(
                    "Topic {} was registered twice, {} replaces {}",
                    registration.topic,
                    short_route_name(routes.get(&registration.topic)),
                    short_route_name(Some(&previous))
                );
            }
        }

        if routes.is_empty() {
            warn!("No topics registered, the consumer will only idle");
        }

        Ok(ConsumerConfig {
            brokers: self.brokers,
            group_id: self.group_id,
            dead_letter_topic: self.dead_letter_topic,
            retry_policy: self.retry_policy,
            timeout: self.timeout,
            dispatch_mode: self.dispatch_mode,
            poll_error_backoff: self.poll_error_backoff,
            inbox: self.inbox,
            kafka_properties: self.kafka_properties,
            routes,
        })
    }
}

fn short_route_name(route: Option<&TopicRoute>) -> String {
    route
        .map(|r| format!("{}/{}", r.message_type(), r.handler_type()))
        .unwrap_or_default()
}

impl Default for ConsumerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Registration step for one message type
pub struct MessageConfigBuilder<M> {
    parent: ConsumerConfigBuilder,
    route: Option<TopicRoute>,
    _marker: PhantomData<fn() -> M>,
}

impl<M> MessageConfigBuilder<M>
where
    M: DeserializeOwned + Send + Sync + 'static,
{
    /// Handle `M` with a fresh `H::default()` per message
    pub fn handler<H>(self) -> Self
    where
        H: Handler<M> + Default,
    {
        self.handler_with(H::default)
    }

    /// Handle `M` with an instance produced by `factory` per message
    pub fn handler_with<H, F>(mut self, factory: F) -> Self
    where
        H: Handler<M>,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.route = Some(TopicRoute::new::<M, H, F>(factory));
        self
    }

    /// Bind the registration to `topic`; re-registering a topic replaces the earlier entry
    pub fn topic(mut self, topic: impl Into<String>) -> ConsumerConfigBuilder {
        self.parent.registrations.push(Registration {
            topic: topic.into(),
            message_type: short_type_name::<M>(),
            route: self.route,
        });
        self.parent
    }
}

/// Consumer settings as read from a file or the environment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsumerSettings {
    /// Broker addresses
    pub brokers: Option<Vec<String>>,
    /// Consumer group
    pub group_id: Option<String>,
    /// Dead letter topic
    pub dead_letter_topic: Option<String>,
    /// Immediate retry count, applied on top of `retry_policy`
    pub instant_retries: Option<u32>,
    /// Full retry policy
    pub retry_policy: Option<RetryPolicy>,
    /// Per-attempt timeout in seconds
    pub timeout_secs: Option<u64>,
    /// Enables concurrent dispatch with this bound
    pub max_in_flight: Option<usize>,
    /// Enables concurrent dispatch with the default bound when `max_in_flight` is absent
    pub concurrent: bool,
    /// Topics the host should subscribe to
    pub topics: Vec<String>,
    /// Extra client properties
    pub kafka_properties: HashMap<String, String>,
}

impl ConsumerSettings {
    /// Parse settings from YAML text
    pub fn from_yaml_str(yaml: &str) -> ConsumerResult<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load settings from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> ConsumerResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::io::Write;
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, Deserialize)]
    struct OrderMessage {
        #[allow(dead_code)]
        value: String,
    }

    #[derive(Default)]
    struct OrderHandler;

    #[async_trait]
    impl Handler<OrderMessage> for OrderHandler {
        async fn handle(&self, _message: &OrderMessage, _cancel: &CancellationToken) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct AuditHandler;

    #[async_trait]
    impl Handler<OrderMessage> for AuditHandler {
        async fn handle(&self, _message: &OrderMessage, _cancel: &CancellationToken) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn base() -> ConsumerConfigBuilder {
        ConsumerConfig::builder()
            .brokers("localhost:9092")
            .group_id("test-group")
    }

    #[test]
    fn test_registry_maps_topic_to_types() {
        let config = base()
            .for_message::<OrderMessage>()
            .handler::<OrderHandler>()
            .topic("orders")
            .build()
            .unwrap();

        let route = config.route("orders").unwrap();
        assert_eq!(route.message_type(), "OrderMessage");
        assert_eq!(route.handler_type(), "OrderHandler");
        assert!(config.route("payments").is_none());
        assert_eq!(config.topics(), vec!["orders".to_string()]);
        assert_eq!(config.dispatch_mode, DispatchMode::Sequential);
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[rstest]
    #[case::no_brokers("", "test-group")]
    #[case::blank_brokers("  ", "test-group")]
    #[case::no_group("localhost:9092", "")]
    fn test_missing_configuration(#[case] brokers: &str, #[case] group: &str) {
        let result = ConsumerConfig::builder()
            .brokers(brokers)
            .group_id(group)
            .for_message::<OrderMessage>()
            .handler::<OrderHandler>()
            .topic("orders")
            .build();

        assert!(matches!(result, Err(ConsumerError::MissingConfiguration(_))));
    }

    #[test]
    fn test_builder_without_brokers_fails_before_consuming() {
        let result = ConsumerConfig::builder().group_id("test-group").build();
        assert!(matches!(result, Err(ConsumerError::MissingConfiguration(_))));
    }

    #[test]
    fn test_topic_without_handler_is_invalid() {
        let result = base().for_message::<OrderMessage>().topic("orders").build();

        match result {
            Err(ConsumerError::InvalidHandlerRegistration { type_name, .. }) => {
                assert_eq!(type_name, "OrderMessage")
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_duplicate_topic_overwrites() {
        let config = base()
            .for_message::<OrderMessage>()
            .handler::<OrderHandler>()
            .topic("orders")
            .for_message::<OrderMessage>()
            .handler::<AuditHandler>()
            .topic("orders")
            .build()
            .unwrap();

        assert_eq!(config.route("orders").unwrap().handler_type(), "AuditHandler");
        assert_eq!(config.topics().len(), 1);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let result = base().concurrent(0).build();
        assert!(matches!(result, Err(ConsumerError::MissingConfiguration(_))));
        assert!(base().concurrent(DEFAULT_MAX_IN_FLIGHT).build().is_ok());
    }

    #[test]
    fn test_concurrent_default_uses_default_bound() {
        let config = base().concurrent_default().build().unwrap();
        assert_eq!(
            config.dispatch_mode,
            DispatchMode::Concurrent { max_in_flight: 16 }
        );
    }

    #[rstest]
    #[case::flag_only("concurrent: true", DispatchMode::Concurrent { max_in_flight: 16 })]
    #[case::explicit_bound("concurrent: true\nmax_in_flight: 4", DispatchMode::Concurrent { max_in_flight: 4 })]
    #[case::bound_alone("max_in_flight: 2", DispatchMode::Concurrent { max_in_flight: 2 })]
    #[case::neither("group_id: users", DispatchMode::Sequential)]
    fn test_settings_choose_dispatch_mode(#[case] yaml: &str, #[case] expected: DispatchMode) {
        let settings = ConsumerSettings::from_yaml_str(yaml).unwrap();
        let config = base().settings(&settings).build().unwrap();
        assert_eq!(config.dispatch_mode, expected);
    }

    #[test]
    fn test_instant_retries_keeps_schedule() {
        let config = base().instant_retries(0).build().unwrap();
        assert_eq!(config.retry_policy.max_retries, 0);
        assert_eq!(config.retry_policy.initial_backoff, Duration::from_millis(500));
    }

    #[test]
    fn test_settings_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "brokers: [\"kafka-1:9092\", \"kafka-2:9092\"]\ngroup_id: users\ndead_letter_topic: DLQ\ninstant_retries: 1\ntimeout_secs: 5\nmax_in_flight: 8\ntopics: [orders]"
        )
        .unwrap();

        let settings = ConsumerSettings::from_yaml_file(file.path()).unwrap();
        let config = ConsumerConfig::builder().settings(&settings).build().unwrap();

        assert_eq!(config.brokers, "kafka-1:9092,kafka-2:9092");
        assert_eq!(config.group_id, "users");
        assert_eq!(config.dead_letter_topic.as_deref(), Some("DLQ"));
        assert_eq!(config.retry_policy.max_retries, 1);
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.dispatch_mode, DispatchMode::Concurrent { max_in_flight: 8 });
        assert_eq!(settings.topics, vec!["orders".to_string()]);
    }

    #[test]
    fn test_settings_reject_unknown_keys() {
        let result = ConsumerSettings::from_yaml_str("brokerz: [a]");
        assert!(matches!(result, Err(ConsumerError::Settings(_))));
    }
}
