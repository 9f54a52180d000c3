//! In-memory wire fakes shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use kafka_dispatch::consumer::{
    ConsumerError, ConsumerResult, RawMessage, WireConsumer, WireProducer, REFID_HEADER,
};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One scripted poll result
pub enum Step {
    Message(RawMessage),
    Error(ConsumerError),
}

/// Wire consumer replaying a script, then blocking until cancelled
#[derive(Default)]
pub struct ScriptedWire {
    steps: Mutex<VecDeque<Step>>,
    subscribed: Mutex<Vec<String>>,
    commits: Mutex<Vec<(String, i64)>>,
    cancel_when_drained: Option<CancellationToken>,
}

impl ScriptedWire {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            ..Default::default()
        }
    }

    pub fn messages(messages: Vec<RawMessage>) -> Self {
        Self::new(messages.into_iter().map(Step::Message).collect())
    }

    /// Fire `token` once the script is exhausted
    pub fn cancel_when_drained(mut self, token: CancellationToken) -> Self {
        self.cancel_when_drained = Some(token);
        self
    }

    pub fn commits(&self) -> Vec<(String, i64)> {
        self.commits.lock().clone()
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.subscribed.lock().clone()
    }

    /// Wait until at least `count` commits were recorded
    pub async fn wait_for_commits(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(30), async {
            while self.commits.lock().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("commits did not arrive in time");
    }

    /// Wait until an offset at or past `offset` was committed
    pub async fn wait_for_offset(&self, offset: i64) {
        tokio::time::timeout(Duration::from_secs(30), async {
            while !self.commits.lock().iter().any(|(_, committed)| *committed >= offset) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("offset was not committed in time");
    }

    /// Committed offsets in commit order
    pub fn committed_offsets(&self) -> Vec<i64> {
        self.commits.lock().iter().map(|(_, offset)| *offset).collect()
    }
}

#[async_trait]
impl WireConsumer for ScriptedWire {
    async fn subscribe(&self, topics: &[String]) -> ConsumerResult<()> {
        self.subscribed.lock().extend(topics.iter().cloned());
        Ok(())
    }

    async fn consume(&self, cancel: &CancellationToken) -> ConsumerResult<RawMessage> {
        let next = self.steps.lock().pop_front();
        match next {
            Some(Step::Message(message)) => Ok(message),
            Some(Step::Error(error)) => Err(error),
            None => {
                if let Some(token) = &self.cancel_when_drained {
                    token.cancel();
                }
                cancel.cancelled().await;
                Err(ConsumerError::Cancelled)
            }
        }
    }

    async fn commit(&self, message: &RawMessage) -> ConsumerResult<()> {
        self.commits
            .lock()
            .push((message.topic.clone(), message.offset));
        Ok(())
    }
}

/// A record captured by [`RecordingProducer`]
#[derive(Debug, Clone)]
pub struct Produced {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl Produced {
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| String::from_utf8_lossy(v).into_owned())
    }
}

/// Wire producer keeping everything it was asked to publish
#[derive(Default)]
pub struct RecordingProducer {
    sent: Mutex<Vec<Produced>>,
}

impl RecordingProducer {
    pub fn sent(&self) -> Vec<Produced> {
        self.sent.lock().clone()
    }
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
        self.sent.lock().push(Produced {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: payload.to_vec(),
            headers: headers.to_vec(),
        });
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct OrderMessage {
    #[serde(rename = "Value")]
    pub value: String,
}

/// An `orders` record with the given offset and value
pub fn order(offset: i64, value: &str) -> RawMessage {
    RawMessage::new(
        "orders",
        0,
        offset,
        format!(r#"{{"Value":"{}"}}"#, value).into_bytes(),
    )
    .with_header(REFID_HEADER, "abc-123")
}
