//! Handler contract and type-erased invokers
//!
//! A [`Handler`] is implemented once per message type. At configuration time
//! each `(message, handler)` pair is wrapped into a [`TopicRoute`] so the
//! consume loop can decode and dispatch without knowing the concrete types.

use crate::consumer::error::{ConsumerError, ConsumerResult};
use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Trait for handling one decoded message type
#[async_trait]
pub trait Handler<M>: Send + Sync + 'static
where
    M: Send + Sync + 'static,
{
    /// Handle a message. Any error is treated uniformly by the retry policy.
    async fn handle(&self, message: &M, cancel: &CancellationToken) -> anyhow::Result<()>;
}

#[async_trait]
impl<M, H> Handler<M> for Arc<H>
where
    M: Send + Sync + 'static,
    H: Handler<M>,
{
    async fn handle(&self, message: &M, cancel: &CancellationToken) -> anyhow::Result<()> {
        self.as_ref().handle(message, cancel).await
    }
}

/// A decoded message bound to a freshly resolved handler instance
#[async_trait]
pub trait Invocation: Send + Sync {
    /// Run the handler once
    async fn invoke(&self, cancel: &CancellationToken) -> anyhow::Result<()>;
}

/// Type-erased decoder and handler resolver for one topic
pub trait Dispatch: Send + Sync {
    /// Decode the payload and resolve a handler from a fresh scope
    fn prepare(&self, payload: &[u8]) -> ConsumerResult<Box<dyn Invocation>>;
}

/// Immutable routing entry for one topic
#[derive(Clone)]
pub struct TopicRoute {
    message_type: &'static str,
    handler_type: &'static str,
    dispatch: Arc<dyn Dispatch>,
}

impl TopicRoute {
    /// Build a route for `M` handled by instances produced by `factory`
    pub fn new<M, H, F>(factory: F) -> Self
    where
        M: DeserializeOwned + Send + Sync + 'static,
        H: Handler<M>,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let message_type = short_type_name::<M>();
        let handler_type = short_type_name::<H>();
        let dispatch = TypedDispatch::<M, H, F> {
            message_type,
            handler_type,
            factory,
            _marker: PhantomData,
        };
        Self {
            message_type,
            handler_type,
            dispatch: Arc::new(dispatch),
        }
    }

    /// Registered message type name
    pub fn message_type(&self) -> &'static str {
        self.message_type
    }

    /// Registered handler type name
    pub fn handler_type(&self) -> &'static str {
        self.handler_type
    }

    /// Decode and bind a handler
    pub fn prepare(&self, payload: &[u8]) -> ConsumerResult<Box<dyn Invocation>> {
        self.dispatch.prepare(payload)
    }
}

impl fmt::Debug for TopicRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicRoute")
            .field("message_type", &self.message_type)
            .field("handler_type", &self.handler_type)
            .finish()
    }
}

struct TypedDispatch<M, H, F> {
    message_type: &'static str,
    handler_type: &'static str,
    factory: F,
    _marker: PhantomData<fn() -> (M, H)>,
}

impl<M, H, F> Dispatch for TypedDispatch<M, H, F>
where
    M: DeserializeOwned + Send + Sync + 'static,
    H: Handler<M>,
    F: Fn() -> H + Send + Sync + 'static,
{
    fn prepare(&self, payload: &[u8]) -> ConsumerResult<Box<dyn Invocation>> {
        let message: M =
            serde_json::from_slice(payload).map_err(|e| ConsumerError::Deserialization {
                message_type: self.message_type,
                reason: e.to_string(),
            })?;

        Ok(Box::new(TypedInvocation {
            message,
            handler: (self.factory)(),
            handler_type: self.handler_type,
        }))
    }
}

struct TypedInvocation<M, H> {
    message: M,
    handler: H,
    handler_type: &'static str,
}

#[async_trait]
impl<M, H> Invocation for TypedInvocation<M, H>
where
    M: Send + Sync + 'static,
    H: Handler<M>,
{
    async fn invoke(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        // A panicking handler counts as a failed attempt
        let result = AssertUnwindSafe(self.handler.handle(&self.message, cancel))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(anyhow::anyhow!("panicked: {}", panic_message(&*panic))));

        result.map_err(|source| {
            ConsumerError::Handler {
                handler_type: self.handler_type,
                source,
            }
            .into()
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// Last path segment of a type name, generics kept intact
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let head = full.split('<').next().unwrap_or(full);
    match head.rfind("::") {
        Some(idx) => &full[idx + 2..],
        None => full,
    }
}
