//! In-process broker.
//!
//! This module provides a pure in-process implementation of the broker
//! contract. It is intended for tests, local execution, and as the
//! reference for delivery semantics.
//!
//! ## Reference Semantics
//!
//! - Once `subscribe()` returns, messages published afterwards are
//!   delivered to the new subscription.
//! - With a single publish worker, every subscriber sees messages in
//!   publish order.
//! - A topic without subscribers silently drops messages.
//! - `ack`/`nack` are no-ops; nothing is ever redelivered.
//!
//! ## Locking
//!
//! Two locks guard the registry, always taken in this order:
//!
//! 1. `dispatch` (async) is held for the whole "enumerate subscribers and
//!    send to each" step of a publish, and for the whole "remove subscriber
//!    and drop its sender" step of a subscription close.
//! 2. `registry` (sync, never held across `.await`) protects the topic map
//!    and the closed flag.
//!
//! Holding `dispatch` on both sides means a mailbox is never closed while a
//! send into it may be in flight. Serialization happens before `dispatch`
//! is taken, so the lock only spans enumeration and sending.
//!
//! A full mailbox blocks the publishing worker (backpressure). While it
//! waits it holds `dispatch`, which also delays delivery to other
//! subscribers and subscription closes until the slow consumer drains or
//! the publish is cancelled.
//!
//! ## Non-Goals
//!
//! - Persistence or durability
//! - Redelivery
//! - Network behavior or failure simulation

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::pool::{drain_with_workers, WorkerStep};
use crate::{
    // ---
    lock_ignore_poison,
    log_debug,
    log_info,
    log_trace,
    log_warn,
    resolve_topic,
    BackendKind,
    Envelope,
    Error,
    Message,
    PubSub,
    PubSubPtr,
    Publisher,
    Result,
    Subscriber,
    Subscription,
    MAILBOX_CAPACITY,
};

type SubscriberId = u64;

struct Mailbox<T> {
    id: SubscriberId,
    tx: mpsc::Sender<Envelope<T>>,
}

struct Registry<T> {
    topics: HashMap<String, Vec<Mailbox<T>>>,
    next_id: SubscriberId,
    closed: bool,
}

struct Inner<T> {
    registry: Mutex<Registry<T>>,
    dispatch: tokio::sync::Mutex<()>,
    default_topic: Option<String>,
}

/// In-memory broker.
///
/// Cheap to clone; clones share one registry.
///
/// ```
/// # use mom_pubsub::{InMemoryPubSub, Publisher, Subscriber, CancellationToken};
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> mom_pubsub::Result<()> {
/// let broker = InMemoryPubSub::<String>::new();
/// let ctx = CancellationToken::new();
///
/// let sub = broker.subscribe(&ctx, "greetings").await?;
///
/// let (tx, rx) = tokio::sync::mpsc::channel(8);
/// tx.send("hello".to_string()).await.unwrap();
/// drop(tx);
/// broker.publish(&ctx, "greetings", rx, 1).await?;
///
/// assert_eq!(sub.bpop(&ctx).await?.data(), "hello");
/// # Ok(())
/// # }
/// ```
pub struct InMemoryPubSub<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for InMemoryPubSub<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Message> Default for InMemoryPubSub<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Message> InMemoryPubSub<T> {
    // ---
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::with_default_topic(None)
    }

    /// Create an empty broker whose empty-topic calls use `default_topic`.
    pub fn with_default_topic(default_topic: Option<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry {
                    topics: HashMap::new(),
                    next_id: 0,
                    closed: false,
                }),
                dispatch: tokio::sync::Mutex::new(()),
                default_topic: default_topic.filter(|t| !t.is_empty()),
            }),
        }
    }

    /// Number of open subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        lock_ignore_poison(&self.inner.registry)
            .topics
            .get(topic)
            .map_or(0, Vec::len)
    }

    /// Number of topics with at least one open subscription.
    pub fn topic_count(&self) -> usize {
        lock_ignore_poison(&self.inner.registry).topics.len()
    }

    /// Whether `close()` has been called.
    pub fn is_closed(&self) -> bool {
        lock_ignore_poison(&self.inner.registry).closed
    }

    fn topic(&self, topic: &str) -> Result<String> {
        resolve_topic(topic, self.inner.default_topic.as_deref(), "topic")
    }
}

impl<T: Message> Inner<T> {
    // ---
    /// Encode then decode, yielding a value that shares nothing with the producer's.
    fn detach(topic: &str, msg: &T) -> Option<T> {
        let bytes = match serde_json::to_vec(msg) {
            Ok(bytes) => bytes,
            Err(_err) => {
                log_warn!("{topic}: dropping message, failed to encode: {_err}");
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(copy) => Some(copy),
            Err(_err) => {
                log_warn!("{topic}: dropping message, failed to decode: {_err}");
                None
            }
        }
    }

    /// Fan one message out to every current subscriber of `topic`.
    async fn dispatch(&self, ctx: &CancellationToken, topic: &str, msg: T) -> WorkerStep {
        // ---
        let _dispatch = self.dispatch.lock().await;

        let targets: Vec<mpsc::Sender<Envelope<T>>> = {
            let registry = lock_ignore_poison(&self.registry);
            if registry.closed {
                return WorkerStep::Stop;
            }
            match registry.topics.get(topic) {
                Some(mailboxes) => mailboxes.iter().map(|m| m.tx.clone()).collect(),
                None => return WorkerStep::Continue,
            }
        };

        log_trace!("{topic}: dispatching to {} subscriber(s)", targets.len());

        for tx in targets {
            let envelope = Envelope::unacknowledged(msg.clone());
            tokio::select! {
                biased;
                _ = ctx.cancelled() => return WorkerStep::Stop,
                sent = tx.send(envelope) => {
                    if sent.is_err() {
                        // Only possible when the reader closed its own end.
                        log_debug!("{topic}: subscriber mailbox closed by reader");
                    }
                }
            }
        }

        WorkerStep::Continue
    }

    /// Remove one mailbox, dropping its sender. Runs under both locks.
    async fn unsubscribe(&self, topic: &str, id: SubscriberId) {
        // ---
        let _dispatch = self.dispatch.lock().await;
        let mut registry = lock_ignore_poison(&self.registry);

        let emptied = match registry.topics.get_mut(topic) {
            Some(mailboxes) => {
                mailboxes.retain(|m| m.id != id);
                mailboxes.is_empty()
            }
            None => false,
        };

        if emptied {
            registry.topics.remove(topic);
            log_debug!("{topic}: last subscriber left, topic pruned");
        }
    }
}

#[async_trait::async_trait]
impl<T: Message> Publisher<T> for InMemoryPubSub<T> {
    // ---
    /// Fan every message of `input` out to the subscribers of `topic`.
    ///
    /// Each message is round-tripped through its JSON encoding before
    /// delivery. Messages that fail to encode or decode are logged and
    /// dropped. Publishing stops early if the broker is closed or `ctx` is
    /// cancelled; a message that was mid fan-out at that point may have
    /// reached only some subscribers.
    async fn publish(
        &self,
        ctx: &CancellationToken,
        topic: &str,
        input: mpsc::Receiver<T>,
        workers: usize,
    ) -> Result<()> {
        // ---
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let topic = self.topic(topic)?;

        let inner = Arc::clone(&self.inner);
        let worker_ctx = ctx.clone();
        let worker_topic = topic.clone();

        drain_with_workers(ctx, &topic, input, workers, move |msg: T| {
            let inner = Arc::clone(&inner);
            let ctx = worker_ctx.clone();
            let topic = worker_topic.clone();
            async move {
                match Inner::detach(&topic, &msg) {
                    Some(copy) => inner.dispatch(&ctx, &topic, copy).await,
                    None => WorkerStep::Continue,
                }
            }
        })
        .await;

        Ok(())
    }
}

#[async_trait::async_trait]
impl<T: Message> Subscriber<T> for InMemoryPubSub<T> {
    // ---
    /// Register a new mailbox on `topic`.
    async fn subscribe(&self, _ctx: &CancellationToken, topic: &str) -> Result<Subscription<T>> {
        // ---
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let topic = self.topic(topic)?;
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);

        let id = {
            let mut registry = lock_ignore_poison(&self.inner.registry);
            if registry.closed {
                return Err(Error::Closed);
            }

            let id = registry.next_id;
            registry.next_id += 1;
            registry
                .topics
                .entry(topic.clone())
                .or_default()
                .push(Mailbox { id, tx });
            id
        };

        log_debug!("{topic}: subscriber {id} registered");

        let inner = Arc::clone(&self.inner);
        let teardown_topic = topic.clone();
        let teardown = Box::pin(async move {
            inner.unsubscribe(&teardown_topic, id).await;
        });

        Ok(Subscription::new(topic, rx, teardown))
    }
}

#[async_trait::async_trait]
impl<T: Message> PubSub<T> for InMemoryPubSub<T> {
    // ---
    fn backend(&self) -> BackendKind {
        BackendKind::Memory
    }

    /// Close every outstanding mailbox and reject further use.
    ///
    /// Repeated calls are no-ops.
    async fn close(&self) -> Result<()> {
        // ---
        {
            let mut registry = lock_ignore_poison(&self.inner.registry);
            if registry.closed {
                log_debug!("memory broker already closed");
                return Ok(());
            }
            registry.closed = true;
        }

        let _dispatch = self.inner.dispatch.lock().await;
        let mut registry = lock_ignore_poison(&self.inner.registry);

        let _mailboxes: usize = registry.topics.values().map(Vec::len).sum();
        registry.topics.clear();

        log_info!("memory broker closed, {_mailboxes} subscription mailbox(es) closed");
        Ok(())
    }

    /// Always succeeds; there is nothing external to probe.
    async fn ping(&self, _ctx: &CancellationToken, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

/// Create an in-process broker behind a [`PubSubPtr`].
pub fn create_memory_pubsub<T: Message>(default_topic: Option<String>) -> PubSubPtr<T> {
    Arc::new(InMemoryPubSub::<T>::with_default_topic(default_topic))
}
