//! Channel-store adapter.
//!
//! Bridges the broker contract onto a key/value store's fire-and-forget
//! pub/sub channels. The store itself is reached through the
//! [`ChannelStore`] capability trait so the adapter logic is independent of
//! any client library. Currently supports:
//! - redis - Redis Pub/Sub via the `redis` crate (redis.rs, feature `redis`)
//!
//! ## Delivery semantics
//!
//! - Messages are published as the plain JSON encoding of `T`.
//! - A message published while nobody listens on the channel is lost.
//! - `ack`/`nack` are no-ops; nothing is ever redelivered.
//! - A payload that fails to decode into `T` is logged and skipped.
//!
//! ## Tasks
//!
//! Every subscription owns one background task that reads the store feed,
//! decodes, and forwards into the subscription mailbox. The task holds the
//! only sender of that mailbox. It runs under a child of the broker's root
//! cancellation token; stopping it (subscription close or broker close)
//! unsubscribes from the store channel exactly once and then drops the
//! sender, which closes the mailbox.

#[cfg(feature = "redis")]
#[allow(clippy::module_inception)]
mod redis;

#[cfg(feature = "redis")]
pub use redis::RedisChannelStore;

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::pool::{drain_with_workers, WorkerStep};
use super::tasks::{Registered, SubscriptionTasks};
use crate::{
    // ---
    bounded,
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
    RedisConfig,
    Result,
    Subscriber,
    Subscription,
    MAILBOX_CAPACITY,
};

/// Raw capabilities of a key/value store's pub/sub channels.
#[async_trait::async_trait]
pub trait ChannelStore: Send + Sync {
    // ---
    /// Fire-and-forget publish of one payload.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()>;

    /// Subscribe to `channel`, returning once the store confirmed it.
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn ChannelFeed>>;

    /// Liveness probe.
    async fn ping(&self) -> Result<()>;

    /// Release connections. Called once, after every feed was unsubscribed.
    async fn close(&self) -> Result<()>;
}

/// Shared store pointer.
pub type ChannelStorePtr = Arc<dyn ChannelStore>;

/// Incoming side of one channel subscription.
#[async_trait::async_trait]
pub trait ChannelFeed: Send {
    /// Next raw payload, or `None` once the feed ended.
    async fn next_payload(&mut self) -> Option<Bytes>;

    /// Stop receiving. Called at most once.
    async fn unsubscribe(&mut self) -> Result<()>;
}

struct Inner {
    store: ChannelStorePtr,
    default_channel: Option<String>,
    tasks: SubscriptionTasks,
}

/// Broker over a [`ChannelStore`].
pub struct ChannelPubSub<T> {
    inner: Arc<Inner>,
    _message: PhantomData<fn() -> T>,
}

impl<T> Clone for ChannelPubSub<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _message: PhantomData,
        }
    }
}

impl<T: Message> ChannelPubSub<T> {
    // ---
    /// Wrap an already connected store.
    pub fn new(store: ChannelStorePtr, default_channel: Option<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                default_channel: default_channel.filter(|c| !c.is_empty()),
                tasks: SubscriptionTasks::new("channel"),
            }),
            _message: PhantomData,
        }
    }

    /// Number of subscription tasks still running.
    pub fn active_subscriptions(&self) -> usize {
        self.inner.tasks.len()
    }

    fn is_closed(&self) -> bool {
        self.inner.tasks.is_closed()
    }

    fn channel(&self, channel: &str) -> Result<String> {
        resolve_topic(channel, self.inner.default_channel.as_deref(), "channel")
    }
}

/// Read `feed` until cancelled, forwarding decoded messages into `tx`.
async fn pump<T: Message>(
    channel: String,
    mut feed: Box<dyn ChannelFeed>,
    tx: mpsc::Sender<Envelope<T>>,
    cancel: CancellationToken,
) {
    // ---
    loop {
        let payload = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = feed.next_payload() => match next {
                Some(payload) => payload,
                None => {
                    log_warn!("{channel}: channel feed ended");
                    break;
                }
            },
        };

        let msg: T = match serde_json::from_slice(&payload) {
            Ok(msg) => msg,
            Err(_err) => {
                log_warn!("{channel}: skipping undecodable payload: {_err}");
                continue;
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = tx.send(Envelope::unacknowledged(msg)) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    if let Err(_err) = feed.unsubscribe().await {
        log_warn!("{channel}: unsubscribe failed: {_err}");
    }
    log_debug!("{channel}: subscription task stopped");
}

#[async_trait::async_trait]
impl<T: Message> Publisher<T> for ChannelPubSub<T> {
    // ---
    /// Encode every message of `input` and publish it on `channel`.
    ///
    /// Encode and store failures are logged and the message is skipped.
    async fn publish(
        &self,
        ctx: &CancellationToken,
        channel: &str,
        input: mpsc::Receiver<T>,
        workers: usize,
    ) -> Result<()> {
        // ---
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let channel = self.channel(channel)?;

        let inner = Arc::clone(&self.inner);
        let worker_ctx = ctx.clone();
        let worker_channel = channel.clone();

        drain_with_workers(ctx, &channel, input, workers, move |msg: T| {
            let inner = Arc::clone(&inner);
            let ctx = worker_ctx.clone();
            let channel = worker_channel.clone();
            async move {
                if inner.tasks.is_closed() {
                    return WorkerStep::Stop;
                }

                let payload = match serde_json::to_vec(&msg) {
                    Ok(payload) => Bytes::from(payload),
                    Err(_err) => {
                        log_warn!("{channel}: dropping message, failed to encode: {_err}");
                        return WorkerStep::Continue;
                    }
                };

                tokio::select! {
                    biased;
                    _ = ctx.cancelled() => WorkerStep::Stop,
                    published = inner.store.publish(&channel, payload) => {
                        match published {
                            Ok(()) => log_trace!("{channel}: published"),
                            Err(_err) => log_warn!("{channel}: dropping message, publish failed: {_err}"),
                        }
                        WorkerStep::Continue
                    }
                }
            }
        })
        .await;

        Ok(())
    }
}

#[async_trait::async_trait]
impl<T: Message> Subscriber<T> for ChannelPubSub<T> {
    // ---
    /// Subscribe to `channel` and start its forwarding task.
    async fn subscribe(&self, ctx: &CancellationToken, channel: &str) -> Result<Subscription<T>> {
        // ---
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let channel = self.channel(channel)?;

        let feed = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(Error::Cancelled),
            feed = self.inner.store.subscribe(&channel) => feed?,
        };

        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let token = self.inner.tasks.child_token();
        let handle = tokio::spawn(pump::<T>(channel.clone(), feed, tx, token.clone()));

        let Registered::Running(id) = self.inner.tasks.register(handle, &token).await else {
            return Err(Error::Closed);
        };

        log_debug!("{channel}: subscribed, task {id}");

        let inner = Arc::clone(&self.inner);
        let teardown = Box::pin(async move {
            inner.tasks.stop(id, &token).await;
        });

        Ok(Subscription::new(channel, rx, teardown))
    }
}

#[async_trait::async_trait]
impl<T: Message> PubSub<T> for ChannelPubSub<T> {
    // ---
    fn backend(&self) -> BackendKind {
        BackendKind::Channel
    }

    /// Stop every subscription task, then close the store.
    async fn close(&self) -> Result<()> {
        // ---
        if !self.inner.tasks.shutdown().await {
            log_debug!("channel broker already closed");
            return Ok(());
        }

        self.inner.store.close().await?;
        log_info!("channel broker closed");
        Ok(())
    }

    async fn ping(&self, ctx: &CancellationToken, timeout: Duration) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        bounded(ctx, timeout, self.inner.store.ping()).await
    }
}

/// Connect to Redis and wrap it in a [`ChannelPubSub`].
///
/// # Errors
///
/// - [`Error::Config`] for a missing address or when feature `redis` is off
/// - [`Error::Connection`] when no `PING` succeeds within `connect_timeout`
#[cfg(feature = "redis")]
pub async fn create_redis_pubsub<T: Message>(config: &RedisConfig) -> Result<PubSubPtr<T>> {
    // ---
    let store = RedisChannelStore::connect(config).await?;
    Ok(Arc::new(ChannelPubSub::<T>::new(
        Arc::new(store),
        config.default_channel.clone(),
    )))
}

#[cfg(not(feature = "redis"))]
pub async fn create_redis_pubsub<T: Message>(config: &RedisConfig) -> Result<PubSubPtr<T>> {
    config.connection_url()?;
    Err(Error::Config("redis feature is not enabled".into()))
}


#[cfg(test)]
mod tests {
    // ---
    use super::fake::{FakeStore, FakeStoreHandle};
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::Ordering;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Reading {
        sensor: String,
        value: f64,
    }

    fn broker(default_channel: Option<&str>) -> (Arc<FakeStore>, ChannelPubSub<Reading>) {
        let store = Arc::new(FakeStore::default());
        let pubsub = ChannelPubSub::new(
            Arc::new(FakeStoreHandle(Arc::clone(&store))),
            default_channel.map(str::to_string),
        );
        (store, pubsub)
    }

    fn reading(value: f64) -> Reading {
        Reading {
            sensor: "t1".into(),
            value,
        }
    }

    async fn feed(items: Vec<Reading>) -> mpsc::Receiver<Reading> {
        let (tx, rx) = mpsc::channel(items.len().max(1));
        for item in items {
            tx.send(item).await.unwrap();
        }
        rx
    }

    #[tokio::test]
    async fn published_messages_reach_subscriber() {
        let ctx = CancellationToken::new();
        let (store, pubsub) = broker(None);
        let sub = pubsub.subscribe(&ctx, "sensors").await.unwrap();

        let input = feed(vec![reading(1.0), reading(2.0)]).await;
        pubsub.publish(&ctx, "sensors", input, 1).await.unwrap();

        assert_eq!(sub.bpop(&ctx).await.unwrap().data().value, 1.0);
        let second = sub.bpop(&ctx).await.unwrap();
        assert_eq!(second.data().value, 2.0);
        assert!(!second.redelivers());
        second.nack(&ctx).await.unwrap();
        assert_eq!(store.published.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_channel_is_config_error() {
        let ctx = CancellationToken::new();
        let (_store, pubsub) = broker(None);

        let err = pubsub.subscribe(&ctx, "").await.unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg == "channel is required"));

        let input = feed(vec![reading(1.0)]).await;
        assert!(matches!(pubsub.publish(&ctx, "", input, 1).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn default_channel_is_used() {
        let ctx = CancellationToken::new();
        let (store, pubsub) = broker(Some("fallback"));
        let sub = pubsub.subscribe(&ctx, "").await.unwrap();
        assert_eq!(sub.name(), "fallback");
        assert_eq!(store.listeners("fallback"), 1);
    }

    #[tokio::test]
    async fn undecodable_payload_is_skipped() {
        let ctx = CancellationToken::new();
        let (store, pubsub) = broker(None);
        let sub = pubsub.subscribe(&ctx, "sensors").await.unwrap();

        store.inject("sensors", b"not json");
        store.inject("sensors", br#"{"sensor":"t9","value":9.5}"#);

        let envelope = sub.pop(&ctx, Duration::from_secs(1)).await.unwrap();
        assert_eq!(envelope.data().sensor, "t9");
    }

    #[tokio::test]
    async fn publish_failure_skips_message() {
        let ctx = CancellationToken::new();
        let (store, pubsub) = broker(None);
        store.fail_publish.store(true, Ordering::SeqCst);

        let input = feed(vec![reading(1.0), reading(2.0)]).await;
        pubsub.publish(&ctx, "sensors", input, 2).await.unwrap();
        assert_eq!(store.published.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn subscription_close_unsubscribes_once() {
        let ctx = CancellationToken::new();
        let (store, pubsub) = broker(None);
        let sub = pubsub.subscribe(&ctx, "sensors").await.unwrap();
        assert_eq!(store.listeners("sensors"), 1);

        sub.close().await;
        sub.close().await;

        assert_eq!(store.unsubscribed.load(Ordering::SeqCst), 1);
        assert_eq!(store.listeners("sensors"), 0);
        assert_eq!(pubsub.active_subscriptions(), 0);
        assert!(matches!(sub.bpop(&ctx).await, Err(Error::SubscriptionClosed)));
    }

    #[tokio::test]
    async fn broker_close_stops_all_subscriptions() {
        let ctx = CancellationToken::new();
        let (store, pubsub) = broker(None);
        let a = pubsub.subscribe(&ctx, "a").await.unwrap();
        let b = pubsub.subscribe(&ctx, "b").await.unwrap();

        pubsub.close().await.unwrap();
        pubsub.close().await.unwrap();

        assert_eq!(store.unsubscribed.load(Ordering::SeqCst), 2);
        assert_eq!(store.closed.load(Ordering::SeqCst), 1);
        assert!(matches!(a.bpop(&ctx).await, Err(Error::SubscriptionClosed)));
        assert!(matches!(b.bpop(&ctx).await, Err(Error::SubscriptionClosed)));

        // Late subscription closes only run what is left, which is nothing.
        a.close().await;
        assert_eq!(store.unsubscribed.load(Ordering::SeqCst), 2);

        assert!(matches!(pubsub.subscribe(&ctx, "a").await, Err(Error::Closed)));
        let input = feed(vec![reading(1.0)]).await;
        assert!(matches!(pubsub.publish(&ctx, "a", input, 1).await, Err(Error::Closed)));

        // Closed wins over a missing channel name.
        assert!(matches!(pubsub.subscribe(&ctx, "").await, Err(Error::Closed)));
        let input = feed(vec![reading(2.0)]).await;
        assert!(matches!(pubsub.publish(&ctx, "", input, 1).await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn ping_reports_store_state() {
        let ctx = CancellationToken::new();
        let (store, pubsub) = broker(None);
        pubsub.ping(&ctx, Duration::from_secs(1)).await.unwrap();

        store.down.store(true, Ordering::SeqCst);
        assert!(matches!(
            pubsub.ping(&ctx, Duration::from_secs(1)).await,
            Err(Error::Connection(_))
        ));
    }

    #[cfg(not(feature = "redis"))]
    #[tokio::test]
    async fn redis_without_feature_is_config_error() {
        let config = RedisConfig::default();
        let result = create_redis_pubsub::<Reading>(&config).await;
        assert!(matches!(result, Err(Error::Config(ref msg)) if msg.contains("feature")));
    }
}
