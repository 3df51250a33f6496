//! Managed-cloud adapter.
//!
//! Bridges the broker contract onto a durable managed pub/sub service with
//! per-message acknowledgment. The service is reached through the
//! [`CloudClient`] capability trait. Currently supports:
//! - gcp - Google Cloud Pub/Sub via `google-cloud-pubsub` (gcp.rs, feature `gcp`)
//!
//! ## Delivery semantics
//!
//! - `publish` waits for the service to confirm each message before the
//!   worker takes the next one.
//! - `subscribe` takes a *subscription* name (the service fans a topic out
//!   to its subscriptions), falling back to the configured default.
//! - Envelope `ack` settles the message; `nack` asks for redelivery. Only
//!   the first of the two reaches the service.
//! - A delivery that does not decode into `T` is nacked right away.
//! - A delivery received while the subscription is closing is nacked so
//!   the service hands it to someone else.

#[cfg(feature = "gcp")]
mod gcp;

#[cfg(feature = "gcp")]
pub use gcp::GcpCloudClient;

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
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
    AckHandle,
    Acknowledger,
    BackendKind,
    CloudConfig,
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

/// One message handed out by the service, not yet settled.
pub struct CloudDelivery {
    pub data: Bytes,
    pub ack: Arc<dyn Acknowledger>,
}

/// Raw capabilities of a managed pub/sub service.
#[async_trait::async_trait]
pub trait CloudClient: Send + Sync {
    // ---
    /// Publish one payload, returning the service-assigned message id once
    /// the service accepted it.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<String>;

    /// Start receiving from `subscription` until `cancel` fires.
    ///
    /// The returned channel closes once receiving stopped.
    async fn receive(
        &self,
        subscription: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<CloudDelivery>>;

    /// Liveness probe.
    async fn ping(&self) -> Result<()>;

    /// Flush and release clients. Called once, after receiving stopped.
    async fn close(&self) -> Result<()>;
}

/// Shared client pointer.
pub type CloudClientPtr = Arc<dyn CloudClient>;

/// Forwards only the first ack or nack to the service.
struct SettleOnce {
    delivery: Arc<dyn Acknowledger>,
    settled: AtomicBool,
}

impl SettleOnce {
    fn wrap(delivery: Arc<dyn Acknowledger>) -> AckHandle {
        AckHandle::new(Arc::new(Self {
            delivery,
            settled: AtomicBool::new(false),
        }))
    }
}

#[async_trait::async_trait]
impl Acknowledger for SettleOnce {
    async fn ack(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.delivery.ack().await
    }

    async fn nack(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.delivery.nack().await
    }

    fn redelivers(&self) -> bool {
        true
    }
}

struct Inner {
    client: CloudClientPtr,
    default_topic: Option<String>,
    default_subscription: Option<String>,
    tasks: SubscriptionTasks,
}

/// Broker over a [`CloudClient`].
pub struct CloudPubSub<T> {
    inner: Arc<Inner>,
    _message: PhantomData<fn() -> T>,
}

impl<T> Clone for CloudPubSub<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _message: PhantomData,
        }
    }
}

impl<T: Message> CloudPubSub<T> {
    // ---
    /// Wrap an already connected client.
    pub fn new(
        client: CloudClientPtr,
        default_topic: Option<String>,
        default_subscription: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                default_topic: default_topic.filter(|t| !t.is_empty()),
                default_subscription: default_subscription.filter(|s| !s.is_empty()),
                tasks: SubscriptionTasks::new("cloud"),
            }),
            _message: PhantomData,
        }
    }

    /// Number of subscription tasks still running.
    pub fn active_subscriptions(&self) -> usize {
        self.inner.tasks.len()
    }
}

async fn nack_quietly(name: &str, ack: &Arc<dyn Acknowledger>) {
    if let Err(_err) = ack.nack().await {
        log_warn!("{name}: nack failed: {_err}");
    }
}

/// Decode deliveries and forward them into `tx` until cancelled.
async fn pump<T: Message>(
    name: String,
    mut deliveries: mpsc::Receiver<CloudDelivery>,
    tx: mpsc::Sender<Envelope<T>>,
    cancel: CancellationToken,
) {
    // ---
    loop {
        let delivery = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = deliveries.recv() => match next {
                Some(delivery) => delivery,
                None => {
                    log_debug!("{name}: service stopped delivering");
                    break;
                }
            },
        };

        let msg: T = match serde_json::from_slice(&delivery.data) {
            Ok(msg) => msg,
            Err(_err) => {
                log_warn!("{name}: nacking undecodable delivery: {_err}");
                nack_quietly(&name, &delivery.ack).await;
                continue;
            }
        };

        // Reserve first so a cancelled wait still owns the delivery.
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = tx.reserve() => permit.ok(),
        };

        let Some(permit) = permit else {
            nack_quietly(&name, &delivery.ack).await;
            break;
        };

        permit.send(Envelope::new(msg, SettleOnce::wrap(delivery.ack)));
    }

    // Anything the service already handed over goes back to it.
    deliveries.close();
    while let Ok(delivery) = deliveries.try_recv() {
        nack_quietly(&name, &delivery.ack).await;
    }

    log_debug!("{name}: subscription task stopped");
}

#[async_trait::async_trait]
impl<T: Message> Publisher<T> for CloudPubSub<T> {
    // ---
    /// Encode every message of `input` and publish it to `topic`, awaiting
    /// the service's confirmation for each.
    async fn publish(
        &self,
        ctx: &CancellationToken,
        topic: &str,
        input: mpsc::Receiver<T>,
        workers: usize,
    ) -> Result<()> {
        // ---
        if self.inner.tasks.is_closed() {
            return Err(Error::Closed);
        }
        let topic = resolve_topic(topic, self.inner.default_topic.as_deref(), "topic")?;

        let inner = Arc::clone(&self.inner);
        let worker_ctx = ctx.clone();
        let worker_topic = topic.clone();

        drain_with_workers(ctx, &topic, input, workers, move |msg: T| {
            let inner = Arc::clone(&inner);
            let ctx = worker_ctx.clone();
            let topic = worker_topic.clone();
            async move {
                if inner.tasks.is_closed() {
                    return WorkerStep::Stop;
                }

                let payload = match serde_json::to_vec(&msg) {
                    Ok(payload) => Bytes::from(payload),
                    Err(_err) => {
                        log_warn!("{topic}: dropping message, failed to encode: {_err}");
                        return WorkerStep::Continue;
                    }
                };

                tokio::select! {
                    biased;
                    _ = ctx.cancelled() => WorkerStep::Stop,
                    published = inner.client.publish(&topic, payload) => {
                        match published {
                            Ok(_id) => log_trace!("{topic}: published message {_id}"),
                            Err(_err) => log_warn!("{topic}: dropping message, publish failed: {_err}"),
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
impl<T: Message> Subscriber<T> for CloudPubSub<T> {
    // ---
    /// Start receiving from the service subscription named `subscription`.
    async fn subscribe(&self, ctx: &CancellationToken, subscription: &str) -> Result<Subscription<T>> {
        // ---
        if self.inner.tasks.is_closed() {
            return Err(Error::Closed);
        }
        let name = resolve_topic(
            subscription,
            self.inner.default_subscription.as_deref(),
            "subscription",
        )?;

        let token = self.inner.tasks.child_token();

        let deliveries = tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                token.cancel();
                return Err(Error::Cancelled);
            }
            deliveries = self.inner.client.receive(&name, token.clone()) => deliveries?,
        };

        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let handle = tokio::spawn(pump::<T>(name.clone(), deliveries, tx, token.clone()));

        let Registered::Running(id) = self.inner.tasks.register(handle, &token).await else {
            return Err(Error::Closed);
        };

        log_debug!("{name}: receiving, task {id}");

        let inner = Arc::clone(&self.inner);
        let teardown = Box::pin(async move {
            inner.tasks.stop(id, &token).await;
        });

        Ok(Subscription::new(name, rx, teardown))
    }
}

#[async_trait::async_trait]
impl<T: Message> PubSub<T> for CloudPubSub<T> {
    // ---
    fn backend(&self) -> BackendKind {
        BackendKind::Cloud
    }

    /// Stop every subscription task, then flush and close the client.
    async fn close(&self) -> Result<()> {
        // ---
        if !self.inner.tasks.shutdown().await {
            log_debug!("cloud broker already closed");
            return Ok(());
        }

        self.inner.client.close().await?;
        log_info!("cloud broker closed");
        Ok(())
    }

    async fn ping(&self, ctx: &CancellationToken, timeout: Duration) -> Result<()> {
        if self.inner.tasks.is_closed() {
            return Err(Error::Closed);
        }
        bounded(ctx, timeout, self.inner.client.ping()).await
    }
}

/// Connect to Google Cloud Pub/Sub and wrap it in a [`CloudPubSub`].
///
/// # Errors
///
/// - [`Error::Config`] for a missing project id or when feature `gcp` is off
/// - [`Error::Connection`] when the service cannot be reached within
///   `connect_timeout`
#[cfg(feature = "gcp")]
pub async fn create_gcp_pubsub<T: Message>(config: &CloudConfig) -> Result<PubSubPtr<T>> {
    // ---
    let client = GcpCloudClient::connect(config).await?;
    Ok(Arc::new(CloudPubSub::<T>::new(
        Arc::new(client),
        config.default_topic.clone(),
        config.default_subscription.clone(),
    )))
}

#[cfg(not(feature = "gcp"))]
pub async fn create_gcp_pubsub<T: Message>(config: &CloudConfig) -> Result<PubSubPtr<T>> {
    config.validate()?;
    Err(Error::Config("gcp feature is not enabled".into()))
}
