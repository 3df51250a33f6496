//! One publish/subscribe contract over interchangeable backends.
//!
//! Producers hand a stream of typed messages to a [`Publisher`]; consumers
//! attach to a topic through a [`Subscriber`] and read [`Envelope`]s from a
//! [`Subscription`]. The same contract is served by:
//!
//! - an in-process broker ([`InMemoryPubSub`]), always available
//! - a key/value store pub/sub channel ([`ChannelPubSub`], Redis binding
//!   behind feature `redis`)
//! - a managed cloud service with ack/nack ([`CloudPubSub`], Google Cloud
//!   Pub/Sub binding behind feature `gcp`)
//!
//! Every blocking call takes a [`CancellationToken`].
//!

// Import all sub modules once...
mod builder;
mod config;
mod domain;
mod error;
mod macros;
mod retry;
mod transport;

pub(crate) use macros::{log_debug, log_error, log_info, log_trace, log_warn};

// Re-export main types
pub use builder::PubSubBuilder;

pub use config::{
    //
    CloudConfig,
    RedisConfig,
    DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_WORKERS,
    MAILBOX_CAPACITY,
};

pub use error::{Error, Result};
pub use retry::RetryConfig;

#[allow(unused_imports)]
pub(crate) use retry::retry_with_backoff;

pub use tokio_util::sync::CancellationToken;

// --- public re-exports
pub use domain::{
    //
    AckHandle,
    Acknowledger,
    BackendKind,
    Envelope,
    Inbox,
    Message,
    PubSub,
    PubSubPtr,
    Publisher,
    Subscriber,
    Subscription,
    SubscriptionState,
};

pub(crate) use domain::{bounded, resolve_topic};

pub use transport::{
    //
    create_gcp_pubsub,
    create_memory_pubsub,
    create_redis_pubsub,
    ChannelFeed,
    ChannelPubSub,
    ChannelStore,
    ChannelStorePtr,
    CloudClient,
    CloudClientPtr,
    CloudDelivery,
    CloudPubSub,
    InMemoryPubSub,
};

#[cfg(feature = "redis")]
pub use transport::RedisChannelStore;

#[cfg(feature = "gcp")]
pub use transport::GcpCloudClient;

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock_ignore_poison<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
