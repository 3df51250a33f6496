//! Domain layer public interface.
//!
//! This module defines domain-level abstractions that are independent of
//! backend implementations or client libraries.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod envelope;
mod pubsub;
mod subscription;

/// Boxed, sendable future used for teardown routines.
pub(crate) type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

// --- Envelope re-exports ---

pub use envelope::{
    //
    AckHandle,
    Acknowledger,
    Envelope,
};

// --- Broker contract re-exports ---

pub use pubsub::{
    //
    BackendKind,
    Message,
    PubSub,
    PubSubPtr,
    Publisher,
    Subscriber,
};

pub(crate) use pubsub::{bounded, resolve_topic};

// --- Subscription re-exports ---

pub use subscription::{
    //
    Inbox,
    Subscription,
    SubscriptionState,
};
