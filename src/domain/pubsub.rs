// src/domain/pubsub.rs

//! Publish/subscribe domain abstractions.
//!
//! This module defines the broker contract shared by every backend. It
//! intentionally avoids any reference to concrete brokers or client
//! libraries; those live under `src/transport/`.
//!
//! The in-process backend is the reference implementation of these
//! semantics. Backends document where they deviate, most importantly in
//! what `ack`/`nack` mean (see [`Envelope`](crate::Envelope)).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result, Subscription};

/// Payload types a broker can carry.
///
/// External backends put the plain JSON encoding of the value on the wire,
/// without added metadata. The in-process backend round-trips through the
/// same encoding so every backend rejects the same payloads.
pub trait Message: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Message for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Which delivery backend a broker is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// In-process, memory resident, best effort.
    Memory,
    /// Key/value store pub/sub channel, fire-and-forget.
    Channel,
    /// Managed durable service with ack/nack and redelivery.
    Cloud,
}

impl BackendKind {
    /// Whether envelopes from this backend are redelivered on nack.
    pub fn redelivers(self) -> bool {
        matches!(self, BackendKind::Cloud)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Memory => "memory",
            BackendKind::Channel => "channel",
            BackendKind::Cloud => "cloud",
        };
        f.write_str(name)
    }
}

/// Publishing half of the broker contract.
#[async_trait::async_trait]
pub trait Publisher<T: Message>: Send + Sync {
    // ---
    /// Drain `input` with `workers` concurrent tasks and deliver every
    /// message to `topic`.
    ///
    /// `workers` is clamped to at least one. The call returns once the
    /// producer closes `input` and every worker has finished, or once
    /// `ctx` is cancelled. Spawn it on a task to stream in the background.
    ///
    /// With one worker, messages reach each subscriber in the order they
    /// were produced. With several workers, ordering between messages is
    /// not guaranteed.
    ///
    /// Per-message encode/decode/backend failures are logged and the
    /// message is skipped; they never surface here.
    ///
    /// # Errors
    ///
    /// - [`Error::Closed`] if the broker was closed
    /// - [`Error::Config`] if `topic` is empty and no default is configured
    async fn publish(
        &self,
        ctx: &CancellationToken,
        topic: &str,
        input: mpsc::Receiver<T>,
        workers: usize,
    ) -> Result<()>;
}

/// Subscribing half of the broker contract.
#[async_trait::async_trait]
pub trait Subscriber<T: Message>: Send + Sync {
    // ---
    /// Attach a new subscription to `topic`.
    ///
    /// Once this returns, messages published afterwards are deliverable to
    /// the returned handle.
    ///
    /// # Errors
    ///
    /// - [`Error::Closed`] if the broker was closed
    /// - [`Error::Config`] if `topic` is empty and no default is configured
    /// - [`Error::Connection`] if the backend refused the subscription
    async fn subscribe(&self, ctx: &CancellationToken, topic: &str) -> Result<Subscription<T>>;
}

/// Full broker contract.
#[async_trait::async_trait]
pub trait PubSub<T: Message>: Publisher<T> + Subscriber<T> {
    // ---
    /// Backend this broker is bound to.
    fn backend(&self) -> BackendKind;

    /// Shut the broker down.
    ///
    /// Closes every outstanding subscription mailbox and releases backend
    /// resources. Safe to call any number of times from any number of tasks.
    async fn close(&self) -> Result<()>;

    /// Check backend liveness within `timeout`.
    async fn ping(&self, ctx: &CancellationToken, timeout: Duration) -> Result<()>;
}

/// Shared broker pointer.
///
/// `.clone()` only bumps a reference count; clones share the backend.
pub type PubSubPtr<T> = Arc<dyn PubSub<T>>;

/// Pick the explicit topic, falling back to the backend default.
pub(crate) fn resolve_topic(topic: &str, default: Option<&str>, what: &str) -> Result<String> {
    if !topic.is_empty() {
        return Ok(topic.to_string());
    }
    match default {
        Some(default) if !default.is_empty() => Ok(default.to_string()),
        _ => Err(Error::Config(format!("{what} is required"))),
    }
}

/// Run `fut` unless `ctx` fires first or `timeout` elapses.
pub(crate) async fn bounded<F, T>(ctx: &CancellationToken, timeout: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(Error::Cancelled),
        result = tokio::time::timeout(timeout, fut) => result.map_err(|_| Error::Timeout)?,
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn explicit_topic_wins() {
        assert_eq!(resolve_topic("orders", Some("fallback"), "topic").unwrap(), "orders");
    }

    #[test]
    fn empty_topic_uses_default() {
        assert_eq!(resolve_topic("", Some("fallback"), "topic").unwrap(), "fallback");
    }

    #[test]
    fn empty_topic_without_default_is_config_error() {
        let err = resolve_topic("", None, "channel").unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg == "channel is required"));
        assert!(resolve_topic("", Some(""), "topic").is_err());
    }

    #[test]
    fn only_cloud_redelivers() {
        assert!(BackendKind::Cloud.redelivers());
        assert!(!BackendKind::Memory.redelivers());
        assert!(!BackendKind::Channel.redelivers());
        assert_eq!(BackendKind::Channel.to_string(), "channel");
    }
}
