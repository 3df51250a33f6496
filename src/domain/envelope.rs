// src/domain/envelope.rs

//! Delivered messages and their acknowledgment handles.
//!
//! An [`Envelope`] is one decoded message plus the ack/nack callbacks of the
//! backend that delivered it. The payload is owned by the consumer; no
//! backend keeps a reference to it after delivery.
//!
//! ## Acknowledgment semantics differ by backend
//!
//! | backend        | `ack`  | `nack`                         |
//! |----------------|--------|--------------------------------|
//! | in-process     | no-op  | no-op                          |
//! | channel-store  | no-op  | no-op                          |
//! | managed cloud  | settle | redelivery by the service      |
//!
//! Callers must not assume uniform at-least-once delivery; use
//! [`Envelope::redelivers`] when behavior has to branch on it.

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Backend side of an envelope's ack/nack pair.
#[async_trait::async_trait]
pub trait Acknowledger: Send + Sync {
    // ---
    /// Signal successful processing.
    async fn ack(&self) -> Result<()>;

    /// Signal failed processing.
    async fn nack(&self) -> Result<()>;

    /// Whether `nack` (or a missing ack) causes the message to be redelivered.
    fn redelivers(&self) -> bool {
        false
    }
}

/// Acknowledger for fire-and-forget backends.
pub(crate) struct NoopAck;

#[async_trait::async_trait]
impl Acknowledger for NoopAck {
    async fn ack(&self) -> Result<()> {
        Ok(())
    }

    async fn nack(&self) -> Result<()> {
        Ok(())
    }
}

/// Cloneable ack/nack handle detached from the payload.
///
/// Obtained from [`Envelope::into_parts`] when the payload has to move
/// somewhere else before processing finishes.
#[derive(Clone)]
pub struct AckHandle {
    inner: Arc<dyn Acknowledger>,
}

impl AckHandle {
    pub(crate) fn new(inner: Arc<dyn Acknowledger>) -> Self {
        Self { inner }
    }

    pub(crate) fn noop() -> Self {
        Self::new(Arc::new(NoopAck))
    }

    /// Acknowledge, giving up with [`Error::Cancelled`] if `ctx` fires first.
    pub async fn ack(&self, ctx: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(Error::Cancelled),
            result = self.inner.ack() => result,
        }
    }

    /// Negative-acknowledge, giving up with [`Error::Cancelled`] if `ctx` fires first.
    pub async fn nack(&self, ctx: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(Error::Cancelled),
            result = self.inner.nack() => result,
        }
    }

    /// See [`Acknowledger::redelivers`].
    pub fn redelivers(&self) -> bool {
        self.inner.redelivers()
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle")
            .field("redelivers", &self.redelivers())
            .finish()
    }
}

/// One delivered message.
///
/// # Example
///
/// ```no_run
/// # use mom_pubsub::Subscription;
/// # use tokio_util::sync::CancellationToken;
/// # async fn example(sub: Subscription<String>) -> mom_pubsub::Result<()> {
/// let ctx = CancellationToken::new();
/// let envelope = sub.bpop(&ctx).await?;
/// println!("got {}", envelope.data());
/// envelope.ack(&ctx).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Envelope<T> {
    payload: T,
    ack: AckHandle,
}

impl<T> Envelope<T> {
    // ---
    pub(crate) fn new(payload: T, ack: AckHandle) -> Self {
        Self { payload, ack }
    }

    /// Envelope whose ack and nack do nothing.
    pub(crate) fn unacknowledged(payload: T) -> Self {
        Self::new(payload, AckHandle::noop())
    }

    /// Borrow the decoded payload.
    pub fn data(&self) -> &T {
        &self.payload
    }

    /// Take the payload, discarding the ack handle.
    ///
    /// On the managed cloud backend an envelope that is never acked is
    /// redelivered once the service's ack deadline passes.
    pub fn into_data(self) -> T {
        self.payload
    }

    /// Split into payload and ack handle.
    pub fn into_parts(self) -> (T, AckHandle) {
        (self.payload, self.ack)
    }

    /// See [`AckHandle::ack`].
    pub async fn ack(&self, ctx: &CancellationToken) -> Result<()> {
        self.ack.ack(ctx).await
    }

    /// See [`AckHandle::nack`].
    pub async fn nack(&self, ctx: &CancellationToken) -> Result<()> {
        self.ack.nack(ctx).await
    }

    /// Whether this envelope came from a backend that redelivers on nack.
    pub fn redelivers(&self) -> bool {
        self.ack.redelivers()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    struct Stuck;

    #[async_trait::async_trait]
    impl Acknowledger for Stuck {
        async fn ack(&self) -> Result<()> {
            std::future::pending().await
        }

        async fn nack(&self) -> Result<()> {
            std::future::pending().await
        }

        fn redelivers(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn noop_envelope_acks_and_nacks() {
        let ctx = CancellationToken::new();
        let envelope = Envelope::unacknowledged("hello".to_string());

        assert_eq!(envelope.data(), "hello");
        assert!(!envelope.redelivers());
        envelope.ack(&ctx).await.unwrap();
        envelope.nack(&ctx).await.unwrap();
        assert_eq!(envelope.into_data(), "hello");
    }

    #[tokio::test]
    async fn ack_honours_cancellation() {
        let ctx = CancellationToken::new();
        ctx.cancel();

        let envelope = Envelope::new(1u32, AckHandle::new(Arc::new(Stuck)));
        assert!(envelope.redelivers());
        assert!(matches!(envelope.ack(&ctx).await, Err(Error::Cancelled)));
        assert!(matches!(envelope.nack(&ctx).await, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn into_parts_keeps_handle_usable() {
        let ctx = CancellationToken::new();
        let (payload, handle) = Envelope::unacknowledged(7u8).into_parts();

        assert_eq!(payload, 7);
        handle.clone().ack(&ctx).await.unwrap();
        handle.nack(&ctx).await.unwrap();
    }
}
