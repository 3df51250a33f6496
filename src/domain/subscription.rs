// src/domain/subscription.rs

//! Per-consumer subscription handle.
//!
//! A [`Subscription`] wraps a bounded mailbox of [`Envelope`]s fed by one
//! backend. It offers blocking and timed reads plus a one-time close.
//!
//! ## Lifecycle
//!
//! ```text
//! Open --close()--> Closing (backend teardown runs) --> Closed (mailbox closed)
//! ```
//!
//! `Closed` is terminal. Reads after close drain whatever was already
//! buffered, then report [`Error::SubscriptionClosed`].
//!
//! The mailbox is closed by dropping every sender, never by the reader.
//! Each backend's teardown guarantees that its senders are gone once it
//! completes; in the in-process backend that happens under the dispatch
//! lock so no send can be in flight at that moment.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{mpsc, MutexGuard, OnceCell};
use tokio_util::sync::CancellationToken;

use super::BoxFuture;
use crate::{lock_ignore_poison, log_debug, Envelope, Error, Result};

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Observable lifecycle state of a [`Subscription`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Open,
    Closing,
    Closed,
}

/// Direct access to a subscription mailbox, see [`Subscription::read`].
pub type Inbox<'a, T> = MutexGuard<'a, mpsc::Receiver<Envelope<T>>>;

/// Consumer handle returned by `subscribe`.
///
/// All methods take `&self`; a subscription can be shared behind an `Arc`
/// and closed from any number of tasks while another task is reading.
///
/// Dropping an open subscription schedules its teardown on the current
/// tokio runtime, so forgetting `close()` does not leak a registration.
pub struct Subscription<T> {
    // ---
    name: String,
    inbox: tokio::sync::Mutex<mpsc::Receiver<Envelope<T>>>,
    teardown: Mutex<Option<BoxFuture<'static, ()>>>,
    close_once: OnceCell<()>,
    state: AtomicU8,
}

impl<T: Send + 'static> Subscription<T> {
    // ---
    /// Wrap a mailbox receiver.
    ///
    /// `teardown` must release every sender feeding `inbox` (directly or by
    /// stopping the task that owns them) before it completes.
    pub(crate) fn new(
        name: impl Into<String>,
        inbox: mpsc::Receiver<Envelope<T>>,
        teardown: BoxFuture<'static, ()>,
    ) -> Self {
        Self {
            name: name.into(),
            inbox: tokio::sync::Mutex::new(inbox),
            teardown: Mutex::new(Some(teardown)),
            close_once: OnceCell::new(),
            state: AtomicU8::new(OPEN),
        }
    }

    /// Topic, channel or subscription name this handle is attached to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SubscriptionState {
        match self.state.load(Ordering::Acquire) {
            OPEN => SubscriptionState::Open,
            CLOSING => SubscriptionState::Closing,
            _ => SubscriptionState::Closed,
        }
    }

    /// Whether `close()` has completed.
    pub fn is_closed(&self) -> bool {
        self.state() == SubscriptionState::Closed
    }

    /// Exclusive access to the underlying mailbox receiver.
    ///
    /// Intended for integration with external `select!` loops. Other reads
    /// on this subscription wait while the guard is held.
    ///
    /// ```no_run
    /// # use mom_pubsub::Subscription;
    /// # async fn example(sub: Subscription<String>) {
    /// let mut inbox = sub.read().await;
    /// while let Some(envelope) = inbox.recv().await {
    ///     println!("{}", envelope.data());
    /// }
    /// # }
    /// ```
    pub async fn read(&self) -> Inbox<'_, T> {
        self.inbox.lock().await
    }

    /// Wait for the next envelope.
    ///
    /// # Errors
    ///
    /// - [`Error::SubscriptionClosed`] once the mailbox is closed and drained
    /// - [`Error::Cancelled`] if `ctx` fires first
    pub async fn bpop(&self, ctx: &CancellationToken) -> Result<Envelope<T>> {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(Error::Cancelled),
            msg = self.recv() => msg.ok_or(Error::SubscriptionClosed),
        }
    }

    /// Wait for the next envelope for at most `timeout`.
    ///
    /// The timer lives inside the `select!` and is dropped on every exit path.
    ///
    /// # Errors
    ///
    /// As [`bpop`](Self::bpop), plus [`Error::Timeout`] when no message
    /// arrives in time.
    pub async fn pop(&self, ctx: &CancellationToken, timeout: Duration) -> Result<Envelope<T>> {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(Error::Cancelled),
            msg = self.recv() => msg.ok_or(Error::SubscriptionClosed),
            _ = tokio::time::sleep(timeout) => Err(Error::Timeout),
        }
    }

    /// Close the subscription.
    ///
    /// The first call runs the backend teardown and closes the mailbox;
    /// concurrent callers wait for it to finish, later callers return at once.
    pub async fn close(&self) {
        // ---
        self.close_once
            .get_or_init(|| async {
                self.state.store(CLOSING, Ordering::Release);

                let teardown = lock_ignore_poison(&self.teardown).take();
                if let Some(teardown) = teardown {
                    // Run detached so a cancelled close() cannot stop teardown halfway.
                    if let Err(err) = tokio::spawn(teardown).await {
                        crate::log_error!("{}: subscription teardown failed: {err}", self.name);
                    }
                }

                // Readers holding the inbox observe closure through the dropped senders.
                if let Ok(mut inbox) = self.inbox.try_lock() {
                    inbox.close();
                }

                self.state.store(CLOSED, Ordering::Release);
                log_debug!("{}: subscription closed", self.name);
            })
            .await;
    }

    async fn recv(&self) -> Option<Envelope<T>> {
        self.inbox.lock().await.recv().await
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        let teardown = lock_ignore_poison(&self.teardown).take();
        let Some(teardown) = teardown else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                log_debug!("{}: dropped while open, scheduling teardown", self.name);
                handle.spawn(teardown);
            }
            Err(_) => {
                crate::log_warn!("{}: dropped outside a runtime, teardown skipped", self.name);
            }
        }
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .field("state", &self.state.load(Ordering::Acquire))
            .finish()
    }
}
