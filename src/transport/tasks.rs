//! Background task bookkeeping for backend-driven subscriptions.
//!
//! The channel and cloud adapters run one receive task per subscription.
//! Every task runs under a child of one root cancellation token, so a broker
//! close reaches all of them at once. Whoever removes a task's handle from
//! the set is the one that awaits it: the subscription teardown normally,
//! the broker shutdown for whatever is still running at that point.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{lock_ignore_poison, log_error};

struct Running {
    closed: bool,
    next_id: u64,
    handles: HashMap<u64, JoinHandle<()>>,
}

pub(crate) struct SubscriptionTasks {
    label: &'static str,
    root: CancellationToken,
    running: Mutex<Running>,
}

/// Outcome of [`SubscriptionTasks::register`].
pub(crate) enum Registered {
    Running(u64),
    /// The set was shut down while the task was starting; it has been stopped.
    Rejected,
}

impl SubscriptionTasks {
    // ---
    pub(crate) fn new(label: &'static str) -> Self {
        Self {
            label,
            root: CancellationToken::new(),
            running: Mutex::new(Running {
                closed: false,
                next_id: 0,
                handles: HashMap::new(),
            }),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        lock_ignore_poison(&self.running).closed
    }

    pub(crate) fn len(&self) -> usize {
        lock_ignore_poison(&self.running).handles.len()
    }

    /// Token for a new task, cancelled at the latest on shutdown.
    pub(crate) fn child_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// Track a spawned task running under `token`.
    pub(crate) async fn register(&self, handle: JoinHandle<()>, token: &CancellationToken) -> Registered {
        // ---
        {
            let mut running = lock_ignore_poison(&self.running);
            if !running.closed {
                let id = running.next_id;
                running.next_id += 1;
                running.handles.insert(id, handle);
                return Registered::Running(id);
            }
        }

        token.cancel();
        self.join(handle).await;
        Registered::Rejected
    }

    /// Cancel one task and wait for it, unless shutdown already did.
    pub(crate) async fn stop(&self, id: u64, token: &CancellationToken) {
        // ---
        token.cancel();

        let handle = lock_ignore_poison(&self.running).handles.remove(&id);
        if let Some(handle) = handle {
            self.join(handle).await;
        }
    }

    /// Cancel every task and wait for all of them.
    ///
    /// Returns `false` if the set was already shut down.
    pub(crate) async fn shutdown(&self) -> bool {
        // ---
        let handles = {
            let mut running = lock_ignore_poison(&self.running);
            if running.closed {
                return false;
            }
            running.closed = true;
            std::mem::take(&mut running.handles)
        };

        self.root.cancel();

        for (_, handle) in handles {
            self.join(handle).await;
        }
        true
    }

    async fn join(&self, handle: JoinHandle<()>) {
        if let Err(_err) = handle.await {
            log_error!("{}: subscription task aborted: {_err}", self.label);
        }
    }
}
