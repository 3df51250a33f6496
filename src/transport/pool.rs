//! Fixed-size worker pool draining a producer stream.
//!
//! Every backend's `publish` follows the same shape: clamp the worker
//! count, spawn that many tasks over one shared input receiver, and wait
//! for all of them. Only the per-message step differs, so it is passed in
//! as a closure.
//!
//! ## Termination
//!
//! A worker stops when:
//! - the producer closes the input (all senders dropped, buffer drained),
//! - the cancellation token fires,
//! - its per-message step returns [`WorkerStep::Stop`] (e.g. broker closed).
//!
//! ## Ordering
//!
//! Workers take turns on the shared receiver. With one worker, messages
//! are handled strictly in input order. With several, a later message can
//! overtake an earlier one that is still being encoded or sent.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::{log_debug, log_error, DEFAULT_WORKERS};

/// Outcome of handling one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerStep {
    /// Keep draining.
    Continue,
    /// Stop this worker; the others notice on their own.
    Stop,
}

/// Clamp a caller-supplied worker count.
pub(crate) fn worker_count(workers: usize) -> usize {
    if workers == 0 {
        DEFAULT_WORKERS
    } else {
        workers
    }
}

/// Drain `input` with `workers` tasks, running `step` on every message.
///
/// Returns once every worker has exited. A panicking step is logged and
/// takes down only its own worker.
pub(crate) async fn drain_with_workers<T, F, Fut>(
    ctx: &CancellationToken,
    label: &str,
    input: mpsc::Receiver<T>,
    workers: usize,
    step: F,
) where
    T: Send + 'static,
    F: Fn(T) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = WorkerStep> + Send + 'static,
{
    // ---
    let workers = worker_count(workers);
    let input = Arc::new(Mutex::new(input));
    let mut pool = JoinSet::new();

    log_debug!("{label}: starting publisher with {workers} worker(s)");

    for worker_id in 0..workers {
        let input = Arc::clone(&input);
        let ctx = ctx.clone();
        let step = step.clone();
        let label = label.to_string();

        pool.spawn(async move {
            let mut handled: u64 = 0;

            loop {
                let next = tokio::select! {
                    biased;
                    _ = ctx.cancelled() => break,
                    next = async { input.lock().await.recv().await } => next,
                };

                let Some(msg) = next else {
                    break;
                };

                handled += 1;
                if step(msg).await == WorkerStep::Stop {
                    break;
                }
            }

            log_debug!("{label}: publisher worker {worker_id} finished after {handled} message(s)");
        });
    }

    while let Some(joined) = pool.join_next().await {
        if let Err(_err) = joined {
            log_error!("{label}: publisher worker aborted: {_err}");
        }
    }
}
