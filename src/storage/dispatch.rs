//! Expiration Dispatch
//!
//! A fixed pool of Tokio tasks drains a bounded queue of expired entries and
//! hands each one to the user's [`ExpirationListener`].
//!
//! ```text
//!   Reaper ──send().await──> [ bounded mpsc queue ] ──> worker 0 ─┐
//!                                                  ├──> worker 1 ─┼─> listener.on_expire(k, v)
//!                                                  └──> worker N ─┘
//! ```
//!
//! ## Backpressure
//!
//! When the queue is full the reaper waits for a free slot. The entries are
//! already gone from the store at that point, so a saturated pool only delays
//! notifications; it never delays or loses deletions, and the number of
//! concurrent listener calls never exceeds the worker count.
//!
//! ## Shutdown
//!
//! Workers exit once every [`Dispatcher`] is dropped and the queue is empty,
//! so nothing that was handed to the pool is lost on stop.

use crate::listener::ExpirationListener;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Sending half of the dispatch queue, owned by the reaper.
#[derive(Debug)]
pub(crate) struct Dispatcher<K, V> {
    tx: mpsc::Sender<(K, V)>,
}

impl<K, V> Dispatcher<K, V> {
    /// Queues one expired entry, waiting for space if the queue is full.
    ///
    /// Returns `false`, dropping the entry, if every worker is gone.
    pub(crate) async fn dispatch(&self, key: K, value: V) -> bool {
        self.tx.send((key, value)).await.is_ok()
    }
}

/// Join handles of the running workers.
#[derive(Debug)]
pub(crate) struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `workers` tasks on `runtime` sharing a queue of `capacity`
    /// slots.
    pub(crate) fn spawn<K, V>(
        listener: Arc<dyn ExpirationListener<K, V>>,
        workers: usize,
        capacity: usize,
        runtime: &Handle,
    ) -> (Dispatcher<K, V>, Self)
    where
        K: Send + 'static,
        V: Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity);
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..workers)
            .map(|worker| {
                runtime.spawn(worker_loop(worker, Arc::clone(&rx), Arc::clone(&listener)))
            })
            .collect();

        (Dispatcher { tx }, Self { workers })
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.workers.len()
    }

    /// Waits for every worker to drain the queue and exit.
    ///
    /// The queue only closes once the matching [`Dispatcher`] is dropped.
    pub(crate) async fn join(self) {
        for handle in self.workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "Expiration worker ended abnormally");
            }
        }
    }
}

async fn worker_loop<K: 'static, V: 'static>(
    worker: usize,
    rx: Arc<Mutex<mpsc::Receiver<(K, V)>>>,
    listener: Arc<dyn ExpirationListener<K, V>>,
) {
    loop {
        // The guard is dropped before the listener runs so other workers
        // can pick up the next entry meanwhile.
        let next = rx.lock().await.recv().await;
        let Some((key, value)) = next else {
            break;
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_expire(key, value)));
        if outcome.is_err() {
            error!(worker, "Expiration listener panicked");
        }
    }
    debug!(worker, "Expiration worker finished");
}
