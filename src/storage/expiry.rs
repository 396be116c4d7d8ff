//! Background Expiry Reaper
//!
//! This module implements the task that removes entries once their expiry
//! has passed. Unlike a periodic sweep, the reaper sleeps exactly until the
//! earliest expiry in the heap, and any mutation that moves that minimum
//! earlier wakes it up right away.
//!
//! ## State machine
//!
//! ```text
//!            heap empty                     heap non-empty
//!   ┌────────────────────────┐       ┌─────────────────────────────┐
//!   │ IDLE                   │──────>│ ARMED                       │
//!   │ wait: wake | idle_poll │<──────│ wait: wake | sleep_until(min)│
//!   └────────────────────────┘       └──────────────┬──────────────┘
//!              ▲                                    │ min <= now
//!              │                      ┌─────────────▼──────────────┐
//!              └──────────────────────│ DRAINING                   │
//!                                     │ pop all due under the lock, │
//!                                     │ then dispatch without it    │
//!                                     └────────────────────────────┘
//!   any state ── shutdown ──> STOPPED (after the current drain is handed off)
//! ```
//!
//! ## Wake protocol
//!
//! Mutations call [`Shared::notify`], which uses [`Notify::notify_one`].
//! A notification posted while the reaper is between computing its deadline
//! and awaiting it is kept as a single permit, so no wake is lost; several
//! notifications before the reaper looks again collapse into one.

use crate::error::{Error, Result};
use crate::listener::ExpirationListener;
use crate::storage::dispatch::{Dispatcher, WorkerPool};
use crate::storage::engine::{Signal, Store};
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

/// Configuration for the reaper and its dispatch workers.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Number of tasks delivering expiration callbacks (default: 4).
    /// Zero selects the default.
    pub workers: usize,

    /// Expired entries that may wait for a worker before the reaper
    /// itself waits (default: 1024)
    pub queue_capacity: usize,

    /// How long an idle reaper sleeps without a wake signal (default: 1s)
    pub idle_poll: Duration,
}

/// Worker count used when none is configured.
pub const DEFAULT_WORKERS: usize = 4;

/// Dispatch queue size used when none is configured.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            idle_poll: Duration::from_secs(1),
        }
    }
}

impl ReaperConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::InvalidConfig("queue_capacity must be greater than 0"));
        }
        if self.idle_poll.is_zero() {
            return Err(Error::InvalidConfig("idle_poll must be greater than 0"));
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn worker_count(&self) -> usize {
        if self.workers == 0 {
            DEFAULT_WORKERS
        } else {
            self.workers
        }
    }
}

/// State shared by the map handle and the reaper task.
#[derive(Debug)]
pub(crate) struct Shared<K, V> {
    store: RwLock<Store<K, V>>,
    wake: Notify,
}

impl<K, V> Shared<K, V>
where
    K: Hash + Eq + Clone,
{
    #[cfg(test)]
    pub(crate) fn new() -> Self {
        Self::with_capacity(0)
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            store: RwLock::new(Store::with_capacity(capacity)),
            wake: Notify::new(),
        }
    }

    // User code only ever runs under the read half, which does not poison,
    // so a poisoned guard still protects a consistent store.
    #[inline]
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Store<K, V>> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Store<K, V>> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wakes the reaper if a mutation moved the heap minimum.
    #[inline]
    pub(crate) fn notify(&self, signal: Signal) {
        if signal == Signal::Wake {
            self.wake.notify_one();
        }
    }
}

/// A running reaper plus its worker pool.
#[derive(Debug)]
pub(crate) struct Reaper {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    pool: Option<WorkerPool>,
}

impl Reaper {
    /// Spawns the reaper task, and a worker pool if there is a listener.
    pub(crate) fn spawn<K, V>(
        shared: Arc<Shared<K, V>>,
        listener: Option<Arc<dyn ExpirationListener<K, V>>>,
        config: &ReaperConfig,
        runtime: &Handle,
    ) -> Self
    where
        K: Hash + Eq + Clone + Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (dispatcher, pool) = match listener {
            Some(listener) => {
                let (dispatcher, pool) = WorkerPool::spawn(
                    listener,
                    config.worker_count(),
                    config.queue_capacity,
                    runtime,
                );
                (Some(dispatcher), Some(pool))
            }
            None => (None, None),
        };

        let task = runtime.spawn(reaper_loop(
            shared,
            dispatcher,
            config.idle_poll,
            shutdown_rx,
        ));

        info!(
            workers = pool.as_ref().map_or(0, WorkerPool::len),
            "Expiry reaper started"
        );

        Self {
            shutdown_tx,
            task,
            pool,
        }
    }

    /// Asks the reaper to stop without waiting for it.
    pub(crate) fn signal_stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Stops the reaper, then waits until every popped entry has been
    /// delivered and all workers have exited.
    pub(crate) async fn shutdown(self) {
        self.signal_stop();

        if let Err(e) = self.task.await {
            warn!(error = %e, "Expiry reaper ended abnormally");
        }
        // The reaper owned the only dispatcher; its exit closes the queue.
        if let Some(pool) = self.pool {
            pool.join().await;
        }
        info!("Expiry reaper stopped");
    }
}

/// The main reaper loop.
async fn reaper_loop<K, V>(
    shared: Arc<Shared<K, V>>,
    mut dispatcher: Option<Dispatcher<K, V>>,
    idle_poll: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    K: Hash + Eq + Clone,
{
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let now = Instant::now();
        let (due, next, pending) = {
            let mut store = shared.write();
            let due = store.pop_due(now);
            (due, store.next_deadline(), store.temporary_len())
        };

        if !due.is_empty() {
            debug!(expired = due.len(), pending, "Expired entries reaped");
            let mut dropped = 0;
            if let Some(active) = &dispatcher {
                let mut due = due.into_iter();
                for (key, value) in due.by_ref() {
                    if !active.dispatch(key, value).await {
                        dropped = 1;
                        break;
                    }
                }
                dropped += due.len();
            }
            if dropped > 0 {
                // Entries stay deleted; only their notifications are lost.
                warn!(dropped, "Expiration workers are gone, notifications disabled");
                dispatcher = None;
            }
            continue;
        }

        // An idle poll too long to represent leaves only the wake and
        // shutdown branches armed.
        let deadline = next.or_else(|| now.checked_add(idle_poll));

        tokio::select! {
            _ = sleep_until(deadline.unwrap_or(now)), if deadline.is_some() => {
                trace!(armed = next.is_some(), "Reaper timer fired");
            }
            _ = shared.wake.notified() => {
                trace!("Reaper woken early");
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Expiry reaper received shutdown signal");
                    break;
                }
            }
        }
    }
}
