//! The public map handle.
//!
//! [`TimedMap`] owns the shared store, the expiration listener and the
//! running reaper. Every operation takes the store lock once: reads take the
//! shared form, mutations the exclusive form. The only user code run under
//! the lock is the visitor passed to [`TimedMap::for_each`].

use crate::error::{Error, Result};
use crate::listener::ExpirationListener;
use crate::storage::engine::{Expiry, Stats};
use crate::storage::expiry::{Reaper, ReaperConfig, Shared};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::debug;

/// A concurrent key-value map whose entries expire on their own.
///
/// Each entry is either permanent or carries an absolute [`Expiry`]. A
/// background reaper deletes entries as soon as they fall due and hands them
/// to the [`ExpirationListener`], if one was configured, on a bounded pool
/// of worker tasks.
///
/// The reaper and workers run on the Tokio runtime that was current when the
/// map was built. Reads never evict; an entry stays visible to [`get`] until
/// the reaper removes it.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use timedmap::{Expiry, TimedMap};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), timedmap::Error> {
/// let map = TimedMap::new(|key: &'static str, _value: u32| println!("{key} expired"), 2)?;
///
/// map.set_permanent("config", 1);
/// map.set_with_ttl("session", 2, Duration::from_secs(60));
///
/// assert_eq!(map.get("config"), Some((1, Expiry::Permanent)));
/// assert_eq!(map.len(), 2);
///
/// map.stop().await;
/// # Ok(())
/// # }
/// ```
///
/// [`get`]: TimedMap::get
pub struct TimedMap<K, V> {
    shared: Arc<Shared<K, V>>,
    listener: Option<Arc<dyn ExpirationListener<K, V>>>,
    config: ReaperConfig,
    runtime: Handle,
    reaper: Mutex<Option<Reaper>>,
    /// Held for the whole of `stop` so concurrent callers all wait for the
    /// drain.
    stopping: AsyncMutex<()>,
}

impl<K, V> std::fmt::Debug for TimedMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimedMap")
            .field("listener", &self.listener.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<K, V> TimedMap<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Creates a map that reports expirations to `listener` using `workers`
    /// dispatch tasks (zero selects the default of 4).
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<L>(listener: L, workers: usize) -> Result<Self>
    where
        L: ExpirationListener<K, V>,
    {
        Self::builder().listener(listener).workers(workers).build()
    }

    /// Returns a builder for a map with custom settings.
    pub fn builder() -> TimedMapBuilder<K, V> {
        TimedMapBuilder::new()
    }

    #[inline]
    fn lock_reaper(&self) -> MutexGuard<'_, Option<Reaper>> {
        self.reaper.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Inserts or updates `key` so that it never expires.
    pub fn set_permanent(&self, key: K, value: V) {
        self.shared.write().set_permanent(key, value);
    }

    /// Inserts or updates `key` with an absolute expiry.
    ///
    /// [`Expiry::Permanent`] behaves like [`set_permanent`](Self::set_permanent).
    /// An instant that already passed is accepted; the reaper removes the
    /// entry on its next pass and reports it as expired.
    pub fn set_temporary(&self, key: K, value: V, expires_at: impl Into<Expiry>) {
        let signal = self
            .shared
            .write()
            .set_temporary(key, value, expires_at.into());
        self.shared.notify(signal);
    }

    /// Inserts or updates `key` to expire `ttl` from now. A zero `ttl`
    /// makes the entry permanent.
    pub fn set_with_ttl(&self, key: K, value: V, ttl: Duration) {
        self.set_temporary(key, value, Expiry::after(ttl));
    }

    /// Removes `key`. Returns `true` if it was present.
    ///
    /// The listener is not called for removed keys.
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shared.write().remove(key)
    }

    /// Removes every key in `keys` under one lock. Returns how many existed.
    pub fn remove_many<Q>(&self, keys: &[&Q]) -> usize
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut store = self.shared.write();
        keys.iter().filter(|key| store.remove(**key)).count()
    }

    /// Drops every entry without notifying the listener and without
    /// touching the counters in [`Stats`].
    pub fn remove_all(&self) {
        let cleared = {
            let mut store = self.shared.write();
            let cleared = store.len();
            store.remove_all();
            cleared
        };
        debug!(cleared, "Removed all entries");
    }

    /// Stops `key` from expiring. Returns `false` if the key is absent;
    /// calling it on a permanent key is a no-op that returns `true`.
    pub fn make_permanent<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shared.write().make_permanent(key)
    }

    /// Changes the expiry of an existing key and reports whether the key is
    /// still live afterwards.
    ///
    /// - absent key: `false`
    /// - [`Expiry::Permanent`]: same as [`make_permanent`](Self::make_permanent)
    /// - an instant at or before now: the key is deleted immediately,
    ///   counted as removed (not expired), the listener is **not** called,
    ///   and the result is `false`
    /// - otherwise the new expiry is applied and the result is `true`
    pub fn set_expiry<Q>(&self, key: &Q, expires_at: impl Into<Expiry>) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let (live, signal) = self
            .shared
            .write()
            .set_expiry(key, expires_at.into(), Instant::now());
        self.shared.notify(signal);
        live
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Returns a copy of the value and its expiry.
    ///
    /// Never evicts: an entry past its expiry is still returned until the
    /// reaper gets to it.
    pub fn get<Q>(&self, key: &Q) -> Option<(V, Expiry)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.shared
            .read()
            .get(key)
            .map(|(value, expiry)| (value.clone(), expiry))
    }

    /// Looks up several keys under one read lock. Absent keys are skipped.
    pub fn get_many(&self, keys: &[K]) -> HashMap<K, V>
    where
        V: Clone,
    {
        let store = self.shared.read();
        keys.iter()
            .filter_map(|key| store.get(key).map(|(value, _)| (key.clone(), value.clone())))
            .collect()
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shared.read().contains_key(key)
    }

    /// Time left before `key` expires.
    ///
    /// `None` if absent, `Some(None)` if permanent, otherwise the remaining
    /// duration (zero once the expiry has passed).
    pub fn remaining<Q>(&self, key: &Q) -> Option<Option<Duration>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shared
            .read()
            .get(key)
            .map(|(_, expiry)| expiry.remaining())
    }

    /// Number of live entries, permanent and temporary.
    pub fn len(&self) -> usize {
        self.shared.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.read().is_empty()
    }

    /// Calls `f` on every entry under the read lock, in arbitrary order,
    /// until it returns [`ControlFlow::Break`].
    ///
    /// `f` runs while the lock is held, so it must not call back into the
    /// map.
    pub fn for_each<F>(&self, f: F)
    where
        F: FnMut(&K, &V) -> ControlFlow<()>,
    {
        self.shared.read().for_each(f);
    }

    /// Point-in-time list of keys.
    pub fn keys(&self) -> Vec<K> {
        self.shared.read().keys()
    }

    /// Point-in-time copy of every key/value pair.
    pub fn snapshot(&self) -> HashMap<K, V>
    where
        V: Clone,
    {
        self.shared.read().snapshot()
    }

    /// Counters, all read under the same lock.
    pub fn stats(&self) -> Stats {
        self.shared.read().stats()
    }

    // ========================================================================
    // REAPER LIFECYCLE
    // ========================================================================

    /// Starts the reaper (and worker pool) if it is not running.
    ///
    /// Entries that fell due while the reaper was stopped are expired, and
    /// reported, right away.
    pub fn start(&self) {
        let mut reaper = self.lock_reaper();
        if reaper.is_some() {
            return;
        }
        *reaper = Some(Reaper::spawn(
            Arc::clone(&self.shared),
            self.listener.clone(),
            &self.config,
            &self.runtime,
        ));
    }

    /// Stops the reaper.
    ///
    /// Returns once every entry the reaper already removed has been handed
    /// to the listener and all workers have exited. Entries still in the map
    /// stay there and remain fully usable; nothing expires until
    /// [`start`](Self::start) is called again. Calling `stop` on a stopped
    /// map does nothing; a call racing another `stop` returns once that one
    /// has finished draining.
    pub async fn stop(&self) {
        let _stopping = self.stopping.lock().await;
        let reaper = self.lock_reaper().take();
        if let Some(reaper) = reaper {
            reaper.shutdown().await;
        }
    }

    /// Stops and starts the reaper again.
    pub async fn restart(&self) {
        self.stop().await;
        self.start();
    }

    pub fn is_running(&self) -> bool {
        self.lock_reaper().is_some()
    }
}

impl<K, V> Drop for TimedMap<K, V> {
    fn drop(&mut self) {
        // Workers finish whatever is already queued on their own.
        let reaper = self
            .reaper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reaper) = reaper {
            reaper.signal_stop();
        }
    }
}

/// Builder for configuring and constructing a [`TimedMap`].
///
/// # Example
/// ```
/// use std::time::Duration;
/// use timedmap::TimedMap;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), timedmap::Error> {
/// let map: TimedMap<String, Vec<u8>> = TimedMap::builder()
///     .workers(8)
///     .queue_capacity(4096)
///     .on_expire(|key: String, _value: Vec<u8>| println!("{key} expired"))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct TimedMapBuilder<K, V> {
    config: ReaperConfig,
    capacity: usize,
    listener: Option<Arc<dyn ExpirationListener<K, V>>>,
}

impl<K, V> Default for TimedMapBuilder<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> TimedMapBuilder<K, V> {
    pub fn new() -> Self {
        Self {
            config: ReaperConfig::default(),
            capacity: 0,
            listener: None,
        }
    }

    /// Replaces the whole reaper configuration.
    pub fn config(mut self, config: ReaperConfig) -> Self {
        self.config = config;
        self
    }

    /// Number of dispatch workers (zero selects the default).
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Number of entries the map holds before it first reallocates.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Size of the queue between the reaper and the workers.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// How long an idle reaper waits before polling without a wake signal.
    pub fn idle_poll(mut self, interval: Duration) -> Self {
        self.config.idle_poll = interval;
        self
    }

    /// Registers a closure called once per expired entry.
    pub fn on_expire<F>(mut self, f: F) -> Self
    where
        F: Fn(K, V) + Send + Sync + 'static,
    {
        self.listener = Some(Arc::new(f));
        self
    }

    /// Registers an [`ExpirationListener`] implementation.
    pub fn listener<L: ExpirationListener<K, V>>(mut self, listener: L) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }
}

impl<K, V> TimedMapBuilder<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Builds the map and starts its reaper on the current Tokio runtime.
    pub fn build(self) -> Result<TimedMap<K, V>> {
        self.config.validate()?;
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;

        let map = TimedMap {
            shared: Arc::new(Shared::with_capacity(self.capacity)),
            listener: self.listener,
            config: self.config,
            runtime,
            reaper: Mutex::new(None),
            stopping: AsyncMutex::new(()),
        };
        map.start();
        Ok(map)
    }
}
