//! Expiration listener: a callback invoked whenever the reaper removes an
//! entry whose expiry has passed.
//!
//! # Example
//! ```
//! use std::sync::{Arc, Mutex};
//! use std::time::Duration;
//! use timedmap::TimedMap;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), timedmap::Error> {
//! let log: Arc<Mutex<Vec<(String, u32)>>> = Arc::new(Mutex::new(Vec::new()));
//! let log2 = Arc::clone(&log);
//!
//! let map = TimedMap::new(
//!     move |key: String, value: u32| log2.lock().unwrap().push((key, value)),
//!     2,
//! )?;
//! map.set_with_ttl("session".to_string(), 42, Duration::from_millis(10));
//! tokio::time::sleep(Duration::from_millis(50)).await;
//!
//! assert_eq!(log.lock().unwrap().as_slice(), &[("session".to_string(), 42)]);
//! # Ok(())
//! # }
//! ```

/// A callback invoked once per expired entry.
///
/// Listeners run on the dispatch workers, never while the map's lock is
/// held, so calling back into the map (`get`, `set_temporary`, ...) from a
/// listener is fine. Delivery order across workers is unspecified.
///
/// Entries deleted by `remove`, `remove_all` or by `set_expiry` with a past
/// instant are not reported.
pub trait ExpirationListener<K, V>: Send + Sync + 'static {
    fn on_expire(&self, key: K, value: V);
}

impl<K, V, F> ExpirationListener<K, V> for F
where
    F: Fn(K, V) + Send + Sync + 'static,
{
    fn on_expire(&self, key: K, value: V) {
        self(key, value)
    }
}
