//! # timedmap - A Concurrent Key-Value Map with Self-Expiring Entries
//!
//! `timedmap` is an in-process key-value store where every entry is either
//! permanent or carries an absolute expiration time. Expired entries are
//! removed by a background task and reported to a callback, so callers never
//! have to poll.
//!
//! Typical uses are session stores, short-lived caches and rate-limit
//! windows shared by many tasks.
//!
//! ## Features
//!
//! - **Exact expiry**: a min-heap of expiries drives a reaper that sleeps
//!   until the next deadline instead of sweeping on an interval
//! - **Early wake**: inserting an entry that expires sooner than everything
//!   else wakes the reaper immediately
//! - **Callbacks off the lock**: expiration listeners run on a bounded pool
//!   of Tokio tasks and may call back into the map
//! - **Stop / restart**: the reaper can be paused; entries keep working and
//!   expire as soon as it is started again
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              TimedMap                                   │
//! │                                                                         │
//! │  set_* / remove / get ──>  RwLock<Store>                                │
//! │                            ┌──────────────┐   ┌──────────────────┐      │
//! │                            │ key → entry  │<─>│ ExpiryHeap       │      │
//! │                            └──────────────┘   └──────────────────┘      │
//! │                                   ▲                                     │
//! │                                   │ pop due                             │
//! │                     ┌─────────────┴───────────────┐                     │
//! │   wake (Notify) ──> │            Reaper           │                     │
//! │                     │    (Background Tokio Task)  │                     │
//! │                     └─────────────┬───────────────┘                     │
//! │                                   │ bounded mpsc                        │
//! │                     ┌─────────────▼───────────────┐                     │
//! │                     │  Workers → on_expire(k, v)  │                     │
//! │                     └─────────────────────────────┘                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```
//! use std::time::Duration;
//! use timedmap::TimedMap;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), timedmap::Error> {
//!     let sessions = TimedMap::new(
//!         |user: String, token: String| println!("session of {user} ({token}) expired"),
//!         4,
//!     )?;
//!
//!     sessions.set_with_ttl("ariz".to_string(), "abc123".to_string(), Duration::from_millis(20));
//!     sessions.set_permanent("admin".to_string(), "root".to_string());
//!
//!     tokio::time::sleep(Duration::from_millis(100)).await;
//!     assert!(!sessions.contains_key("ariz"));
//!     assert!(sessions.contains_key("admin"));
//!
//!     sessions.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`storage`]: store, expiry heap, reaper and dispatch pool
//! - [`listener`]: the expiration callback trait
//! - [`error`]: setup errors
//!
//! ## Design Highlights
//!
//! ### One Lock
//!
//! The key index and the expiry heap live behind a single `RwLock`, so they
//! can never disagree. Reads take the shared lock and run concurrently.
//!
//! ### No Lazy Expiry
//!
//! `get` never evicts. Removing expired entries is the reaper's job alone,
//! which keeps reads on the shared lock and keeps every expiration reported
//! exactly once.

pub mod error;
pub mod listener;
pub mod storage;
mod timed_map;

// Re-export commonly used types for convenience
pub use error::{Error, Result};
pub use listener::ExpirationListener;
pub use storage::{Expiry, ReaperConfig, Stats};
pub use timed_map::{TimedMap, TimedMapBuilder};

/// Version of timedmap
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
