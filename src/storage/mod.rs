//! Storage Engine Module
//!
//! This module provides the expiration engine behind [`TimedMap`](crate::TimedMap):
//! a key-indexed store paired with a min-expiry heap, the reaper task that
//! sleeps until the next expiry, and the worker pool that delivers
//! expiration callbacks.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 RwLock<Store>  (one lock)                   │
//! │   ┌──────────────────────┐    ┌──────────────────────────┐  │
//! │   │ key → entry          │<──>│ ExpiryHeap (min expiry)  │  │
//! │   └──────────────────────┘    └──────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//!          ▲ API calls                       ▲ pop due entries
//!          │ (notify on new minimum)         │
//!          │                   ┌─────────────┴─────────────┐
//!          └──── Notify ─────> │        Reaper             │
//!                              │  (Background Tokio Task)  │
//!                              └─────────────┬─────────────┘
//!                                            │ bounded queue
//!                              ┌─────────────▼─────────────┐
//!                              │   Worker pool → listener  │
//!                              └───────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Single lock**: map and heap always change together
//! - **RwLock**: concurrent readers, exclusive writers
//! - **Dynamic deadline**: the reaper sleeps until the earliest expiry
//! - **Early wake**: a new earliest expiry interrupts the sleep
//! - **Bounded dispatch**: callbacks run on a fixed pool, outside the lock

pub mod engine;
pub mod expiry;

pub(crate) mod dispatch;
pub(crate) mod heap;

#[cfg(test)]
mod engine_proptest;

// Re-export commonly used types
pub use engine::{Expiry, Stats};
pub use expiry::{ReaperConfig, DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKERS};
