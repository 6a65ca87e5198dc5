#![warn(rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! A concurrent, bounded, in-process cache with a Window-TinyLFU admission
//! policy.
//!
//! Arabica keeps a fixed number of entries (or a fixed total weight) and
//! works out which entries to keep using the W-TinyLFU algorithm: every
//! new entry lands in a small recency window, and when space runs out a
//! compact frequency sketch arbitrates between the newest candidate and
//! the coldest resident. Reads and writes record themselves into striped,
//! lock-free buffers; a single maintenance task replays them against the
//! policy structures, so the hot paths never serialize on a shared lock.
//!
//! Entries can additionally expire a fixed time after write, after access,
//! or on a per-entry deadline kept in a hierarchical timer wheel, and can
//! be refreshed in the background through a [`CacheLoader`].
//!
//! # Example
//!
//! ```
//! use arabica::Cache;
//!
//! let cache = Cache::new(10_000);
//!
//! cache.insert("key", "value");
//! assert_eq!(cache.get(&"key").as_deref(), Some(&"value"));
//!
//! cache.invalidate(&"key");
//! assert_eq!(cache.get(&"key"), None);
//! ```
//!
//! With expiration, weighing and statistics:
//!
//! ```
//! use arabica::Cache;
//! use std::time::Duration;
//!
//! let cache: arabica::Cache<String, Vec<u8>> = Cache::builder()
//!     .max_weight(64 * 1024 * 1024)
//!     .weigher(|_key, value: &Vec<u8>| value.len() as u32)
//!     .expire_after_write(Duration::from_secs(600))
//!     .record_stats()
//!     .build();
//!
//! cache.insert("a".into(), vec![0u8; 1024]);
//! cache.sync();
//! assert_eq!(cache.weighted_size(), 1024);
//! ```

pub(crate) mod common;
pub mod error;
pub mod expiry;
pub mod loading;
pub mod notification;
pub mod stats;
pub mod sync;

pub use common::time::Clock;
pub use error::BuildError;
pub use expiry::Expiry;
pub use loading::{CacheLoader, CacheWriter};
pub use notification::{RemovalCause, RemovalListener};
pub use stats::{CacheStats, ConcurrentStatsCounter, StatsCounter};
pub use sync::{Cache, CacheBuilder, CacheEntry, Policy, Weigher};
