//! The thread-safe cache and its builder.

mod builder;
mod cache;
mod policy;
mod value_initializer;

pub use builder::CacheBuilder;
pub use cache::Cache;
pub use policy::{CacheEntry, Policy};

use std::sync::Arc;

/// Measures an entry at insertion and update time.
pub type Weigher<K, V> = Arc<dyn Fn(&K, &V) -> u32 + Send + Sync + 'static>;
