//! Cache partitions for offline support.
//!
//! This module owns the persisted side of the engine:
//! - Three named partitions per deployment (static, dynamic, staging)
//! - Whole-value entries keyed by method + normalized URL
//! - Pruning of partitions left behind by earlier deployments

mod manager;
mod storage;
mod types;

pub use manager::StoreManager;
pub use storage::{CacheStorage, SqliteStorage};
pub use types::{CacheEntry, PartitionKind, PartitionNames, RequestKey};
