//! Store manager that owns the engine's cache partitions.

use color_eyre::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use super::storage::CacheStorage;
use super::types::{CacheEntry, PartitionKind, PartitionNames, RequestKey};
use crate::http::Response;

/// Handle to the static, dynamic and staging partitions of one deployment.
///
/// Every component receives a clone of the same manager; there is no global
/// registry of open caches. Writes are whole-value replacements, so two
/// concurrent writers to the same key simply leave the last one in place.
pub struct StoreManager {
  storage: Arc<dyn CacheStorage>,
  names: PartitionNames,
}

impl StoreManager {
  pub fn new(storage: impl CacheStorage + 'static, names: PartitionNames) -> Self {
    Self {
      storage: Arc::new(storage),
      names,
    }
  }

  pub fn names(&self) -> &PartitionNames {
    &self.names
  }

  /// Name of the current partition of the given kind.
  pub fn partition(&self, kind: PartitionKind) -> String {
    self.names.name(kind)
  }

  /// Create the partition on first use. Calling it again is harmless.
  pub fn open(&self, kind: PartitionKind) -> Result<String> {
    let name = self.partition(kind);
    self.storage.create_partition(&name)?;
    Ok(name)
  }

  /// Open every current partition.
  pub fn open_all(&self) -> Result<()> {
    for kind in PartitionKind::ALL {
      self.open(kind)?;
    }
    Ok(())
  }

  /// Store `response` under `key`, replacing whatever was there.
  pub fn put(&self, kind: PartitionKind, key: RequestKey, response: Response) -> Result<()> {
    debug!(partition = ?kind, %key, status = response.status, "Caching response");
    self
      .storage
      .put_entry(&self.partition(kind), &CacheEntry::new(key, response))
  }

  /// Look up an entry. `None` is a cache miss, not an error.
  pub fn get(&self, kind: PartitionKind, key: &RequestKey) -> Result<Option<CacheEntry>> {
    self.storage.get_entry(&self.partition(kind), key)
  }

  pub fn delete(&self, kind: PartitionKind, key: &RequestKey) -> Result<bool> {
    self.storage.delete_entry(&self.partition(kind), key)
  }

  /// Keys of a partition, oldest insertion first.
  pub fn keys(&self, kind: PartitionKind) -> Result<Vec<RequestKey>> {
    self.storage.entry_keys(&self.partition(kind))
  }

  /// Delete every partition whose name is not in `keep`. Returns the removed names.
  pub fn delete_partitions_except(&self, keep: &HashSet<String>) -> Result<Vec<String>> {
    let mut removed = Vec::new();
    for name in self.storage.partition_names()? {
      if keep.contains(&name) {
        continue;
      }
      if self.storage.delete_partition(&name)? {
        info!(partition = %name, "Pruned stale cache partition");
        removed.push(name);
      }
    }
    Ok(removed)
  }

  /// Prune everything that does not belong to the current deployment.
  pub fn prune_stale(&self) -> Result<Vec<String>> {
    let keep: HashSet<String> = self.names.current().into_iter().collect();
    self.delete_partitions_except(&keep)
  }
}

impl Clone for StoreManager {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      names: self.names.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;

  fn key(raw: &str) -> RequestKey {
    RequestKey::from_raw(raw)
  }

  #[test]
  fn test_open_is_idempotent() {
    let store = StoreManager::new(
      SqliteStorage::open_in_memory().unwrap(),
      PartitionNames::new("shop", "v1"),
    );
    store.open(PartitionKind::Static).unwrap();
    store.open(PartitionKind::Static).unwrap();
    assert!(store.keys(PartitionKind::Static).unwrap().is_empty());
  }

  #[test]
  fn test_upgrade_prunes_previous_version_only() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());

    let v1 = StoreManager {
      storage: storage.clone(),
      names: PartitionNames::new("shop", "v1"),
    };
    v1.open_all().unwrap();
    v1.put(PartitionKind::Static, key("GET /logo.png"), Response::new(200, "v1"))
      .unwrap();

    let v2 = StoreManager {
      storage: storage.clone(),
      names: PartitionNames::new("shop", "v2"),
    };
    v2.open_all().unwrap();
    v2.put(PartitionKind::Static, key("GET /logo.png"), Response::new(200, "v2"))
      .unwrap();

    let mut removed = v2.prune_stale().unwrap();
    removed.sort();
    assert_eq!(
      removed,
      vec!["shop-dynamic-v1", "shop-static-v1"]
    );

    let survivor = v2
      .get(PartitionKind::Static, &key("GET /logo.png"))
      .unwrap()
      .unwrap();
    assert_eq!(survivor.response.body, b"v2");

    let mut remaining = storage.partition_names().unwrap();
    remaining.sort();
    assert_eq!(
      remaining,
      vec!["shop-dynamic-v2", "shop-staging", "shop-static-v2"]
    );
  }

  #[test]
  fn test_delete_partitions_except_with_explicit_allow_list() {
    let store = StoreManager::new(
      SqliteStorage::open_in_memory().unwrap(),
      PartitionNames::new("shop", "v1"),
    );
    store.open_all().unwrap();

    let keep: HashSet<String> = [store.partition(PartitionKind::Static)].into_iter().collect();
    let removed = store.delete_partitions_except(&keep).unwrap();
    assert_eq!(removed.len(), 2);
  }

  #[test]
  fn test_delete_entry() {
    let store = StoreManager::new(
      SqliteStorage::open_in_memory().unwrap(),
      PartitionNames::new("shop", "v1"),
    );
    store
      .put(PartitionKind::Dynamic, key("GET /api/cart"), Response::new(200, "[]"))
      .unwrap();
    assert!(store.delete(PartitionKind::Dynamic, &key("GET /api/cart")).unwrap());
    assert!(store
      .get(PartitionKind::Dynamic, &key("GET /api/cart"))
      .unwrap()
      .is_none());
  }
}
