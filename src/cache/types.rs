//! Core types for the cache partitions.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use sha2::{Digest, Sha256};
use url::Url;

use crate::http::{Method, Response};

/// The three logical partitions the engine owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionKind {
  /// Precached and cache-first assets (images, styles, scripts)
  Static,
  /// API and navigation responses
  Dynamic,
  /// Mutations waiting to be replayed
  Staging,
}

impl PartitionKind {
  pub const ALL: [PartitionKind; 3] = [Self::Static, Self::Dynamic, Self::Staging];

  fn label(&self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::Dynamic => "dynamic",
      Self::Staging => "staging",
    }
  }
}

/// Partition names for one deployment.
///
/// Cache partitions are versioned (`storefront-static-v2`), so bumping the
/// version makes every cache from the previous deployment eligible for
/// pruning at activation. Staging is not versioned (`storefront-staging`):
/// mutations queued under an older deployment must still be replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionNames {
  prefix: String,
  version: String,
}

impl PartitionNames {
  pub fn new(prefix: impl Into<String>, version: impl Into<String>) -> Self {
    Self {
      prefix: prefix.into(),
      version: version.into(),
    }
  }

  pub fn name(&self, kind: PartitionKind) -> String {
    match kind {
      PartitionKind::Staging => format!("{}-{}", self.prefix, kind.label()),
      _ => format!("{}-{}-{}", self.prefix, kind.label(), self.version),
    }
  }

  /// Every name that is current for this deployment.
  pub fn current(&self) -> Vec<String> {
    PartitionKind::ALL.iter().map(|kind| self.name(*kind)).collect()
  }

  pub fn version(&self) -> &str {
    &self.version
  }
}

/// Lookup key for a cache entry: method plus normalized URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey(String);

impl RequestKey {
  /// Build a key for a request, resolving `url` against `origin`.
  ///
  /// The fragment is dropped; the query string is significant.
  pub fn for_request(method: Method, url: &str, origin: &Url) -> Result<Self> {
    let mut resolved = origin
      .join(url)
      .map_err(|e| eyre!("Invalid request URL '{}': {}", url, e))?;
    resolved.set_fragment(None);
    Ok(Self(format!("{} {}", method, resolved)))
  }

  /// Key for a staged mutation in the staging partition.
  pub fn staged(task_id: &str) -> Self {
    Self(format!("STAGE {}", task_id))
  }

  /// Rebuild a key from its stored string form.
  pub fn from_raw(raw: impl Into<String>) -> Self {
    Self(raw.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// SHA256 digest used as the storage index.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.0.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl std::fmt::Display for RequestKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

/// A cached response. Replaced wholesale on re-fetch, never patched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub key: RequestKey,
  pub response: Response,
  pub inserted_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn new(key: RequestKey, response: Response) -> Self {
    Self {
      key,
      response,
      inserted_at: Utc::now(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn origin() -> Url {
    Url::parse("https://shop.example.com").unwrap()
  }

  #[test]
  fn test_cache_partitions_are_versioned_staging_is_not() {
    let names = PartitionNames::new("storefront", "v2");
    assert_eq!(names.name(PartitionKind::Static), "storefront-static-v2");
    assert_eq!(
      names.current(),
      vec![
        "storefront-static-v2",
        "storefront-dynamic-v2",
        "storefront-staging"
      ]
    );
    assert_eq!(
      PartitionNames::new("storefront", "v1").name(PartitionKind::Staging),
      names.name(PartitionKind::Staging)
    );
  }

  #[test]
  fn test_request_key_normalization() {
    let relative = RequestKey::for_request(Method::Get, "/api/products", &origin()).unwrap();
    let absolute = RequestKey::for_request(
      Method::Get,
      "https://SHOP.example.com/api/products#top",
      &origin(),
    )
    .unwrap();
    assert_eq!(relative, absolute);
    assert_eq!(
      relative.as_str(),
      "GET https://shop.example.com/api/products"
    );
  }

  #[test]
  fn test_request_key_distinguishes_method_and_query() {
    let get = RequestKey::for_request(Method::Get, "/api/cart", &origin()).unwrap();
    let post = RequestKey::for_request(Method::Post, "/api/cart", &origin()).unwrap();
    let query = RequestKey::for_request(Method::Get, "/api/cart?page=2", &origin()).unwrap();
    assert_ne!(get, post);
    assert_ne!(get, query);
    assert_ne!(get.digest(), post.digest());
  }
}
