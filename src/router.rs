//! Per-request strategy selection and the four fetch strategies.
//!
//! Classification is a pure function of the request and the route config;
//! no state is carried from one request to the next.

use color_eyre::Result;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheEntry, PartitionKind, RequestKey, StoreManager};
use crate::config::RoutesConfig;
use crate::http::{Destination, Method, Request, Response};
use crate::net::Network;
use crate::sync::SyncQueue;

const STATIC_EXTENSIONS: &[&str] = &[
  "css", "js", "mjs", "png", "jpg", "jpeg", "gif", "svg", "webp", "avif", "ico", "woff", "woff2",
  "ttf",
];

const OFFLINE_MARKUP: &str = "<!doctype html><html><head><title>Offline</title></head>\
<body><h1>You are offline</h1><p>Check your connection and try again.</p></body></html>";

/// Which strategy answers a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Network first, dynamic partition fallback, empty-data floor for tolerant paths
  Api,
  /// Cache first, 503 floor
  StaticAsset,
  /// Network first, cached page fallback, offline page floor
  Navigation,
  /// Cache first, offline page floor
  Default,
}

/// Where a routed response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  Network,
  Cache,
  /// Built by the engine (offline data, queued mutation, 503, offline page)
  Synthetic,
}

/// Response plus how it was produced.
#[derive(Debug, Clone)]
pub struct RouteOutcome {
  pub response: Response,
  pub source: ResponseSource,
  pub strategy: Strategy,
}

impl RouteOutcome {
  fn new(strategy: Strategy, source: ResponseSource, response: Response) -> Self {
    Self {
      response,
      source,
      strategy,
    }
  }
}

pub struct Router {
  store: StoreManager,
  network: Arc<dyn Network>,
  sync: Arc<SyncQueue>,
  routes: RoutesConfig,
  origin: Url,
  mutation_tag: String,
}

impl Router {
  pub fn new(
    store: StoreManager,
    network: Arc<dyn Network>,
    sync: Arc<SyncQueue>,
    routes: RoutesConfig,
    origin: Url,
    mutation_tag: impl Into<String>,
  ) -> Self {
    Self {
      store,
      network,
      sync,
      routes,
      origin,
      mutation_tag: mutation_tag.into(),
    }
  }

  /// Pick the strategy for a request.
  pub fn classify(&self, request: &Request) -> Strategy {
    let url = self.resolve(&request.url);
    let same_origin = url
      .as_ref()
      .is_some_and(|u| u.origin() == self.origin.origin());
    let path = url.as_ref().map(|u| u.path()).unwrap_or("");

    if same_origin && path.starts_with(&self.routes.api_prefix) {
      return Strategy::Api;
    }

    let static_destination = matches!(
      request.destination,
      Destination::Image | Destination::Style | Destination::Script | Destination::Font
    );
    if static_destination || has_static_extension(path) {
      return Strategy::StaticAsset;
    }

    if request.is_navigation() {
      return Strategy::Navigation;
    }

    Strategy::Default
  }

  /// Produce the response for an intercepted request.
  ///
  /// `Err` only for an API request that failed on the network with nothing
  /// cached and no offline-tolerant fallback.
  pub async fn route(&self, request: &Request) -> Result<RouteOutcome> {
    let strategy = self.classify(request);
    debug!(url = %request.url, method = %request.method, ?strategy, "Routing request");

    if request.method != Method::Get && !request.method.is_mutating() {
      return self.pass_through(strategy, request).await;
    }

    match strategy {
      Strategy::Api if request.method.is_mutating() => Ok(self.mutation(request).await),
      Strategy::Api => self.api(request).await,
      Strategy::StaticAsset => Ok(self.static_asset(request).await),
      Strategy::Navigation => Ok(self.navigation(request).await),
      Strategy::Default => Ok(self.cache_first(request).await),
    }
  }

  /// HEAD and OPTIONS never touch the cache.
  async fn pass_through(&self, strategy: Strategy, request: &Request) -> Result<RouteOutcome> {
    let response = self.network.fetch(request).await?;
    Ok(RouteOutcome::new(strategy, ResponseSource::Network, response))
  }

  async fn api(&self, request: &Request) -> Result<RouteOutcome> {
    let strategy = Strategy::Api;

    let error = match self.network.fetch(request).await {
      Ok(response) => {
        if request.method == Method::Get && response.ok() {
          self.store_response(PartitionKind::Dynamic, request, &response);
        }
        return Ok(RouteOutcome::new(strategy, ResponseSource::Network, response));
      }
      Err(e) => e,
    };

    warn!(url = %request.url, error = %error, "API request failed, trying cache");

    if let Some(entry) = self.lookup(PartitionKind::Dynamic, request) {
      return Ok(RouteOutcome::new(strategy, ResponseSource::Cache, entry.response));
    }

    if self.is_offline_tolerant(&request.url) {
      let body = json!({ "offline": true, "data": [] });
      return Ok(RouteOutcome::new(
        strategy,
        ResponseSource::Synthetic,
        Response::json(200, &body),
      ));
    }

    Err(error)
  }

  async fn mutation(&self, request: &Request) -> RouteOutcome {
    let strategy = Strategy::Api;

    let error = match self.network.fetch(request).await {
      Ok(response) => {
        if response.ok() {
          self.invalidate(&request.url);
        }
        return RouteOutcome::new(strategy, ResponseSource::Network, response);
      }
      Err(e) => e,
    };

    if !self.is_sync_eligible(&request.url) {
      warn!(url = %request.url, error = %error, "Mutation failed and cannot be staged");
      let body = json!({ "offline": true, "error": error.to_string() });
      return RouteOutcome::new(
        strategy,
        ResponseSource::Synthetic,
        Response::json(503, &body),
      );
    }

    match self.sync.enqueue(&self.mutation_tag, request) {
      Ok(task) => {
        let body = json!({ "offline": true, "queued": true, "taskId": task.id });
        RouteOutcome::new(
          strategy,
          ResponseSource::Synthetic,
          Response::json(202, &body),
        )
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "Failed to stage mutation");
        let body = json!({ "offline": true, "error": e.to_string() });
        RouteOutcome::new(
          strategy,
          ResponseSource::Synthetic,
          Response::json(503, &body),
        )
      }
    }
  }

  async fn static_asset(&self, request: &Request) -> RouteOutcome {
    let strategy = Strategy::StaticAsset;

    if let Some(entry) = self.lookup(PartitionKind::Static, request) {
      return RouteOutcome::new(strategy, ResponseSource::Cache, entry.response);
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if request.method == Method::Get && response.ok() {
          self.store_response(PartitionKind::Static, request, &response);
        }
        RouteOutcome::new(strategy, ResponseSource::Network, response)
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "Static asset unavailable");
        RouteOutcome::new(
          strategy,
          ResponseSource::Synthetic,
          Response::new(503, "Service Unavailable").with_header("content-type", "text/plain"),
        )
      }
    }
  }

  async fn navigation(&self, request: &Request) -> RouteOutcome {
    let strategy = Strategy::Navigation;

    match self.network.fetch(request).await {
      Ok(response) => {
        if request.method == Method::Get && response.ok() {
          self.store_response(PartitionKind::Dynamic, request, &response);
        }
        return RouteOutcome::new(strategy, ResponseSource::Network, response);
      }
      Err(e) => warn!(url = %request.url, error = %e, "Navigation failed, trying cache"),
    }

    if let Some(entry) = self.lookup(PartitionKind::Dynamic, request) {
      return RouteOutcome::new(strategy, ResponseSource::Cache, entry.response);
    }

    self.offline_page(strategy)
  }

  async fn cache_first(&self, request: &Request) -> RouteOutcome {
    let strategy = Strategy::Default;

    let cached = self
      .lookup(PartitionKind::Static, request)
      .or_else(|| self.lookup(PartitionKind::Dynamic, request));
    if let Some(entry) = cached {
      return RouteOutcome::new(strategy, ResponseSource::Cache, entry.response);
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if request.method == Method::Get && response.ok() {
          self.store_response(PartitionKind::Dynamic, request, &response);
        }
        RouteOutcome::new(strategy, ResponseSource::Network, response)
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "Request failed with nothing cached");
        self.offline_page(strategy)
      }
    }
  }

  /// The reserved offline page: precached copy if there is one, built-in markup otherwise.
  fn offline_page(&self, strategy: Strategy) -> RouteOutcome {
    let offline = Request::get(self.routes.offline_page.clone());
    if let Some(entry) = self.lookup(PartitionKind::Static, &offline) {
      return RouteOutcome::new(strategy, ResponseSource::Cache, entry.response);
    }
    RouteOutcome::new(
      strategy,
      ResponseSource::Synthetic,
      Response::html(503, OFFLINE_MARKUP),
    )
  }

  fn resolve(&self, url: &str) -> Option<Url> {
    self.origin.join(url).ok()
  }

  fn key(&self, request: &Request) -> Option<RequestKey> {
    match RequestKey::for_request(request.method, &request.url, &self.origin) {
      Ok(key) => Some(key),
      Err(e) => {
        warn!(error = %e, "Cannot build cache key");
        None
      }
    }
  }

  /// Cache lookup where storage trouble counts as a miss.
  fn lookup(&self, kind: PartitionKind, request: &Request) -> Option<CacheEntry> {
    let key = self.key(request)?;
    match self.store.get(kind, &key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(%key, error = %e, "Cache lookup failed");
        None
      }
    }
  }

  fn store_response(&self, kind: PartitionKind, request: &Request, response: &Response) {
    let Some(key) = self.key(request) else {
      return;
    };
    if let Err(e) = self.store.put(kind, key, response.clone()) {
      warn!(url = %request.url, error = %e, "Failed to cache response");
    }
  }

  fn invalidate(&self, url: &str) {
    let Some(key) = self.key(&Request::get(url)) else {
      return;
    };
    if let Err(e) = self.store.delete(PartitionKind::Dynamic, &key) {
      warn!(%key, error = %e, "Failed to invalidate cached response");
    }
  }

  fn is_offline_tolerant(&self, url: &str) -> bool {
    self.path_matches(url, &self.routes.offline_tolerant)
  }

  fn is_sync_eligible(&self, url: &str) -> bool {
    self.path_matches(url, &self.routes.sync_eligible)
  }

  fn path_matches(&self, url: &str, prefixes: &[String]) -> bool {
    let Some(resolved) = self.resolve(url) else {
      return false;
    };
    let path = resolved.path();
    prefixes.iter().any(|prefix| {
      let prefix = prefix.trim_end_matches('/');
      path == prefix
        || path
          .strip_prefix(prefix)
          .is_some_and(|rest| rest.starts_with('/'))
    })
  }
}

fn has_static_extension(path: &str) -> bool {
  let file = path.rsplit('/').next().unwrap_or("");
  file
    .rsplit_once('.')
    .is_some_and(|(_, ext)| STATIC_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}
