//! The engine: lifecycle state plus the components it owns.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, PartitionKind, RequestKey, StoreManager};
use crate::config::Config;
use crate::control::{ControlChannel, ControlEvent, ControlMessage, ControlReply};
use crate::http::{Method, Request, Response};
use crate::net::Network;
use crate::notify::{
  ClientWindows, Navigation, Notification, NotificationHandler, NotificationSurface,
};
use crate::router::Router;
use crate::sync::{ReplayReport, SyncQueue};

/// Process-wide lifecycle of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
  Uninitialized,
  Installed,
  Active,
}

impl Lifecycle {
  /// The only legal moves are `Uninitialized -> Installed -> Active`.
  pub fn transition(self, next: Lifecycle) -> Result<Lifecycle> {
    match (self, next) {
      (Lifecycle::Uninitialized, Lifecycle::Installed)
      | (Lifecycle::Installed, Lifecycle::Active) => Ok(next),
      _ => Err(eyre!("Invalid lifecycle transition {:?} -> {:?}", self, next)),
    }
  }
}

/// Platform hooks the engine talks to besides the network.
pub struct Platform {
  pub network: Arc<dyn Network>,
  pub notifications: Arc<dyn NotificationSurface>,
  pub windows: Arc<dyn ClientWindows>,
}

pub struct Engine {
  config: Config,
  origin: Url,
  store: StoreManager,
  network: Arc<dyn Network>,
  router: Router,
  sync: Arc<SyncQueue>,
  notifications: NotificationHandler,
  control: ControlChannel,
  lifecycle: Mutex<Lifecycle>,
}

impl Engine {
  pub fn new(
    config: Config,
    storage: impl CacheStorage + 'static,
    platform: Platform,
  ) -> Result<Self> {
    let origin = config.origin_url()?;
    let store = StoreManager::new(storage, config.partition_names());
    let control = ControlChannel::new(64);

    let sync = Arc::new(SyncQueue::new(
      store.clone(),
      platform.network.clone(),
      control.sender(),
      origin.clone(),
      config.sync.max_attempts,
    )?);

    let router = Router::new(
      store.clone(),
      platform.network.clone(),
      sync.clone(),
      config.routes.clone(),
      origin.clone(),
      config.sync.mutation_tag.clone(),
    );

    let notifications = NotificationHandler::new(
      config.app_name.clone(),
      origin.clone(),
      config.notifications.clone(),
      platform.notifications,
      platform.windows,
    );

    Ok(Self {
      config,
      origin,
      store,
      network: platform.network,
      router,
      sync,
      notifications,
      control,
      lifecycle: Mutex::new(Lifecycle::Uninitialized),
    })
  }

  pub fn lifecycle(&self) -> Lifecycle {
    self
      .lifecycle
      .lock()
      .map(|state| *state)
      .unwrap_or(Lifecycle::Uninitialized)
  }

  fn advance(&self, next: Lifecycle) -> Result<()> {
    let mut state = self
      .lifecycle
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    *state = state.transition(next)?;
    Ok(())
  }

  pub fn store(&self) -> &StoreManager {
    &self.store
  }

  pub fn sync_queue(&self) -> &SyncQueue {
    &self.sync
  }

  /// Listen for broadcasts the way an open page does.
  pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
    self.control.subscribe()
  }

  /// Open the current partitions and precache the configured assets.
  ///
  /// An asset that cannot be fetched is logged and skipped.
  pub async fn install(&self) -> Result<()> {
    let state = self.lifecycle();
    state.transition(Lifecycle::Installed)?;

    self.store.open_all()?;

    let requests: Vec<Request> = self
      .config
      .routes
      .precache
      .iter()
      .map(|url| Request::get(url.clone()))
      .collect();
    let responses = join_all(requests.iter().map(|r| self.network.fetch(r))).await;

    let mut cached = 0;
    for (request, result) in requests.iter().zip(responses) {
      match result {
        Ok(response) if response.ok() => {
          let key = RequestKey::for_request(Method::Get, &request.url, &self.origin)?;
          self.store.put(PartitionKind::Static, key, response)?;
          cached += 1;
        }
        Ok(response) => {
          warn!(url = %request.url, status = response.status, "Precache skipped asset")
        }
        Err(e) => warn!(url = %request.url, error = %e, "Precache failed for asset"),
      }
    }

    self.advance(Lifecycle::Installed)?;
    info!(
      version = %self.config.cache_version,
      cached,
      total = requests.len(),
      "Installed"
    );
    Ok(())
  }

  /// Retire partitions from earlier deployments and start controlling pages.
  pub fn activate(&self) -> Result<Vec<String>> {
    self.lifecycle().transition(Lifecycle::Active)?;

    let pruned = self.store.prune_stale()?;
    self.advance(Lifecycle::Active)?;

    info!(version = %self.config.cache_version, pruned = pruned.len(), "Activated");
    self.control.broadcast(ControlEvent::Activated {
      version: self.config.cache_version.clone(),
    });
    Ok(pruned)
  }

  /// Answer an intercepted request. Always yields exactly one response.
  pub async fn handle_fetch(&self, request: &Request) -> Response {
    if self.lifecycle() != Lifecycle::Active {
      debug!(url = %request.url, "Not controlling yet, passing through");
      return match self.network.fetch(request).await {
        Ok(response) => response,
        Err(e) => {
          warn!(url = %request.url, error = %e, "Pass-through fetch failed");
          Response::new(503, "Service Unavailable").with_header("content-type", "text/plain")
        }
      };
    }

    match self.router.route(request).await {
      Ok(outcome) => outcome.response,
      Err(e) => {
        warn!(url = %request.url, error = %e, "Request failed with no fallback");
        Response::network_error()
      }
    }
  }

  /// A sync opportunity for `tag`.
  pub async fn handle_sync(&self, tag: &str) -> Result<ReplayReport> {
    self.sync.replay(tag).await
  }

  pub fn handle_push(&self, data: Option<&[u8]>) -> Result<Notification> {
    self.notifications.handle_push(data)
  }

  pub fn handle_notification_click(
    &self,
    id: u64,
    action: Option<&str>,
  ) -> Result<Option<Navigation>> {
    self.notifications.handle_click(id, action)
  }

  pub fn handle_notification_close(&self, id: u64) -> Result<()> {
    self.notifications.handle_close(id)
  }

  /// Execute a page command. Unknown commands produce no reply.
  pub fn handle_message(&self, message: ControlMessage) -> Option<ControlReply> {
    match message {
      ControlMessage::SkipWaiting => {
        if self.lifecycle() == Lifecycle::Installed {
          if let Err(e) = self.activate() {
            warn!(error = %e, "Skip-waiting activation failed");
            return Some(ControlReply::Error {
              message: e.to_string(),
            });
          }
        }
        Some(ControlReply::Ack)
      }
      ControlMessage::StageMutation(stage) => {
        let tag = stage
          .tag
          .clone()
          .unwrap_or_else(|| self.config.sync.mutation_tag.clone());
        match self.sync.enqueue(&tag, &stage.to_request()) {
          Ok(task) => Some(ControlReply::Staged { task_id: task.id }),
          Err(e) => {
            warn!(url = %stage.url, error = %e, "Failed to stage mutation");
            Some(ControlReply::Error {
              message: e.to_string(),
            })
          }
        }
      }
      ControlMessage::QueryCache(query) => Some(ControlReply::CachedData {
        data: self.cached_collection(&query.url),
      }),
      ControlMessage::GetVersion => Some(ControlReply::Version {
        version: self.config.cache_version.clone(),
      }),
      ControlMessage::Unknown(kind) => {
        debug!(%kind, "Ignoring unknown control message");
        None
      }
    }
  }

  /// Cached JSON for a URL, or an empty collection.
  fn cached_collection(&self, url: &str) -> Value {
    let key = match RequestKey::for_request(Method::Get, url, &self.origin) {
      Ok(key) => key,
      Err(e) => {
        debug!(url, error = %e, "Cannot build cache key for query");
        return json!([]);
      }
    };

    [PartitionKind::Dynamic, PartitionKind::Static]
      .into_iter()
      .find_map(|kind| match self.store.get(kind, &key) {
        Ok(entry) => entry,
        Err(e) => {
          warn!(%key, error = %e, "Cache query failed");
          None
        }
      })
      .and_then(|entry| entry.response.json_body())
      .unwrap_or_else(|| json!([]))
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::net::fake::FakeNetwork;
  use crate::notify::WindowClient;

  pub struct NullSurface;

  impl NotificationSurface for NullSurface {
    fn show(&self, _notification: &Notification) -> Result<()> {
      Ok(())
    }

    fn close(&self, _id: u64) -> Result<()> {
      Ok(())
    }
  }

  pub struct NoWindows;

  impl ClientWindows for NoWindows {
    fn windows(&self) -> Result<Vec<WindowClient>> {
      Ok(Vec::new())
    }

    fn focus_and_navigate(&self, _window_id: &str, _url: &Url) -> Result<()> {
      Ok(())
    }

    fn open(&self, _url: &Url) -> Result<()> {
      Ok(())
    }
  }

  pub fn test_config() -> Config {
    Config {
      origin: "https://shop.example.com".to_string(),
      ..Config::default()
    }
  }

  pub fn engine_with(config: Config, network: Arc<FakeNetwork>) -> Engine {
    Engine::new(
      config,
      SqliteStorage::open_in_memory().unwrap(),
      Platform {
        network,
        notifications: Arc::new(NullSurface),
        windows: Arc::new(NoWindows),
      },
    )
    .unwrap()
  }

  async fn active_engine(network: Arc<FakeNetwork>) -> Engine {
    let engine = engine_with(test_config(), network);
    engine.install().await.unwrap();
    engine.activate().unwrap();
    engine
  }

  #[test]
  fn test_lifecycle_transitions() {
    use Lifecycle::*;
    assert_eq!(Uninitialized.transition(Installed).unwrap(), Installed);
    assert_eq!(Installed.transition(Active).unwrap(), Active);
    assert!(Uninitialized.transition(Active).is_err());
    assert!(Active.transition(Installed).is_err());
    assert!(Installed.transition(Installed).is_err());
  }

  #[tokio::test]
  async fn test_install_precaches_and_tolerates_failures() {
    let network = Arc::new(FakeNetwork::new());
    network.route(Method::Get, "/", Response::html(200, "<p>home</p>"));
    network.route(Method::Get, "/offline", Response::html(200, "<p>offline</p>"));
    // /manifest.json is unrouted and answers 404

    let engine = engine_with(test_config(), network);
    engine.install().await.unwrap();

    assert_eq!(engine.lifecycle(), Lifecycle::Installed);
    assert_eq!(engine.store().keys(PartitionKind::Static).unwrap().len(), 2);
    assert!(engine.install().await.is_err());
  }

  #[tokio::test]
  async fn test_activate_requires_install() {
    let engine = engine_with(test_config(), Arc::new(FakeNetwork::new()));
    assert!(engine.activate().is_err());
    assert_eq!(engine.lifecycle(), Lifecycle::Uninitialized);
  }

  #[tokio::test]
  async fn test_activate_broadcasts_version() {
    let engine = engine_with(test_config(), Arc::new(FakeNetwork::new()));
    let mut events = engine.subscribe();
    engine.install().await.unwrap();
    engine.activate().unwrap();

    assert_eq!(
      events.recv().await.unwrap(),
      ControlEvent::Activated {
        version: "v1".to_string()
      }
    );
  }

  #[tokio::test]
  async fn test_fetch_before_activation_passes_through() {
    let network = Arc::new(FakeNetwork::new());
    network.route(Method::Get, "/api/products", Response::new(200, "[]"));
    let engine = engine_with(test_config(), network.clone());

    let response = engine.handle_fetch(&Request::get("/api/products")).await;
    assert_eq!(response.status, 200);
    // Nothing cached while not in control
    assert!(engine.store().keys(PartitionKind::Dynamic).unwrap().is_empty());

    network.set_online(false);
    let response = engine.handle_fetch(&Request::get("/api/products")).await;
    assert_eq!(response.status, 503);
  }

  #[tokio::test]
  async fn test_api_failure_without_fallback_is_network_error() {
    let network = Arc::new(FakeNetwork::new());
    let engine = active_engine(network.clone()).await;
    network.set_online(false);

    let response = engine.handle_fetch(&Request::get("/api/checkout/session")).await;
    assert_eq!(response, Response::network_error());
  }

  #[tokio::test]
  async fn test_products_cached_then_served_offline() {
    let network = Arc::new(FakeNetwork::new());
    let products = r#"{"products":[{"id":1},{"id":2}]}"#;
    network.route(Method::Get, "/api/products", Response::new(200, products));
    let engine = active_engine(network.clone()).await;

    let online = engine.handle_fetch(&Request::get("/api/products")).await;
    assert_eq!(online.body, products.as_bytes());

    network.set_online(false);
    let offline = engine.handle_fetch(&Request::get("/api/products")).await;
    assert_eq!(offline.body, products.as_bytes());
  }

  #[tokio::test]
  async fn test_offline_cart_update_replayed_once_on_sync() {
    let network = Arc::new(FakeNetwork::new());
    network.route(Method::Post, "/api/cart", Response::new(200, "{}"));
    let engine = active_engine(network.clone()).await;
    let mut events = engine.subscribe();

    network.set_online(false);
    let cart_update = Request::get("/api/cart")
      .with_method(Method::Post)
      .with_body(r#"{"sku":"A1","qty":1}"#);
    let staged = engine.handle_fetch(&cart_update).await;
    assert_eq!(staged.status, 202);
    assert_eq!(engine.sync_queue().pending(None).unwrap().len(), 1);

    network.set_online(true);
    let report = engine.handle_sync("cart-sync").await.unwrap();
    assert_eq!(report.replayed, 1);
    assert!(engine.sync_queue().pending(None).unwrap().is_empty());

    // One failed attempt while offline, one replay
    assert_eq!(network.count(Method::Post, "/api/cart"), 2);
    assert!(matches!(
      events.recv().await.unwrap(),
      ControlEvent::SyncCompleted { .. }
    ));

    engine.handle_sync("cart-sync").await.unwrap();
    assert_eq!(network.count(Method::Post, "/api/cart"), 2);
  }

  #[tokio::test]
  async fn test_upgrade_prunes_old_partitions() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let network = Arc::new(FakeNetwork::new());
    network.route(Method::Get, "/", Response::html(200, "home"));

    let platform = |network: Arc<FakeNetwork>| Platform {
      network,
      notifications: Arc::new(NullSurface),
      windows: Arc::new(NoWindows),
    };

    {
      let v1 = Engine::new(
        Config {
          cache_version: "v1".to_string(),
          ..test_config()
        },
        SqliteStorage::open(&path).unwrap(),
        platform(network.clone()),
      )
      .unwrap();
      v1.install().await.unwrap();
      v1.activate().unwrap();
    }

    let v2 = Engine::new(
      Config {
        cache_version: "v2".to_string(),
        ..test_config()
      },
      SqliteStorage::open(&path).unwrap(),
      platform(network.clone()),
    )
    .unwrap();
    v2.install().await.unwrap();
    let pruned = v2.activate().unwrap();

    assert_eq!(pruned.len(), 2);
    assert!(pruned.iter().all(|name| name.ends_with("-v1")));
    assert_eq!(v2.store().keys(PartitionKind::Static).unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_mutation_staged_before_upgrade_is_replayed_after() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let network = Arc::new(FakeNetwork::new());
    network.route(Method::Post, "/api/cart", Response::new(200, "{}"));

    let engine_at = |version: &str| {
      Engine::new(
        Config {
          cache_version: version.to_string(),
          ..test_config()
        },
        SqliteStorage::open(&path).unwrap(),
        Platform {
          network: network.clone(),
          notifications: Arc::new(NullSurface),
          windows: Arc::new(NoWindows),
        },
      )
      .unwrap()
    };

    {
      let v1 = engine_at("v1");
      v1.install().await.unwrap();
      v1.activate().unwrap();

      network.set_online(false);
      let cart_update = Request::get("/api/cart")
        .with_method(Method::Post)
        .with_body(r#"{"sku":"A1","qty":1}"#);
      assert_eq!(v1.handle_fetch(&cart_update).await.status, 202);
    }

    network.set_online(true);
    let v2 = engine_at("v2");
    assert_eq!(v2.sync_queue().pending(None).unwrap().len(), 1);
    assert_eq!(
      v2.sync_queue().registered_tags().unwrap(),
      vec!["cart-sync"]
    );

    v2.install().await.unwrap();
    v2.activate().unwrap();
    assert_eq!(v2.sync_queue().pending(None).unwrap().len(), 1);

    let report = v2.handle_sync("cart-sync").await.unwrap();
    assert_eq!(report.replayed, 1);
    assert!(v2.sync_queue().pending(None).unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_messages() {
    let network = Arc::new(FakeNetwork::new());
    network.route(Method::Get, "/api/categories", Response::new(200, r#"["mugs"]"#));
    let engine = engine_with(test_config(), network);
    engine.install().await.unwrap();

    // Skip waiting activates an installed engine
    assert_eq!(
      engine.handle_message(ControlMessage::SkipWaiting),
      Some(ControlReply::Ack)
    );
    assert_eq!(engine.lifecycle(), Lifecycle::Active);

    engine.handle_fetch(&Request::get("/api/categories")).await;
    let query = ControlMessage::from_value(
      json!({"type": "QUERY_CACHE", "data": {"url": "/api/categories"}}),
    )
    .unwrap();
    assert_eq!(
      engine.handle_message(query),
      Some(ControlReply::CachedData {
        data: json!(["mugs"])
      })
    );

    let missing = ControlMessage::from_value(
      json!({"type": "QUERY_CACHE", "data": {"url": "/api/wishlist"}}),
    )
    .unwrap();
    assert_eq!(
      engine.handle_message(missing),
      Some(ControlReply::CachedData { data: json!([]) })
    );

    let stage = ControlMessage::from_value(json!({
      "type": "STAGE_MUTATION",
      "data": {"url": "/api/cart", "method": "PUT", "body": {"qty": 3}}
    }))
    .unwrap();
    let Some(ControlReply::Staged { task_id }) = engine.handle_message(stage) else {
      panic!("expected a staged reply");
    };
    let pending = engine.sync_queue().pending(Some("cart-sync")).unwrap();
    assert_eq!(pending[0].id, task_id);
    assert_eq!(pending[0].method, Method::Put);

    assert_eq!(
      engine.handle_message(ControlMessage::Unknown("FUTURE_THING".to_string())),
      None
    );
  }
}
