//! Push payload handling and notification click routing.
//!
//! Every push produces exactly one notification. A notification moves
//! `Received -> Displayed -> (Dismissed | Clicked)` and a click yields at
//! most one navigation.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::NotificationsConfig;

const FALLBACK_BODY: &str = "You have a new notification";

/// Category of a push message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
  OrderConfirmed,
  OrderShipped,
  OrderDelivered,
  Promotion,
  /// Any other type string, kept for the data echo
  Generic(String),
}

impl NotificationKind {
  pub fn parse(raw: &str) -> Self {
    match raw {
      "order_confirmed" => Self::OrderConfirmed,
      "order_shipped" => Self::OrderShipped,
      "order_delivered" => Self::OrderDelivered,
      "promotion" => Self::Promotion,
      other => Self::Generic(other.to_string()),
    }
  }

  pub fn as_str(&self) -> &str {
    match self {
      Self::OrderConfirmed => "order_confirmed",
      Self::OrderShipped => "order_shipped",
      Self::OrderDelivered => "order_delivered",
      Self::Promotion => "promotion",
      Self::Generic(raw) => raw,
    }
  }

  fn is_order(&self) -> bool {
    matches!(
      self,
      Self::OrderConfirmed | Self::OrderShipped | Self::OrderDelivered
    )
  }
}

/// Typed push payload with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationPayload {
  pub title: String,
  pub body: String,
  pub kind: NotificationKind,
  pub order_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPayload {
  title: Option<String>,
  body: Option<String>,
  #[serde(rename = "type")]
  kind: Option<String>,
  #[serde(rename = "orderId")]
  order_id: Option<Value>,
}

impl NotificationPayload {
  /// Parse push data. Anything that is not a JSON object degrades to a
  /// generic notification carrying the raw text.
  pub fn parse(data: Option<&[u8]>, app_name: &str) -> Self {
    let bytes = data.unwrap_or_default();

    match serde_json::from_slice::<RawPayload>(bytes) {
      Ok(raw) => Self {
        title: raw
          .title
          .filter(|t| !t.trim().is_empty())
          .unwrap_or_else(|| app_name.to_string()),
        body: raw
          .body
          .filter(|b| !b.trim().is_empty())
          .unwrap_or_else(|| FALLBACK_BODY.to_string()),
        kind: NotificationKind::parse(raw.kind.as_deref().unwrap_or("general")),
        order_id: raw.order_id.and_then(|id| match id {
          Value::String(s) if !s.is_empty() => Some(s),
          Value::Number(n) => Some(n.to_string()),
          _ => None,
        }),
      },
      Err(e) => {
        debug!(error = %e, "Push payload is not JSON, using raw text");
        let text = String::from_utf8_lossy(bytes).trim().to_string();
        Self {
          title: app_name.to_string(),
          body: if text.is_empty() {
            FALLBACK_BODY.to_string()
          } else {
            text
          },
          kind: NotificationKind::Generic("general".to_string()),
          order_id: None,
        }
      }
    }
  }

  /// In-app path the notification opens by default.
  pub fn deep_link(&self) -> String {
    match (&self.kind, &self.order_id) {
      (kind, Some(id)) if kind.is_order() => format!("/dashboard/orders/{}", id),
      (kind, None) if kind.is_order() => "/dashboard/orders".to_string(),
      (NotificationKind::Promotion, _) => "/products".to_string(),
      _ => "/".to_string(),
    }
  }

  /// Path for a pressed action; `None` means no navigation.
  pub fn action_target(&self, action: Option<&str>) -> Option<String> {
    match action {
      Some("close") => None,
      Some("review") => Some(match &self.order_id {
        Some(id) => format!("/dashboard/orders/{}/review", id),
        None => "/dashboard/orders".to_string(),
      }),
      Some("shop") => Some("/products".to_string()),
      // track, open, unknown actions and a click on the body
      _ => Some(self.deep_link()),
    }
  }

  pub fn actions(&self) -> Vec<NotificationAction> {
    let primary = match self.kind {
      NotificationKind::OrderConfirmed | NotificationKind::OrderShipped => {
        NotificationAction::new("track", "Track Order")
      }
      NotificationKind::OrderDelivered => NotificationAction::new("review", "Leave Review"),
      NotificationKind::Promotion => NotificationAction::new("shop", "Shop Now"),
      NotificationKind::Generic(_) => NotificationAction::new("open", "Open App"),
    };
    vec![primary, NotificationAction::new("close", "Close")]
  }

  fn tag(&self) -> String {
    match &self.order_id {
      Some(id) => format!("{}-{}", self.kind.as_str(), id),
      None => self.kind.as_str().to_string(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
  pub icon: String,
}

impl NotificationAction {
  fn new(action: &str, title: &str) -> Self {
    Self {
      action: action.to_string(),
      title: title.to_string(),
      icon: format!("/icons/action-{}.png", action),
    }
  }
}

/// Opaque data attached to a shown notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
  pub title: String,
  pub body: String,
  #[serde(rename = "type")]
  pub kind: String,
  pub order_id: Option<String>,
  pub url: String,
}

/// Everything the platform needs to display one notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
  pub id: u64,
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub tag: String,
  pub vibrate: Vec<u32>,
  pub data: NotificationData,
  pub actions: Vec<NotificationAction>,
  pub require_interaction: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationState {
  Received,
  Displayed,
  Dismissed,
  Clicked,
}

impl NotificationState {
  /// Move to `next` if the lifecycle allows it.
  pub fn advance(self, next: NotificationState) -> Result<NotificationState> {
    use NotificationState::*;
    match (self, next) {
      (Received, Displayed) | (Displayed, Dismissed) | (Displayed, Clicked) => Ok(next),
      _ => Err(eyre!(
        "Invalid notification transition {:?} -> {:?}",
        self,
        next
      )),
    }
  }
}

/// An open page (browser window) belonging to some origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowClient {
  pub id: String,
  pub url: String,
  #[serde(default)]
  pub focused: bool,
}

/// Platform side that actually draws notifications.
pub trait NotificationSurface: Send + Sync {
  fn show(&self, notification: &Notification) -> Result<()>;
  fn close(&self, id: u64) -> Result<()>;
}

/// Platform side that manages page windows.
pub trait ClientWindows: Send + Sync {
  fn windows(&self) -> Result<Vec<WindowClient>>;
  fn focus_and_navigate(&self, window_id: &str, url: &Url) -> Result<()>;
  fn open(&self, url: &Url) -> Result<()>;
}

/// The navigation a click resulted in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Navigation {
  Focused { window: String, url: String },
  Opened { url: String },
}

struct Tracked {
  payload: NotificationPayload,
  state: NotificationState,
}

pub struct NotificationHandler {
  app_name: String,
  origin: Url,
  settings: NotificationsConfig,
  surface: Arc<dyn NotificationSurface>,
  windows: Arc<dyn ClientWindows>,
  next_id: AtomicU64,
  tracked: Mutex<HashMap<u64, Tracked>>,
}

impl NotificationHandler {
  pub fn new(
    app_name: impl Into<String>,
    origin: Url,
    settings: NotificationsConfig,
    surface: Arc<dyn NotificationSurface>,
    windows: Arc<dyn ClientWindows>,
  ) -> Self {
    Self {
      app_name: app_name.into(),
      origin,
      settings,
      surface,
      windows,
      next_id: AtomicU64::new(1),
      tracked: Mutex::new(HashMap::new()),
    }
  }

  /// Build and show the notification for one push event.
  pub fn handle_push(&self, data: Option<&[u8]>) -> Result<Notification> {
    let payload = NotificationPayload::parse(data, &self.app_name);
    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
    let notification = self.build(id, &payload);

    let state = NotificationState::Received.advance(NotificationState::Displayed)?;
    self.surface.show(&notification)?;
    info!(id, kind = payload.kind.as_str(), "Displayed notification");

    self
      .tracked
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .insert(id, Tracked { payload, state });

    Ok(notification)
  }

  fn build(&self, id: u64, payload: &NotificationPayload) -> Notification {
    Notification {
      id,
      title: payload.title.clone(),
      body: payload.body.clone(),
      icon: self.settings.icon.clone(),
      badge: self.settings.badge.clone(),
      tag: payload.tag(),
      vibrate: self.settings.vibrate.clone(),
      data: NotificationData {
        title: payload.title.clone(),
        body: payload.body.clone(),
        kind: payload.kind.as_str().to_string(),
        order_id: payload.order_id.clone(),
        url: payload.deep_link(),
      },
      actions: payload.actions(),
      require_interaction: payload.kind == NotificationKind::OrderDelivered,
    }
  }

  /// The user dismissed the notification without acting on it.
  pub fn handle_close(&self, id: u64) -> Result<()> {
    let mut tracked = self
      .tracked
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let entry = tracked
      .get(&id)
      .ok_or_else(|| eyre!("Unknown notification {}", id))?;
    entry.state.advance(NotificationState::Dismissed)?;
    // Finished notifications are forgotten
    tracked.remove(&id);
    debug!(id, "Notification dismissed");
    Ok(())
  }

  /// Handle a click on the notification body (`action = None`) or one of its actions.
  pub fn handle_click(&self, id: u64, action: Option<&str>) -> Result<Option<Navigation>> {
    let payload = {
      let mut tracked = self
        .tracked
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      // Unknown covers a second click and a click after dismissal
      let Some(entry) = tracked.remove(&id) else {
        debug!(id, "Ignoring click on unknown or finished notification");
        return Ok(None);
      };
      if let Err(e) = entry.state.advance(NotificationState::Clicked) {
        warn!(id, error = %e, "Ignoring click in unexpected state");
        return Ok(None);
      }
      entry.payload
    };

    self.surface.close(id)?;

    let Some(path) = payload.action_target(action) else {
      debug!(id, "Close action pressed");
      return Ok(None);
    };
    let target = self
      .origin
      .join(&path)
      .map_err(|e| eyre!("Invalid deep link '{}': {}", path, e))?;

    self.navigate(target).map(Some)
  }

  /// Reuse an open window of the app if there is one, else open a new one.
  fn navigate(&self, target: Url) -> Result<Navigation> {
    let windows = self.windows.windows()?;
    let ours: Vec<&WindowClient> = windows
      .iter()
      .filter(|w| {
        Url::parse(&w.url)
          .map(|u| u.origin() == self.origin.origin())
          .unwrap_or(false)
      })
      .collect();
    let chosen = ours
      .iter()
      .find(|w| w.focused)
      .or_else(|| ours.first())
      .copied();

    match chosen {
      Some(window) => {
        self.windows.focus_and_navigate(&window.id, &target)?;
        info!(window = %window.id, url = %target, "Focused existing window");
        Ok(Navigation::Focused {
          window: window.id.clone(),
          url: target.to_string(),
        })
      }
      None => {
        self.windows.open(&target)?;
        info!(url = %target, "Opened new window");
        Ok(Navigation::Opened {
          url: target.to_string(),
        })
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[derive(Default)]
  struct RecordingSurface {
    shown: Mutex<Vec<Notification>>,
    closed: Mutex<Vec<u64>>,
  }

  impl NotificationSurface for RecordingSurface {
    fn show(&self, notification: &Notification) -> Result<()> {
      self.shown.lock().unwrap().push(notification.clone());
      Ok(())
    }

    fn close(&self, id: u64) -> Result<()> {
      self.closed.lock().unwrap().push(id);
      Ok(())
    }
  }

  #[derive(Default)]
  struct FakeWindows {
    open: Mutex<Vec<WindowClient>>,
    actions: Mutex<Vec<String>>,
  }

  impl ClientWindows for FakeWindows {
    fn windows(&self) -> Result<Vec<WindowClient>> {
      Ok(self.open.lock().unwrap().clone())
    }

    fn focus_and_navigate(&self, window_id: &str, url: &Url) -> Result<()> {
      self
        .actions
        .lock()
        .unwrap()
        .push(format!("focus {} {}", window_id, url));
      Ok(())
    }

    fn open(&self, url: &Url) -> Result<()> {
      self.actions.lock().unwrap().push(format!("open {}", url));
      Ok(())
    }
  }

  fn handler() -> (NotificationHandler, Arc<RecordingSurface>, Arc<FakeWindows>) {
    let surface = Arc::new(RecordingSurface::default());
    let windows = Arc::new(FakeWindows::default());
    let handler = NotificationHandler::new(
      "Storefront",
      Url::parse("https://shop.example.com").unwrap(),
      NotificationsConfig::default(),
      surface.clone(),
      windows.clone(),
    );
    (handler, surface, windows)
  }

  #[test]
  fn test_parse_full_payload() {
    let payload = NotificationPayload::parse(
      Some(br#"{"title":"Order Shipped","body":"On its way","type":"order_shipped","orderId":"123"}"#),
      "Storefront",
    );
    assert_eq!(payload.title, "Order Shipped");
    assert_eq!(payload.kind, NotificationKind::OrderShipped);
    assert_eq!(payload.order_id.as_deref(), Some("123"));
    assert_eq!(payload.deep_link(), "/dashboard/orders/123");
  }

  #[test]
  fn test_missing_title_defaults_to_app_name() {
    let payload = NotificationPayload::parse(
      Some(br#"{"body":"Hello","type":"order_confirmed","orderId":42}"#),
      "Acme",
    );
    assert_eq!(payload.title, "Acme");
    assert_eq!(payload.order_id.as_deref(), Some("42"));
  }

  #[test]
  fn test_unparseable_payload_uses_raw_text() {
    let payload = NotificationPayload::parse(Some(b"Flash sale today!"), "Acme");
    assert_eq!(payload.title, "Acme");
    assert_eq!(payload.body, "Flash sale today!");
    assert_eq!(payload.actions()[0].action, "open");

    let empty = NotificationPayload::parse(None, "Acme");
    assert_eq!(empty.body, FALLBACK_BODY);
  }

  #[test]
  fn test_actions_by_kind() {
    let actions = |kind: &str| {
      NotificationPayload::parse(
        Some(format!(r#"{{"body":"x","type":"{}"}}"#, kind).as_bytes()),
        "Acme",
      )
      .actions()
      .into_iter()
      .map(|a| a.action)
      .collect::<Vec<_>>()
    };

    assert_eq!(actions("order_confirmed"), vec!["track", "close"]);
    assert_eq!(actions("order_delivered"), vec!["review", "close"]);
    assert_eq!(actions("promotion"), vec!["shop", "close"]);
    assert_eq!(actions("something_new"), vec!["open", "close"]);
  }

  #[test]
  fn test_state_transitions() {
    use NotificationState::*;
    assert_eq!(Received.advance(Displayed).unwrap(), Displayed);
    assert_eq!(Displayed.advance(Clicked).unwrap(), Clicked);
    assert_eq!(Displayed.advance(Dismissed).unwrap(), Dismissed);
    assert!(Received.advance(Clicked).is_err());
    assert!(Clicked.advance(Clicked).is_err());
    assert!(Dismissed.advance(Clicked).is_err());
  }

  #[test]
  fn test_each_push_shows_one_notification() {
    let (handler, surface, _) = handler();
    let first = handler.handle_push(Some(br#"{"body":"a","type":"promotion"}"#)).unwrap();
    let second = handler.handle_push(Some(br#"{"body":"b","type":"promotion"}"#)).unwrap();

    assert_ne!(first.id, second.id);
    assert_eq!(surface.shown.lock().unwrap().len(), 2);
  }

  #[test]
  fn test_data_echoes_payload_and_deep_link() {
    let (handler, _, _) = handler();
    let shown = handler
      .handle_push(Some(
        br#"{"title":"Order Shipped","body":"On its way","type":"order_shipped","orderId":"123"}"#,
      ))
      .unwrap();

    assert_eq!(
      serde_json::to_value(&shown.data).unwrap(),
      serde_json::json!({
        "title": "Order Shipped",
        "body": "On its way",
        "type": "order_shipped",
        "orderId": "123",
        "url": "/dashboard/orders/123"
      })
    );
  }

  #[test]
  fn test_require_interaction_only_for_delivery() {
    let (handler, _, _) = handler();
    let delivered = handler
      .handle_push(Some(br#"{"body":"x","type":"order_delivered","orderId":"9"}"#))
      .unwrap();
    let shipped = handler
      .handle_push(Some(br#"{"body":"x","type":"order_shipped","orderId":"9"}"#))
      .unwrap();

    assert!(delivered.require_interaction);
    assert!(!shipped.require_interaction);
    assert_eq!(delivered.tag, "order_delivered-9");
  }

  #[test]
  fn test_track_click_opens_order_page() {
    let (handler, surface, windows) = handler();
    let shown = handler
      .handle_push(Some(
        br#"{"title":"Order Shipped","body":"...","type":"order_shipped","orderId":"123"}"#,
      ))
      .unwrap();

    let navigation = handler.handle_click(shown.id, Some("track")).unwrap();
    assert_eq!(
      navigation,
      Some(Navigation::Opened {
        url: "https://shop.example.com/dashboard/orders/123".to_string()
      })
    );
    assert_eq!(*surface.closed.lock().unwrap(), vec![shown.id]);
    assert_eq!(windows.actions.lock().unwrap().len(), 1);
  }

  #[test]
  fn test_click_focuses_existing_app_window() {
    let (handler, _, windows) = handler();
    windows.open.lock().unwrap().extend([
      WindowClient {
        id: "other".to_string(),
        url: "https://news.example.org/".to_string(),
        focused: true,
      },
      WindowClient {
        id: "shop".to_string(),
        url: "https://shop.example.com/products".to_string(),
        focused: false,
      },
    ]);
    let shown = handler
      .handle_push(Some(br#"{"body":"x","type":"order_delivered","orderId":"7"}"#))
      .unwrap();

    let navigation = handler.handle_click(shown.id, Some("review")).unwrap();
    assert_eq!(
      navigation,
      Some(Navigation::Focused {
        window: "shop".to_string(),
        url: "https://shop.example.com/dashboard/orders/7/review".to_string()
      })
    );
  }

  #[test]
  fn test_close_action_does_not_navigate() {
    let (handler, surface, windows) = handler();
    let shown = handler.handle_push(Some(br#"{"body":"x","type":"promotion"}"#)).unwrap();

    assert_eq!(handler.handle_click(shown.id, Some("close")).unwrap(), None);
    assert_eq!(surface.closed.lock().unwrap().len(), 1);
    assert!(windows.actions.lock().unwrap().is_empty());
  }

  #[test]
  fn test_second_click_is_ignored() {
    let (handler, _, windows) = handler();
    let shown = handler.handle_push(Some(br#"{"body":"x"}"#)).unwrap();

    assert!(handler.handle_click(shown.id, None).unwrap().is_some());
    assert!(handler.handle_click(shown.id, None).unwrap().is_none());
    assert_eq!(windows.actions.lock().unwrap().len(), 1);
  }

  #[test]
  fn test_finished_notifications_are_forgotten() {
    let (handler, _, _) = handler();
    for _ in 0..50 {
      let clicked = handler.handle_push(Some(br#"{"body":"x"}"#)).unwrap();
      let closed = handler.handle_push(Some(br#"{"body":"y"}"#)).unwrap();
      handler.handle_click(clicked.id, Some("close")).unwrap();
      handler.handle_close(closed.id).unwrap();
    }
    assert!(handler.tracked.lock().unwrap().is_empty());

    let open = handler.handle_push(Some(br#"{"body":"z"}"#)).unwrap();
    assert_eq!(handler.tracked.lock().unwrap().len(), 1);
    assert!(handler.handle_click(open.id, None).unwrap().is_some());
    assert!(handler.tracked.lock().unwrap().is_empty());
  }

  #[test]
  fn test_click_after_dismiss_is_ignored() {
    let (handler, _, windows) = handler();
    let shown = handler.handle_push(Some(br#"{"body":"x"}"#)).unwrap();

    handler.handle_close(shown.id).unwrap();
    assert!(handler.handle_click(shown.id, Some("open")).unwrap().is_none());
    assert!(windows.actions.lock().unwrap().is_empty());
    assert!(handler.handle_close(999).is_err());
  }
}
