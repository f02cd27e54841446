//! Message protocol between the foreground page and the engine.
//!
//! Pages send `{ "type": ..., "data": ... }` and may attach a reply port.
//! The engine also broadcasts unsolicited events (sync results, activation)
//! to every page that subscribed.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::{broadcast, oneshot};

use crate::http::{Method, Request};

/// A command sent by a page.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
  /// Activate a waiting engine immediately
  SkipWaiting,
  /// Stage a mutation for replay on the next sync opportunity
  StageMutation(StageMutation),
  /// Read a cached collection
  QueryCache(CacheQuery),
  GetVersion,
  /// Anything this engine does not understand yet
  Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StageMutation {
  pub url: String,
  #[serde(default = "default_mutation_method")]
  pub method: Method,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  #[serde(default)]
  pub body: Option<Value>,
  /// Sync tag; the configured mutation tag when absent
  #[serde(default)]
  pub tag: Option<String>,
}

fn default_mutation_method() -> Method {
  Method::Post
}

impl StageMutation {
  pub fn to_request(&self) -> Request {
    Request {
      url: self.url.clone(),
      method: self.method,
      headers: self.headers.clone(),
      body: self.body.as_ref().map(|body| match body {
        Value::String(text) => text.clone(),
        other => other.to_string(),
      }),
      ..Request::default()
    }
  }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CacheQuery {
  pub url: String,
}

/// Shape of a message on the wire.
#[derive(Debug, Deserialize)]
struct WireMessage {
  #[serde(rename = "type")]
  kind: String,
  #[serde(default)]
  data: Value,
}

impl ControlMessage {
  /// Decode a wire message. Unknown types decode to `Unknown`; a known type
  /// with a malformed payload is an error.
  pub fn from_value(value: Value) -> Result<Self> {
    let wire: WireMessage =
      serde_json::from_value(value).map_err(|e| eyre!("Malformed control message: {}", e))?;

    let message = match wire.kind.as_str() {
      "SKIP_WAITING" => Self::SkipWaiting,
      "STAGE_MUTATION" => Self::StageMutation(
        serde_json::from_value(wire.data)
          .map_err(|e| eyre!("Malformed STAGE_MUTATION payload: {}", e))?,
      ),
      "QUERY_CACHE" => Self::QueryCache(
        serde_json::from_value(wire.data)
          .map_err(|e| eyre!("Malformed QUERY_CACHE payload: {}", e))?,
      ),
      "GET_VERSION" => Self::GetVersion,
      _ => Self::Unknown(wire.kind),
    };

    Ok(message)
  }
}

/// Reply sent back over a message's reply port.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlReply {
  Ack,
  Staged {
    #[serde(rename = "taskId")]
    task_id: String,
  },
  CachedData {
    data: Value,
  },
  Version {
    version: String,
  },
  Error {
    message: String,
  },
}

/// Unsolicited notice broadcast to listening pages.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlEvent {
  SyncCompleted {
    #[serde(rename = "taskId")]
    task_id: String,
    tag: String,
    url: String,
    status: u16,
  },
  SyncDropped {
    #[serde(rename = "taskId")]
    task_id: String,
    tag: String,
    url: String,
    attempts: u32,
  },
  Activated {
    version: String,
  },
}

/// Reply port attached to a message. Pages that do not care leave it out.
pub type ReplyPort = oneshot::Sender<ControlReply>;

/// Broadcast side of the channel.
#[derive(Clone)]
pub struct ControlChannel {
  events: broadcast::Sender<ControlEvent>,
}

impl ControlChannel {
  pub fn new(capacity: usize) -> Self {
    let (events, _) = broadcast::channel(capacity);
    Self { events }
  }

  /// Sender handed to components that publish events.
  pub fn sender(&self) -> broadcast::Sender<ControlEvent> {
    self.events.clone()
  }

  /// Listen for events, the way an open page would.
  pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
    self.events.subscribe()
  }

  pub fn broadcast(&self, event: ControlEvent) {
    // Nobody listening is not an error
    let _ = self.events.send(event);
  }
}

/// Deliver a reply if the sender asked for one.
pub fn reply(port: Option<ReplyPort>, reply: ControlReply) {
  if let Some(port) = port {
    // The page may have gone away
    let _ = port.send(reply);
  }
}
