//! Staging and replay of mutations that could not reach the network.
//!
//! Tasks live in the staging partition, one entry per task, so they survive
//! restarts. A replay walks them in enqueue order and removes a task only
//! after its request came back with a 2xx status. Anything else leaves the
//! task where it is for the next sync opportunity.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{PartitionKind, RequestKey, StoreManager};
use crate::control::ControlEvent;
use crate::http::{Method, Request, Response};
use crate::net::Network;

/// A mutation waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncTask {
  pub id: String,
  pub tag: String,
  pub url: String,
  pub method: Method,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  #[serde(default)]
  pub body: Option<String>,
  pub enqueued_at: DateTime<Utc>,
  /// Replays that did not succeed so far
  #[serde(default)]
  pub attempts: u32,
  /// Monotonic position in the queue
  pub sequence: u64,
}

impl SyncTask {
  fn key(&self) -> RequestKey {
    RequestKey::staged(&self.id)
  }

  /// The exact request that was originally attempted.
  pub fn to_request(&self) -> Request {
    Request {
      url: self.url.clone(),
      method: self.method,
      headers: self.headers.clone(),
      body: self.body.clone(),
      ..Request::default()
    }
  }
}

/// Counts from one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
  pub replayed: usize,
  pub retained: usize,
  pub dropped: usize,
  /// Tasks another trigger was already replaying, or that vanished meanwhile
  pub skipped: usize,
}

enum TaskOutcome {
  Replayed,
  Retained,
  Dropped,
  Skipped,
}

pub struct SyncQueue {
  store: StoreManager,
  network: Arc<dyn Network>,
  events: broadcast::Sender<ControlEvent>,
  origin: Url,
  max_attempts: Option<u32>,
  next_sequence: AtomicU64,
  registered: Mutex<BTreeSet<String>>,
  in_flight: Mutex<HashSet<String>>,
}

impl SyncQueue {
  /// Build the queue on top of whatever is already staged.
  pub fn new(
    store: StoreManager,
    network: Arc<dyn Network>,
    events: broadcast::Sender<ControlEvent>,
    origin: Url,
    max_attempts: Option<u32>,
  ) -> Result<Self> {
    let queue = Self {
      store,
      network,
      events,
      origin,
      max_attempts,
      next_sequence: AtomicU64::new(1),
      registered: Mutex::new(BTreeSet::new()),
      in_flight: Mutex::new(HashSet::new()),
    };

    let staged = queue.pending(None)?;
    if let Some(last) = staged.last() {
      queue.next_sequence.store(last.sequence + 1, Ordering::SeqCst);
    }
    for task in &staged {
      queue.register(&task.tag)?;
    }
    if !staged.is_empty() {
      info!(count = staged.len(), "Resuming staged mutations");
    }

    Ok(queue)
  }

  /// Stage a mutation under `tag` and register interest in that tag.
  pub fn enqueue(&self, tag: &str, request: &Request) -> Result<SyncTask> {
    let enqueued_at = Utc::now();
    let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
    let task = SyncTask {
      id: format!("{}-{}", enqueued_at.timestamp_millis(), sequence),
      tag: tag.to_string(),
      url: request.url.clone(),
      method: request.method,
      headers: request.headers.clone(),
      body: request.body.clone(),
      enqueued_at,
      attempts: 0,
      sequence,
    };

    self.write(&task)?;
    self.register(tag)?;
    info!(task = %task.id, method = %task.method, url = %task.url, tag, "Staged mutation");

    Ok(task)
  }

  /// Record interest in a sync tag. Returns true the first time a tag is seen.
  pub fn register(&self, tag: &str) -> Result<bool> {
    let mut registered = self
      .registered
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let added = registered.insert(tag.to_string());
    if added {
      debug!(tag, "Registered sync tag");
    }
    Ok(added)
  }

  pub fn registered_tags(&self) -> Result<Vec<String>> {
    let registered = self
      .registered
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(registered.iter().cloned().collect())
  }

  /// Staged tasks in FIFO order, optionally only those for `tag`.
  pub fn pending(&self, tag: Option<&str>) -> Result<Vec<SyncTask>> {
    let mut tasks = Vec::new();
    for key in self.store.keys(PartitionKind::Staging)? {
      let Some(entry) = self.store.get(PartitionKind::Staging, &key)? else {
        continue;
      };
      match serde_json::from_slice::<SyncTask>(&entry.response.body) {
        Ok(task) if tag.map_or(true, |t| t == task.tag) => tasks.push(task),
        Ok(_) => {}
        Err(e) => warn!(%key, error = %e, "Ignoring unreadable staged entry"),
      }
    }
    tasks.sort_by_key(|task| task.sequence);
    Ok(tasks)
  }

  /// Replay every task staged under `tag`, oldest first.
  ///
  /// A failing task stays staged and the pass moves on to the next one.
  pub async fn replay(&self, tag: &str) -> Result<ReplayReport> {
    let tasks = self.pending(Some(tag))?;
    let mut report = ReplayReport::default();

    if tasks.is_empty() {
      debug!(tag, "Nothing staged to replay");
      return Ok(report);
    }

    info!(tag, count = tasks.len(), "Replaying staged mutations");

    for task in tasks {
      let Some(_claim) = InFlight::claim(&self.in_flight, &task.id) else {
        debug!(task = %task.id, "Task already being replayed");
        report.skipped += 1;
        continue;
      };

      let outcome = match self.replay_task(&task).await {
        Ok(outcome) => outcome,
        Err(e) => {
          warn!(task = %task.id, error = %e, "Replay bookkeeping failed");
          TaskOutcome::Retained
        }
      };

      match outcome {
        TaskOutcome::Replayed => report.replayed += 1,
        TaskOutcome::Retained => report.retained += 1,
        TaskOutcome::Dropped => report.dropped += 1,
        TaskOutcome::Skipped => report.skipped += 1,
      }
    }

    Ok(report)
  }

  async fn replay_task(&self, task: &SyncTask) -> Result<TaskOutcome> {
    // Only replay what is still staged right now
    if self.store.get(PartitionKind::Staging, &task.key())?.is_none() {
      return Ok(TaskOutcome::Skipped);
    }

    let request = task.to_request();
    match self.network.fetch(&request).await {
      Ok(response) if response.ok() => {
        self.store.delete(PartitionKind::Staging, &task.key())?;
        self.invalidate(&task.url);
        info!(task = %task.id, status = response.status, "Replayed staged mutation");
        self.broadcast(ControlEvent::SyncCompleted {
          task_id: task.id.clone(),
          tag: task.tag.clone(),
          url: task.url.clone(),
          status: response.status,
        });
        Ok(TaskOutcome::Replayed)
      }
      Ok(response) => {
        warn!(task = %task.id, status = response.status, "Replay rejected by server");
        self.record_failure(task)
      }
      Err(e) => {
        warn!(task = %task.id, error = %e, "Replay failed");
        self.record_failure(task)
      }
    }
  }

  fn record_failure(&self, task: &SyncTask) -> Result<TaskOutcome> {
    let attempts = task.attempts + 1;

    if self.max_attempts.is_some_and(|max| attempts >= max) {
      self.store.delete(PartitionKind::Staging, &task.key())?;
      warn!(task = %task.id, attempts, "Dropping staged mutation after repeated failures");
      self.broadcast(ControlEvent::SyncDropped {
        task_id: task.id.clone(),
        tag: task.tag.clone(),
        url: task.url.clone(),
        attempts,
      });
      return Ok(TaskOutcome::Dropped);
    }

    let retained = SyncTask {
      attempts,
      ..task.clone()
    };
    self.write(&retained)?;
    Ok(TaskOutcome::Retained)
  }

  fn write(&self, task: &SyncTask) -> Result<()> {
    let body =
      serde_json::to_value(task).map_err(|e| eyre!("Failed to serialize sync task: {}", e))?;
    self
      .store
      .put(PartitionKind::Staging, task.key(), Response::json(202, &body))
  }

  /// Drop the cached GET for a URL whose server state just changed.
  fn invalidate(&self, url: &str) {
    match RequestKey::for_request(Method::Get, url, &self.origin) {
      Ok(key) => {
        if let Err(e) = self.store.delete(PartitionKind::Dynamic, &key) {
          warn!(%key, error = %e, "Failed to invalidate cached response");
        }
      }
      Err(e) => warn!(url, error = %e, "Cannot build cache key for invalidation"),
    }
  }

  fn broadcast(&self, event: ControlEvent) {
    // No listening page is fine
    let _ = self.events.send(event);
  }
}

/// Marks a task as being replayed for as long as it is held.
struct InFlight<'a> {
  set: &'a Mutex<HashSet<String>>,
  id: String,
}

impl<'a> InFlight<'a> {
  fn claim(set: &'a Mutex<HashSet<String>>, id: &str) -> Option<Self> {
    let mut guard = set.lock().ok()?;
    if !guard.insert(id.to_string()) {
      return None;
    }
    Some(Self {
      set,
      id: id.to_string(),
    })
  }
}

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    if let Ok(mut guard) = self.set.lock() {
      guard.remove(&self.id);
    }
  }
}
