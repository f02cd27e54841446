//! Line-oriented host: one JSON event per stdin line, one JSON record per
//! stdout line.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::sync::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use url::Url;

use crate::control::{ControlEvent, ControlMessage};
use crate::event::{Event, Outcome, Report};
use crate::http::Request;
use crate::notify::{ClientWindows, Notification, NotificationSurface, WindowClient};

/// A line read from the host.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostEvent {
  Install {
    id: u64,
  },
  Activate {
    id: u64,
  },
  Fetch {
    id: u64,
    request: Request,
  },
  Sync {
    id: u64,
    tag: String,
  },
  Push {
    id: u64,
    #[serde(default)]
    data: Option<String>,
  },
  NotificationClick {
    id: u64,
    notification: u64,
    #[serde(default)]
    action: Option<String>,
  },
  NotificationClose {
    id: u64,
    notification: u64,
  },
  Message {
    id: u64,
    message: Value,
  },
  /// A page opened, moved or gained focus
  Window {
    window: WindowClient,
  },
  /// A page went away
  WindowClosed {
    window: String,
  },
}

/// What a host line turns into.
#[derive(Debug)]
pub enum Parsed {
  Event { id: u64, event: Event },
  /// The line had an id but its event could not be decoded
  Rejected { id: u64, outcome: Outcome },
  Window(WindowClient),
  WindowClosed(String),
}

impl HostEvent {
  pub fn parse(line: &str) -> Result<Parsed> {
    let host: HostEvent =
      serde_json::from_str(line).map_err(|e| eyre!("Malformed host event: {}", e))?;

    let parsed = match host {
      HostEvent::Install { id } => Parsed::Event {
        id,
        event: Event::Install,
      },
      HostEvent::Activate { id } => Parsed::Event {
        id,
        event: Event::Activate,
      },
      HostEvent::Fetch { id, request } => Parsed::Event {
        id,
        event: Event::Fetch { request },
      },
      HostEvent::Sync { id, tag } => Parsed::Event {
        id,
        event: Event::Sync { tag },
      },
      HostEvent::Push { id, data } => Parsed::Event {
        id,
        event: Event::Push {
          data: data.map(String::into_bytes),
        },
      },
      HostEvent::NotificationClick {
        id,
        notification,
        action,
      } => Parsed::Event {
        id,
        event: Event::NotificationClick {
          id: notification,
          action,
        },
      },
      HostEvent::NotificationClose { id, notification } => Parsed::Event {
        id,
        event: Event::NotificationClose { id: notification },
      },
      HostEvent::Message { id, message } => match ControlMessage::from_value(message) {
        // Replies come back as the event's outcome
        Ok(message) => Parsed::Event {
          id,
          event: Event::Message {
            message,
            reply: None,
          },
        },
        Err(e) => Parsed::Rejected {
          id,
          outcome: Outcome::Failed {
            event: "message",
            error: e.to_string(),
          },
        },
      },
      HostEvent::Window { window } => Parsed::Window(window),
      HostEvent::WindowClosed { window } => Parsed::WindowClosed(window),
    };

    Ok(parsed)
  }
}

/// A record written to stdout.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Output<'a> {
  Outcome(&'a Report),
  Broadcast(&'a ControlEvent),
  ShowNotification { notification: &'a Notification },
  CloseNotification { id: u64 },
  FocusWindow { window: &'a str, url: &'a str },
  OpenWindow { url: &'a str },
  Error { message: String },
}

/// Serialize one record as a single line.
pub fn emit(output: &Output) -> Result<()> {
  let line = serde_json::to_string(output)?;
  let mut stdout = std::io::stdout().lock();
  writeln!(stdout, "{}", line)?;
  stdout.flush()?;
  Ok(())
}

/// Write every report and broadcast through `write` until both sources close.
///
/// Reports close when the dispatcher finishes, which also drops the engine;
/// broadcasts still queued at that point are written before returning.
pub async fn forward<W>(
  mut reports: mpsc::UnboundedReceiver<Report>,
  mut broadcasts: broadcast::Receiver<ControlEvent>,
  mut write: W,
) where
  W: FnMut(&Output) -> Result<()>,
{
  let mut listening = true;

  loop {
    tokio::select! {
      report = reports.recv() => match report {
        Some(report) => {
          if let Err(e) = write(&Output::Outcome(&report)) {
            warn!(error = %e, "Failed to write outcome");
          }
        }
        None => break,
      },
      event = broadcasts.recv(), if listening => {
        listening = write_broadcast(event, &mut write);
      }
    }
  }

  while listening {
    let event = broadcasts.recv().await;
    listening = write_broadcast(event, &mut write);
  }
}

/// Returns false once the broadcast channel has closed.
fn write_broadcast<W>(
  event: Result<ControlEvent, broadcast::error::RecvError>,
  write: &mut W,
) -> bool
where
  W: FnMut(&Output) -> Result<()>,
{
  match event {
    Ok(event) => {
      if let Err(e) = write(&Output::Broadcast(&event)) {
        warn!(error = %e, "Failed to write broadcast");
      }
      true
    }
    Err(broadcast::error::RecvError::Lagged(missed)) => {
      warn!(missed, "Broadcast listener lagged");
      true
    }
    Err(broadcast::error::RecvError::Closed) => false,
  }
}

/// Notifications are handed to the host as stdout records.
pub struct StdoutSurface;

impl NotificationSurface for StdoutSurface {
  fn show(&self, notification: &Notification) -> Result<()> {
    emit(&Output::ShowNotification { notification })
  }

  fn close(&self, id: u64) -> Result<()> {
    emit(&Output::CloseNotification { id })
  }
}

/// Pages the host has told us about.
#[derive(Default)]
pub struct WindowRegistry {
  windows: Mutex<Vec<WindowClient>>,
}

impl WindowRegistry {
  /// Add or replace a window; a focused window takes focus from the rest
  pub fn upsert(&self, window: WindowClient) -> Result<()> {
    let mut windows = self.lock()?;
    if window.focused {
      for other in windows.iter_mut() {
        other.focused = false;
      }
    }
    match windows.iter_mut().find(|w| w.id == window.id) {
      Some(existing) => *existing = window,
      None => windows.push(window),
    }
    Ok(())
  }

  pub fn remove(&self, id: &str) -> Result<bool> {
    let mut windows = self.lock()?;
    let before = windows.len();
    windows.retain(|w| w.id != id);
    Ok(windows.len() != before)
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<WindowClient>>> {
    self
      .windows
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl ClientWindows for WindowRegistry {
  fn windows(&self) -> Result<Vec<WindowClient>> {
    Ok(self.lock()?.clone())
  }

  fn focus_and_navigate(&self, window_id: &str, url: &Url) -> Result<()> {
    {
      let mut windows = self.lock()?;
      let Some(target) = windows.iter().position(|w| w.id == window_id) else {
        return Err(eyre!("Unknown window: {}", window_id));
      };
      for (i, window) in windows.iter_mut().enumerate() {
        window.focused = i == target;
      }
      windows[target].url = url.to_string();
    }

    debug!(window = window_id, %url, "Focusing window");
    emit(&Output::FocusWindow {
      window: window_id,
      url: url.as_str(),
    })
  }

  fn open(&self, url: &Url) -> Result<()> {
    emit(&Output::OpenWindow { url: url.as_str() })
  }
}
