use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::control::{self, ControlMessage, ControlReply, ReplyPort};
use crate::engine::Engine;
use crate::http::{Request, Response};
use crate::notify::{Navigation, Notification};
use crate::sync::ReplayReport;

/// Events the host delivers to the engine
#[derive(Debug)]
pub enum Event {
  Install,
  Activate,
  /// Intercepted request; answered by exactly one `Outcome::Response`
  Fetch { request: Request },
  /// Sync opportunity for a registered tag
  Sync { tag: String },
  Push { data: Option<Vec<u8>> },
  NotificationClick { id: u64, action: Option<String> },
  NotificationClose { id: u64 },
  Message {
    message: ControlMessage,
    reply: Option<ReplyPort>,
  },
}

impl Event {
  fn name(&self) -> &'static str {
    match self {
      Self::Install => "install",
      Self::Activate => "activate",
      Self::Fetch { .. } => "fetch",
      Self::Sync { .. } => "sync",
      Self::Push { .. } => "push",
      Self::NotificationClick { .. } => "notificationclick",
      Self::NotificationClose { .. } => "notificationclose",
      Self::Message { .. } => "message",
    }
  }
}

/// What handling one event produced
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
  Installed,
  Activated {
    pruned: Vec<String>,
  },
  Response {
    status: u16,
    headers: BTreeMap<String, String>,
    body: String,
    encoding: BodyEncoding,
  },
  Synced {
    tag: String,
    #[serde(flatten)]
    report: ReplayReport,
  },
  Shown {
    notification: Notification,
  },
  Navigated {
    navigation: Option<Navigation>,
  },
  Dismissed {
    id: u64,
  },
  Replied {
    reply: Option<ControlReply>,
  },
  Failed {
    event: &'static str,
    error: String,
  },
}

/// How a response body is carried in an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
  /// The body was valid UTF-8 and is carried as-is
  Utf8,
  /// Anything else (images, fonts) is carried as standard base64
  Base64,
}

impl From<Response> for Outcome {
  fn from(response: Response) -> Self {
    let (body, encoding) = match String::from_utf8(response.body) {
      Ok(text) => (text, BodyEncoding::Utf8),
      Err(e) => (BASE64.encode(e.into_bytes()), BodyEncoding::Base64),
    };

    Self::Response {
      status: response.status,
      headers: response.headers,
      body,
      encoding,
    }
  }
}

/// An event plus the id the host uses to correlate its outcome
#[derive(Debug)]
pub struct Envelope {
  pub id: u64,
  pub event: Event,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
  pub id: u64,
  #[serde(flatten)]
  pub outcome: Outcome,
}

/// Runs handlers for incoming events.
///
/// Lifecycle events are handled one at a time in arrival order. Every other
/// event gets its own task, and the dispatcher keeps that task alive until
/// its work is done, even after the event channel has closed.
pub struct Dispatcher {
  engine: Arc<Engine>,
  events: mpsc::UnboundedReceiver<Envelope>,
  reports: mpsc::UnboundedSender<Report>,
}

impl Dispatcher {
  /// Create a dispatcher along with its event sender and report receiver
  pub fn new(
    engine: Arc<Engine>,
  ) -> (
    Self,
    mpsc::UnboundedSender<Envelope>,
    mpsc::UnboundedReceiver<Report>,
  ) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (report_tx, report_rx) = mpsc::unbounded_channel();

    let dispatcher = Self {
      engine,
      events: event_rx,
      reports: report_tx,
    };
    (dispatcher, event_tx, report_rx)
  }

  /// Process events until every sender is dropped and all work has finished
  pub async fn run(mut self) {
    let mut pending = JoinSet::new();

    loop {
      tokio::select! {
        envelope = self.events.recv() => {
          let Some(Envelope { id, event }) = envelope else {
            break;
          };
          debug!(id, event = event.name(), "Dispatching event");

          if matches!(event, Event::Install | Event::Activate) {
            let outcome = handle(&self.engine, event).await;
            self.report(id, outcome);
            continue;
          }

          let engine = Arc::clone(&self.engine);
          let reports = self.reports.clone();
          pending.spawn(async move {
            let outcome = handle(&engine, event).await;
            // Host stopped listening; the work itself is done
            let _ = reports.send(Report { id, outcome });
          });
        }
        Some(joined) = pending.join_next(), if !pending.is_empty() => {
          if let Err(e) = joined {
            warn!(error = %e, "Event handler panicked");
          }
        }
      }
    }

    while let Some(joined) = pending.join_next().await {
      if let Err(e) = joined {
        warn!(error = %e, "Event handler panicked");
      }
    }
  }

  fn report(&self, id: u64, outcome: Outcome) {
    let _ = self.reports.send(Report { id, outcome });
  }
}

/// Route one event to its engine handler
async fn handle(engine: &Engine, event: Event) -> Outcome {
  let name = event.name();
  let failed = |e: color_eyre::Report| {
    warn!(event = name, error = %e, "Event handler failed");
    Outcome::Failed {
      event: name,
      error: e.to_string(),
    }
  };

  match event {
    Event::Install => match engine.install().await {
      Ok(()) => Outcome::Installed,
      Err(e) => failed(e),
    },
    Event::Activate => match engine.activate() {
      Ok(pruned) => Outcome::Activated { pruned },
      Err(e) => failed(e),
    },
    Event::Fetch { request } => engine.handle_fetch(&request).await.into(),
    Event::Sync { tag } => match engine.handle_sync(&tag).await {
      Ok(report) => Outcome::Synced { tag, report },
      Err(e) => failed(e),
    },
    Event::Push { data } => match engine.handle_push(data.as_deref()) {
      Ok(notification) => Outcome::Shown { notification },
      Err(e) => failed(e),
    },
    Event::NotificationClick { id, action } => {
      match engine.handle_notification_click(id, action.as_deref()) {
        Ok(navigation) => Outcome::Navigated { navigation },
        Err(e) => failed(e),
      }
    }
    Event::NotificationClose { id } => match engine.handle_notification_close(id) {
      Ok(()) => Outcome::Dismissed { id },
      Err(e) => failed(e),
    },
    Event::Message { message, reply } => {
      let answer = engine.handle_message(message);
      if let Some(answer) = &answer {
        control::reply(reply, answer.clone());
      }
      Outcome::Replied { reply: answer }
    }
  }
}
