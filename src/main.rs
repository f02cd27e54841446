use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use storefront_sw::cache::SqliteStorage;
use storefront_sw::config::Config;
use storefront_sw::host::{
  emit, forward, HostEvent, Output, Parsed, StdoutSurface, WindowRegistry,
};
use storefront_sw::net::HttpNetwork;
use storefront_sw::{Dispatcher, Engine, Envelope, Platform, Report};

#[derive(Parser, Debug)]
#[command(name = "storefront-sw")]
#[command(about = "Offline-support engine for a web storefront")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/storefront-sw/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Path to the cache database
  #[arg(long)]
  db: Option<PathBuf>,

  /// Cache version tag; overrides the configured one
  #[arg(long = "version-tag")]
  version_tag: Option<String>,
}

/// Log to a daily file; stdout carries the event protocol.
fn init_logging() -> Result<WorkerGuard> {
  let log_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("storefront-sw")
    .join("logs");
  std::fs::create_dir_all(&log_dir)?;

  let appender = tracing_appender::rolling::daily(log_dir, "storefront-sw.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter =
    EnvFilter::try_from_env("STOREFRONT_SW_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _guard = init_logging()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(db) = args.db {
    config.storage_path = Some(db);
  }
  if let Some(version) = args.version_tag {
    config.cache_version = version;
  }

  let storage = SqliteStorage::open(&config.storage_path()?)?;
  let windows = Arc::new(WindowRegistry::default());
  let platform = Platform {
    network: Arc::new(HttpNetwork::new(config.origin_url()?)?),
    notifications: Arc::new(StdoutSurface),
    windows: windows.clone(),
  };

  let engine = Arc::new(Engine::new(config, storage, platform)?);
  let broadcasts = engine.subscribe();
  let (dispatcher, events, reports) = Dispatcher::new(engine);
  let dispatcher = tokio::spawn(dispatcher.run());

  let printer = tokio::spawn(forward(reports, broadcasts, emit));

  info!("Reading events from stdin");
  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  while let Some(line) = lines.next_line().await? {
    if line.trim().is_empty() {
      continue;
    }

    let result = match HostEvent::parse(&line) {
      Ok(Parsed::Event { id, event }) => events
        .send(Envelope { id, event })
        .map_err(|_| eyre!("Dispatcher stopped")),
      Ok(Parsed::Rejected { id, outcome }) => {
        warn!(id, "Rejected undecodable event");
        emit(&Output::Outcome(&Report { id, outcome }))
      }
      Ok(Parsed::Window(window)) => windows.upsert(window),
      Ok(Parsed::WindowClosed(id)) => windows.remove(&id).map(|_| ()),
      Err(e) => Err(e),
    };

    if let Err(e) = result {
      warn!(error = %e, "Rejected host event");
      emit(&Output::Error {
        message: e.to_string(),
      })?;
    }
  }

  // EOF: finish in-flight work before exiting
  drop(events);
  dispatcher.await?;
  printer.await?;
  info!("Shut down");

  Ok(())
}
