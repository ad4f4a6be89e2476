mod app;
mod bootstrap;
mod cache;
mod config;
mod db;
mod event;
mod host;
mod intercept;
mod lifecycle;
mod network;
mod push;
mod server;
mod startup;
mod sync;
mod telemetry;
#[cfg(test)]
mod testing;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

use crate::event::EventHandler;

#[derive(Parser, Debug)]
#[command(name = "fibrefield-proxy")]
#[command(about = "Offline network proxy for the FibreField field app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/fibrefield/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Address to listen on
  #[arg(short, long)]
  listen: Option<SocketAddr>,

  /// Upstream origin to proxy
  #[arg(short, long)]
  origin: Option<Url>,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;

  // Command line wins over the file
  if let Some(listen) = args.listen {
    config.listen = listen;
  }
  if let Some(origin) = args.origin {
    config.origin = Some(origin.to_string());
  }

  let _log_guard = telemetry::init(&config)?;

  let app = Arc::new(app::App::new(config)?);
  let state = app.start().await;
  tracing::info!(phase = ?state.phase, "startup finished");

  // Platform events: origin heartbeats feed background sync
  let events = EventHandler::new();
  let watcher = app.watch_connectivity(events.sender());
  let event_loop = tokio::spawn(app.clone().run_events(events));

  let listen = app.config().listen;
  let listener = tokio::net::TcpListener::bind(listen)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", listen, e))?;
  let origin = app.config().origin.as_deref().unwrap_or("<unset>");
  tracing::info!(%listen, origin, "proxy listening");

  axum::serve(listener, server::build_router(app.clone()))
    .with_graceful_shutdown(async {
      if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
      }
    })
    .await
    .map_err(|e| eyre!("Server error: {}", e))?;

  watcher.abort();
  event_loop.abort();
  app.teardown().await;

  Ok(())
}
