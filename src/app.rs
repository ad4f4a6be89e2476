use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use crate::bootstrap::{Bootstrap, BootstrapState, Phase, Readiness};
use crate::cache::{CacheNames, CacheStorage, MemoryStorage, Served, SqliteStorage, StrategyEngine};
use crate::config::{CacheBackend, Config};
use crate::db::{DatabaseSlot, HttpSyncTransport, SqliteOfflineStore};
use crate::event::{watch_origin, EventHandler, EventOutcome, WorkerEvent};
use crate::host::BroadcastHost;
use crate::intercept::{Interception, Interceptor};
use crate::lifecycle::{ControlMessage, Lifecycle, WorkerState};
use crate::network::{FetchError, HttpNetwork, Network, ProxyRequest};
use crate::push::PushRouter;
use crate::startup::{AppSteps, OfflineSnapshot};
use crate::sync::{SyncQueue, SyncTask};

type OfflineActions = SqliteOfflineStore<HttpSyncTransport>;

/// Everything the proxy runs on, built once at startup and shared by the
/// HTTP surface and the event loop.
pub struct App {
  config: Config,
  /// None when the configured origin is missing or malformed; bootstrap
  /// reports why
  origin: Option<Url>,
  names: Arc<CacheNames>,
  interceptor: Interceptor,
  network: Arc<HttpNetwork>,
  engine: StrategyEngine<dyn CacheStorage, HttpNetwork>,
  lifecycle: Lifecycle<dyn CacheStorage, HttpNetwork, BroadcastHost>,
  queue: Arc<SyncQueue<OfflineActions>>,
  push: PushRouter<BroadcastHost>,
  host: Arc<BroadcastHost>,
  db: Arc<DatabaseSlot>,
  steps: Arc<AppSteps<OfflineActions>>,
  bootstrap: Bootstrap<AppSteps<OfflineActions>>,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let origin = match config.origin_url() {
      Ok(url) => Some(url),
      Err(err) => {
        tracing::warn!(error = %err, "origin unusable, offline features will not start");
        None
      }
    };
    let names = Arc::new(CacheNames::new(&config.cache.prefix, &config.cache.version));

    let storage: Arc<dyn CacheStorage> = match config.cache.backend {
      CacheBackend::Sqlite => Arc::new(SqliteStorage::open(&config.cache_db_path()?)?),
      CacheBackend::Memory => Arc::new(MemoryStorage::new()),
    };
    let network = Arc::new(HttpNetwork::new(Duration::from_secs(
      config.network.timeout_secs,
    ))?);
    let host = Arc::new(BroadcastHost::new(names.version()));

    let engine = StrategyEngine::new(storage.clone(), network.clone(), names.clone());
    let lifecycle = Lifecycle::new(
      storage,
      network.clone(),
      host.clone(),
      names.clone(),
      origin.clone(),
      config.cache.app_shell.clone(),
    );

    let db = Arc::new(DatabaseSlot::default());
    let transport = Arc::new(HttpSyncTransport::new(
      network.client().clone(),
      config.sync_endpoint().ok(),
    ));
    let queue = Arc::new(SyncQueue::new(Arc::new(SqliteOfflineStore::new(
      db.clone(),
      transport,
    ))));

    let steps = Arc::new(AppSteps::new(config.clone(), db.clone(), queue.clone()));
    let bootstrap = Bootstrap::new(steps.clone());

    Ok(Self {
      interceptor: Interceptor::new(
        config.cache.api_prefix.clone(),
        config.cache.navigation_routes.clone(),
      ),
      push: PushRouter::new(host.clone()),
      config,
      origin,
      names,
      network,
      engine,
      lifecycle,
      queue,
      host,
      db,
      steps,
      bootstrap,
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn origin(&self) -> Result<&Url> {
    self
      .origin
      .as_ref()
      .ok_or_else(|| eyre!("No origin configured"))
  }

  pub fn names(&self) -> &CacheNames {
    &self.names
  }

  pub fn host(&self) -> &BroadcastHost {
    &self.host
  }

  pub fn network(&self) -> Arc<HttpNetwork> {
    self.network.clone()
  }

  pub fn worker_state(&self) -> WorkerState {
    self.lifecycle.state()
  }

  pub fn bootstrap_state(&self) -> BootstrapState {
    self.bootstrap.state()
  }

  pub fn readiness(&self) -> Readiness {
    self.bootstrap.readiness()
  }

  pub fn snapshot(&self) -> Option<OfflineSnapshot> {
    self.steps.snapshot()
  }

  pub fn sync_running(&self) -> bool {
    self.queue.is_running()
  }

  /// Install and activate this version, then bring local storage online.
  ///
  /// A failed install leaves the existing caches serving; a failed bootstrap
  /// is recorded for `retry`. Neither stops the proxy.
  pub async fn start(&self) -> BootstrapState {
    match self.dispatch(WorkerEvent::Install).await {
      Ok(_) => {
        if let Err(err) = self.dispatch(WorkerEvent::Activate).await {
          tracing::error!(error = %err, "activation failed");
        }
      }
      Err(err) => tracing::warn!(error = %err, "install failed, serving existing caches"),
    }

    match self.bootstrap.run().await {
      Ok(state) => state,
      Err(err) => {
        tracing::warn!(error = %err, "bootstrap not started");
        self.bootstrap.state()
      }
    }
  }

  pub async fn retry(&self) -> Result<BootstrapState> {
    self.bootstrap.retry().await
  }

  /// Answer one intercepted request.
  pub async fn serve(&self, request: &ProxyRequest) -> Result<Served, FetchError> {
    match self.interceptor.classify(&request.method, &request.url) {
      Interception::Bypass => {
        tracing::debug!(method = %request.method, url = %request.url, "bypass");
        self.network.fetch(request).await.map(Served::from_network)
      }
      Interception::Handle { strategy, purpose } => {
        self.engine.handle(strategy, purpose, request).await
      }
    }
  }

  /// Record an action taken offline for the next sync pass.
  pub fn enqueue(&self, payload: &Value) -> Result<SyncTask> {
    self.require_ready()?;
    self.queue.store().enqueue(payload)
  }

  pub fn require_ready(&self) -> Result<()> {
    match self.readiness() {
      Readiness::Ready => Ok(()),
      Readiness::NotReady => Err(eyre!("Local data is still starting up")),
      Readiness::Failed(message) => Err(eyre!("Local data failed to start: {}", message)),
    }
  }

  pub async fn dispatch(&self, event: WorkerEvent) -> Result<EventOutcome> {
    match event {
      WorkerEvent::Install => {
        self.lifecycle.install().await?;
        Ok(EventOutcome::Installed)
      }
      WorkerEvent::Activate => {
        let evicted = self.lifecycle.activate().await?;
        Ok(EventOutcome::Activated { evicted })
      }
      WorkerEvent::ConnectivityRestored { tag } => {
        self.require_ready()?;
        let result = self.queue.on_connectivity_restored(&tag).await?;
        Ok(EventOutcome::Synced { result })
      }
      WorkerEvent::Push(payload) => {
        let notification = self.push.on_push(payload.as_deref()).await?;
        Ok(EventOutcome::Pushed { notification })
      }
      WorkerEvent::NotificationClick { action, data } => {
        let url = self
          .push
          .on_notification_click(action.as_deref(), &data)
          .await?;
        Ok(EventOutcome::WindowOpened { url })
      }
      WorkerEvent::Message(message) => {
        let evicted = self.lifecycle.on_message(message).await?;
        Ok(match message {
          ControlMessage::CleanupCache => EventOutcome::CacheCleaned { evicted },
          ControlMessage::SkipWaiting => EventOutcome::WaitingSkipped,
        })
      }
    }
  }

  /// Handle queued platform events for as long as the handler lives.
  pub async fn run_events(self: Arc<Self>, mut events: EventHandler) {
    while let Some(event) = events.next().await {
      let app = self.clone();
      tokio::spawn(async move {
        match app.dispatch(event).await {
          Ok(outcome) => tracing::debug!(?outcome, "event handled"),
          Err(err) => tracing::warn!(error = %err, "event failed"),
        }
      });
    }
  }

  /// Check origin reachability once bootstrap reaches `Ready`,
  /// including after a retry, and feed restore events to `tx`.
  pub fn watch_connectivity(
    self: &Arc<Self>,
    tx: mpsc::UnboundedSender<WorkerEvent>,
  ) -> JoinHandle<()> {
    let app = self.clone();
    tokio::spawn(async move {
      let mut state = app.bootstrap.subscribe();
      if state.wait_for(|s| s.phase == Phase::Ready).await.is_err() {
        return;
      }
      let origin = match app.origin() {
        Ok(origin) => origin.clone(),
        Err(err) => {
          tracing::warn!(error = %err, "not watching connectivity");
          return;
        }
      };
      let interval = Duration::from_secs(app.config.network.heartbeat_interval_secs);
      watch_origin(app.network(), ProxyRequest::head(origin), interval, tx).await;
    })
  }

  /// Stop background work before exit.
  pub async fn teardown(&self) {
    self.steps.cancel_timer();
    self.engine.drain_revalidations().await;
    self.db.clear();
    tracing::info!("proxy shut down");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::path::Path;

  fn config_without_origin(dir: &Path) -> Config {
    let mut config = Config::default();
    config.cache.backend = CacheBackend::Memory;
    config.data_dir = Some(dir.to_path_buf());
    config.logging.file = false;
    config
  }

  #[tokio::test]
  async fn test_missing_origin_reports_failed_readiness() {
    let dir = tempfile::tempdir().unwrap();
    let app = Arc::new(App::new(config_without_origin(dir.path())).unwrap());
    assert!(app.origin().is_err());

    let state = app.start().await;
    assert_eq!(state.phase, Phase::Failed);
    match app.readiness() {
      Readiness::Failed(message) => assert!(message.contains("No origin"), "{message}"),
      other => panic!("expected failed readiness, got {other:?}"),
    }
    assert!(app.enqueue(&serde_json::json!({ "kind": "note" })).is_err());
  }

  #[tokio::test]
  async fn test_connectivity_watch_waits_for_ready() {
    let dir = tempfile::tempdir().unwrap();
    let app = Arc::new(App::new(config_without_origin(dir.path())).unwrap());
    app.start().await;

    let events = EventHandler::new();
    let watcher = app.watch_connectivity(events.sender());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!watcher.is_finished());
    watcher.abort();
  }
}
