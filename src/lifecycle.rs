//! Install/activate transitions and stale-generation eviction.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use url::Url;

use crate::cache::{CacheNames, CachePurpose, CacheStorage};
use crate::host::ClientHost;
use crate::network::{Network, ProxyRequest};

/// Where this version of the proxy is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
  Parsed,
  Installing,
  Installed,
  Activating,
  Activated,
  /// Install failed; this version will never serve clients.
  Redundant,
}

/// Messages clients may post to the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  CleanupCache,
  SkipWaiting,
}

pub struct Lifecycle<S: CacheStorage + ?Sized, N: Network + ?Sized, H: ClientHost + ?Sized> {
  storage: Arc<S>,
  network: Arc<N>,
  host: Arc<H>,
  names: Arc<CacheNames>,
  /// Unset until the configuration names one; install fails without it
  origin: Option<Url>,
  app_shell: Vec<String>,
  state: watch::Sender<WorkerState>,
}

impl<S, N, H> Lifecycle<S, N, H>
where
  S: CacheStorage + ?Sized,
  N: Network + ?Sized,
  H: ClientHost + ?Sized,
{
  pub fn new(
    storage: Arc<S>,
    network: Arc<N>,
    host: Arc<H>,
    names: Arc<CacheNames>,
    origin: Option<Url>,
    app_shell: Vec<String>,
  ) -> Self {
    let (state, _) = watch::channel(WorkerState::Parsed);
    Self {
      storage,
      network,
      host,
      names,
      origin,
      app_shell,
      state,
    }
  }

  pub fn state(&self) -> WorkerState {
    *self.state.borrow()
  }

  /// Open every generation, pre-populate the app shell and ask to activate
  /// straight away. Nothing is written unless every shell entry fetched.
  pub async fn install(&self) -> Result<()> {
    self.state.send_replace(WorkerState::Installing);

    match self.populate_app_shell().await {
      Ok(count) => {
        self.host.skip_waiting().await;
        self.state.send_replace(WorkerState::Installed);
        tracing::info!(version = %self.names.version(), entries = count, "installed");
        Ok(())
      }
      Err(err) => {
        self.state.send_replace(WorkerState::Redundant);
        tracing::error!(version = %self.names.version(), error = %err, "install failed");
        Err(err)
      }
    }
  }

  async fn populate_app_shell(&self) -> Result<usize> {
    for generation in self.names.generations() {
      self.storage.open(&generation.name)?;
    }

    let origin = self
      .origin
      .as_ref()
      .ok_or_else(|| eyre!("No origin configured, cannot fetch the app shell"))?;

    let requests = self
      .app_shell
      .iter()
      .map(|path| {
        origin
          .join(path)
          .map(ProxyRequest::get)
          .map_err(|e| eyre!("Invalid app shell path {}: {}", path, e))
      })
      .collect::<Result<Vec<_>>>()?;

    let fetches = requests.iter().map(|request| async move {
      let response = self
        .network
        .fetch(request)
        .await
        .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;
      if !response.is_success() {
        return Err(eyre!(
          "Failed to fetch {}: status {}",
          request.url,
          response.status
        ));
      }
      Ok::<_, color_eyre::Report>((request.cache_key(), response))
    });
    let entries = futures::future::try_join_all(fetches).await?;

    let shell = self.names.name(CachePurpose::AppShell);
    for (key, response) in &entries {
      self.storage.put(shell, key, response)?;
    }
    Ok(entries.len())
  }

  /// Drop every generation the current version does not know and take over
  /// all open clients. Returns the evicted names.
  pub async fn activate(&self) -> Result<Vec<String>> {
    self.state.send_replace(WorkerState::Activating);
    let evicted = self.evict_stale()?;
    self.host.claim_clients().await;
    self.state.send_replace(WorkerState::Activated);
    tracing::info!(version = %self.names.version(), evicted = evicted.len(), "activated");
    Ok(evicted)
  }

  /// On-demand eviction. Safe to repeat; once clean it deletes nothing.
  pub fn cleanup(&self) -> Result<Vec<String>> {
    self.evict_stale()
  }

  pub async fn on_message(&self, message: ControlMessage) -> Result<Vec<String>> {
    match message {
      ControlMessage::CleanupCache => self.cleanup(),
      ControlMessage::SkipWaiting => {
        self.host.skip_waiting().await;
        Ok(Vec::new())
      }
    }
  }

  fn evict_stale(&self) -> Result<Vec<String>> {
    let mut evicted = Vec::new();
    for name in self.storage.keys()? {
      if self.names.is_valid(&name) {
        continue;
      }
      if self.storage.delete(&name)? {
        tracing::info!(cache = %name, "deleted stale cache generation");
        evicted.push(name);
      }
    }
    Ok(evicted)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{MemoryStorage, StoredResponse};
  use crate::host::HostEvent;
  use crate::testing::{FakeNetwork, RecordingHost};

  const SHELL: [&str; 4] = ["/", "/icons/icon-192x192.png", "/manifest.json", "/sw.js"];

  fn origin() -> Url {
    Url::parse("https://field.test").unwrap()
  }

  fn online_network() -> FakeNetwork {
    SHELL.iter().fold(FakeNetwork::new(), |network, path| {
      network.with_response(origin().join(path).unwrap().as_str(), 200, path)
    })
  }

  fn lifecycle(
    storage: Arc<MemoryStorage>,
    network: Arc<FakeNetwork>,
    host: Arc<RecordingHost>,
  ) -> Lifecycle<MemoryStorage, FakeNetwork, RecordingHost> {
    Lifecycle::new(
      storage,
      network,
      host,
      Arc::new(CacheNames::new("fibrefield", "v2")),
      Some(origin()),
      SHELL.iter().map(|s| s.to_string()).collect(),
    )
  }

  #[tokio::test]
  async fn test_install_populates_app_shell() {
    let storage = Arc::new(MemoryStorage::new());
    let host = Arc::new(RecordingHost::default());
    let lifecycle = lifecycle(storage.clone(), Arc::new(online_network()), host.clone());

    lifecycle.install().await.unwrap();

    assert_eq!(lifecycle.state(), WorkerState::Installed);
    assert_eq!(storage.keys().unwrap().len(), 4);
    for path in SHELL {
      let key = origin().join(path).unwrap().to_string();
      assert!(
        storage.match_in("fibrefield-app-shell-v2", &key).unwrap().is_some(),
        "{path}"
      );
    }
    assert_eq!(
      host.events(),
      vec![HostEvent::SkipWaiting {
        version: "recording".into()
      }]
    );
  }

  #[tokio::test]
  async fn test_install_fails_when_shell_unreachable() {
    let storage = Arc::new(MemoryStorage::new());
    let network = Arc::new(online_network());
    network.set_offline(true);
    let host = Arc::new(RecordingHost::default());
    let lifecycle = lifecycle(storage.clone(), network, host.clone());

    assert!(lifecycle.install().await.is_err());
    assert_eq!(lifecycle.state(), WorkerState::Redundant);
    assert!(storage.match_any("https://field.test/").unwrap().is_none());
    assert!(host.events().is_empty());
  }

  #[tokio::test]
  async fn test_install_without_origin_is_redundant() {
    let storage = Arc::new(MemoryStorage::new());
    let host = Arc::new(RecordingHost::default());
    let lifecycle = Lifecycle::new(
      storage.clone(),
      Arc::new(online_network()),
      host.clone(),
      Arc::new(CacheNames::new("fibrefield", "v2")),
      None,
      SHELL.iter().map(|s| s.to_string()).collect(),
    );

    let err = lifecycle.install().await.unwrap_err();

    assert!(err.to_string().contains("No origin configured"));
    assert_eq!(lifecycle.state(), WorkerState::Redundant);
    assert!(host.events().is_empty());
  }

  #[tokio::test]
  async fn test_activate_leaves_only_valid_generations() {
    let storage = Arc::new(MemoryStorage::new());
    let stale = StoredResponse::new(200, vec![], b"old".to_vec());
    storage.put("fibrefield-app-shell-v1", "/", &stale).unwrap();
    storage.put("unrelated-cache", "/", &stale).unwrap();
    let host = Arc::new(RecordingHost::default());
    let lifecycle = lifecycle(storage.clone(), Arc::new(online_network()), host.clone());

    lifecycle.install().await.unwrap();
    let evicted = lifecycle.activate().await.unwrap();

    assert_eq!(evicted, vec!["fibrefield-app-shell-v1", "unrelated-cache"]);
    let mut remaining = storage.keys().unwrap();
    remaining.sort();
    let names = CacheNames::new("fibrefield", "v2");
    let mut valid: Vec<String> = names.valid_names().iter().map(|s| s.to_string()).collect();
    valid.sort();
    assert_eq!(remaining, valid);
    assert_eq!(lifecycle.state(), WorkerState::Activated);
    assert!(host
      .events()
      .contains(&HostEvent::ClientsClaimed {
        version: "recording".into()
      }));
  }

  #[tokio::test]
  async fn test_cleanup_is_idempotent() {
    let storage = Arc::new(MemoryStorage::new());
    storage.open("fibrefield-api-v0").unwrap();
    storage.open("fibrefield-api-v2").unwrap();
    let lifecycle = lifecycle(
      storage.clone(),
      Arc::new(online_network()),
      Arc::new(RecordingHost::default()),
    );

    let first = lifecycle.on_message(ControlMessage::CleanupCache).await.unwrap();
    let second = lifecycle.on_message(ControlMessage::CleanupCache).await.unwrap();

    assert_eq!(first, vec!["fibrefield-api-v0"]);
    assert!(second.is_empty());
    assert_eq!(storage.keys().unwrap(), vec!["fibrefield-api-v2"]);
  }

  #[test]
  fn test_control_message_wire_format() {
    let message: ControlMessage = serde_json::from_str(r#"{"type":"CLEANUP_CACHE"}"#).unwrap();
    assert_eq!(message, ControlMessage::CleanupCache);
    let message: ControlMessage = serde_json::from_str(r#"{"type":"SKIP_WAITING"}"#).unwrap();
    assert_eq!(message, ControlMessage::SkipWaiting);
    assert!(serde_json::from_str::<ControlMessage>(r#"{"type":"NOPE"}"#).is_err());
  }
}
