//! Strategy engine that orchestrates caching logic with network fetching.

use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;

use super::generations::{CacheNames, CachePurpose};
use super::traits::{CacheStorage, Served, StoredResponse};
use crate::intercept::Strategy;
use crate::network::{FetchError, Network, ProxyRequest};

/// Strategy engine that serves requests from cache and/or network.
///
/// Every strategy owns its cache writes. Failures to read the cache count as
/// misses and failures to write it are logged and swallowed, so a broken
/// cache never costs the caller a response it already has.
pub struct StrategyEngine<S: CacheStorage + ?Sized, N: Network + ?Sized> {
  storage: Arc<S>,
  network: Arc<N>,
  names: Arc<CacheNames>,
  /// Background revalidations still in flight
  revalidations: Mutex<JoinSet<()>>,
}

impl<S, N> StrategyEngine<S, N>
where
  S: CacheStorage + ?Sized + 'static,
  N: Network + ?Sized + 'static,
{
  pub fn new(storage: Arc<S>, network: Arc<N>, names: Arc<CacheNames>) -> Self {
    Self {
      storage,
      network,
      names,
      revalidations: Mutex::new(JoinSet::new()),
    }
  }

  /// Serve a request with the given strategy.
  ///
  /// Only network-only can fail; every other strategy degrades to a
  /// synthesized response instead.
  pub async fn handle(
    &self,
    strategy: Strategy,
    purpose: CachePurpose,
    request: &ProxyRequest,
  ) -> Result<Served, FetchError> {
    let served = match strategy {
      Strategy::CacheFirst => self.cache_first(purpose, request).await,
      Strategy::NetworkFirst => self.network_first(purpose, request).await,
      Strategy::StaleWhileRevalidate => self.stale_while_revalidate(purpose, request).await,
      Strategy::CacheOnly => self.cache_only(request),
      Strategy::NetworkOnly => return self.network_only(request).await,
    };

    tracing::debug!(
      url = %request.url,
      %strategy,
      source = served.source.as_str(),
      status = served.response.status,
      "served"
    );

    Ok(served)
  }

  /// Return a cached copy without touching the network; on a miss, fetch and
  /// keep successful responses.
  ///
  /// Writes go to the generation of the request's purpose, so images land in
  /// `images` and static assets in `static`.
  async fn cache_first(&self, purpose: CachePurpose, request: &ProxyRequest) -> Served {
    let key = request.cache_key();
    if let Some(hit) = self.lookup(&key) {
      return Served::from_cache(hit);
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        write_through(&*self.storage, self.names.name(purpose), &key, &response);
        Served::from_network(response)
      }
      Err(err) => {
        tracing::debug!(url = %request.url, error = %err, "cache-first miss while offline");
        Served::synthesized(StoredResponse::offline())
      }
    }
  }

  /// Prefer the network; fall back to any cached copy, then to 503.
  async fn network_first(&self, purpose: CachePurpose, request: &ProxyRequest) -> Served {
    let key = request.cache_key();

    match self.network.fetch(request).await {
      Ok(response) => {
        write_through(&*self.storage, self.names.name(purpose), &key, &response);
        Served::from_network(response)
      }
      Err(err) => {
        tracing::debug!(url = %request.url, error = %err, "network-first falling back to cache");
        match self.lookup(&key) {
          Some(hit) => Served::from_cache(hit),
          None => Served::synthesized(StoredResponse::offline()),
        }
      }
    }
  }

  /// Serve the cached copy immediately and refresh it in the background.
  /// Without a cached copy the caller waits for the fetch instead.
  async fn stale_while_revalidate(&self, purpose: CachePurpose, request: &ProxyRequest) -> Served {
    let key = request.cache_key();
    let cached = self.lookup(&key);

    let revalidate = {
      let storage = Arc::clone(&self.storage);
      let network = Arc::clone(&self.network);
      let generation = self.names.name(purpose).to_string();
      let request = request.clone();
      async move {
        let response = network.fetch(&request).await?;
        write_through(&*storage, &generation, &request.cache_key(), &response);
        Ok::<_, FetchError>(response)
      }
    };

    match cached {
      Some(hit) => {
        let url = request.url.clone();
        self.spawn_revalidation(async move {
          if let Err(err) = revalidate.await {
            tracing::debug!(%url, error = %err, "background revalidation failed");
          }
        });
        Served::from_cache(hit)
      }
      None => match revalidate.await {
        Ok(response) => Served::from_network(response),
        Err(_) => Served::synthesized(StoredResponse::offline()),
      },
    }
  }

  fn cache_only(&self, request: &ProxyRequest) -> Served {
    match self.lookup(&request.cache_key()) {
      Some(hit) => Served::from_cache(hit),
      None => Served::synthesized(StoredResponse::not_found()),
    }
  }

  async fn network_only(&self, request: &ProxyRequest) -> Result<Served, FetchError> {
    self.network.fetch(request).await.map(Served::from_network)
  }

  fn lookup(&self, key: &str) -> Option<StoredResponse> {
    match self.storage.match_any(key) {
      Ok(hit) => hit,
      Err(err) => {
        tracing::warn!(key, error = %err, "cache read failed, treating as miss");
        None
      }
    }
  }

  fn spawn_revalidation<F>(&self, task: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    match self.revalidations.lock() {
      Ok(mut set) => {
        // Reap finished tasks so the set does not grow unbounded
        while set.try_join_next().is_some() {}
        set.spawn(task);
      }
      Err(_) => {
        tokio::spawn(task);
      }
    }
  }

  /// Wait for every background revalidation spawned so far.
  pub async fn drain_revalidations(&self) {
    let mut set = match self.revalidations.lock() {
      Ok(mut set) => std::mem::take(&mut *set),
      Err(_) => return,
    };
    while set.join_next().await.is_some() {}
  }
}

/// Store a successful response; failures are logged, never surfaced.
fn write_through<S: CacheStorage + ?Sized>(
  storage: &S,
  generation: &str,
  key: &str,
  response: &StoredResponse,
) {
  if !response.is_success() {
    return;
  }
  if let Err(err) = storage.put(generation, key, response) {
    tracing::warn!(generation, key, error = %err, "cache write failed");
  }
}
