//! Network access to the upstream origin.

use async_trait::async_trait;
use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::cache::StoredResponse;

/// Headers that describe a single hop and are never forwarded or stored.
const HOP_BY_HOP: &[&str] = &[
  "connection",
  "content-length",
  "host",
  "keep-alive",
  "proxy-connection",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
  HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// A request as seen by the proxy, already resolved against the origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
  pub method: String,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl ProxyRequest {
  pub fn get(url: Url) -> Self {
    Self {
      method: "GET".to_string(),
      url,
      headers: Vec::new(),
      body: Vec::new(),
    }
  }

  pub fn head(url: Url) -> Self {
    Self {
      method: "HEAD".to_string(),
      ..Self::get(url)
    }
  }

  /// The key responses for this request are stored under.
  pub fn cache_key(&self) -> String {
    self.url.as_str().to_string()
  }
}

#[derive(Debug, Error)]
pub enum FetchError {
  #[error("network unreachable: {0}")]
  Unreachable(String),
  #[error("request timed out after {0:?}")]
  Timeout(Duration),
  #[error("invalid request: {0}")]
  InvalidRequest(String),
}

/// Anything that can turn a request into a response over the network.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &ProxyRequest) -> Result<StoredResponse, FetchError>;
}

/// reqwest-backed network client.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
  timeout: Duration,
}

impl HttpNetwork {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, timeout })
  }

  /// The underlying client, shared with the sync transport.
  pub fn client(&self) -> &reqwest::Client {
    &self.client
  }

  fn classify(&self, err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
      FetchError::Timeout(self.timeout)
    } else if err.is_builder() {
      FetchError::InvalidRequest(err.to_string())
    } else {
      FetchError::Unreachable(err.to_string())
    }
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &ProxyRequest) -> Result<StoredResponse, FetchError> {
    let method = Method::from_bytes(request.method.as_bytes())
      .map_err(|_| FetchError::InvalidRequest(format!("bad method {}", request.method)))?;

    // Stamp before sending so the most recently issued fetch wins in storage
    let issued_at = Utc::now();

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      if !is_hop_by_hop(name) {
        builder = builder.header(name.as_str(), value.as_str());
      }
    }
    if !request.body.is_empty() {
      builder = builder.body(request.body.clone());
    }

    let response = builder.send().await.map_err(|e| self.classify(e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await.map_err(|e| self.classify(e))?;

    tracing::debug!(url = %request.url, status, "fetched from origin");

    Ok(StoredResponse::new(status, headers, body.to_vec()).with_stored_at(issued_at))
  }
}
