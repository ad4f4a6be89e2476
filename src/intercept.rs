//! Request classification.
//!
//! Decides, purely from method and URL shape, whether a request is handled
//! by the proxy and with which strategy. Response headers and request bodies
//! never take part in the decision.

use std::fmt;
use url::Url;

use crate::cache::CachePurpose;

/// Style, script and font extensions served cache-first.
const STATIC_EXTENSIONS: &[&str] = &["css", "js", "woff", "woff2", "ttf", "eot"];

/// Image extensions served cache-first.
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "svg", "webp", "ico"];

/// Request-handling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
  CacheOnly,
  NetworkOnly,
}

impl fmt::Display for Strategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Strategy::CacheFirst => write!(f, "cache-first"),
      Strategy::NetworkFirst => write!(f, "network-first"),
      Strategy::StaleWhileRevalidate => write!(f, "stale-while-revalidate"),
      Strategy::CacheOnly => write!(f, "cache-only"),
      Strategy::NetworkOnly => write!(f, "network-only"),
    }
  }
}

/// What the proxy does with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interception {
  /// Forward to the network untouched.
  Bypass,
  /// Serve through a strategy, caching into the generation for `purpose`.
  Handle {
    strategy: Strategy,
    purpose: CachePurpose,
  },
}

#[derive(Debug, Clone)]
pub struct Interceptor {
  api_prefix: String,
  navigation_routes: Vec<String>,
}

impl Interceptor {
  pub fn new(api_prefix: impl Into<String>, navigation_routes: Vec<String>) -> Self {
    Self {
      api_prefix: api_prefix.into(),
      navigation_routes,
    }
  }

  /// Classify a request. First match wins.
  pub fn classify(&self, method: &str, url: &Url) -> Interception {
    if !method.eq_ignore_ascii_case("GET") {
      return Interception::Bypass;
    }

    // Extension, data, blob and similar internal schemes are not ours
    if !matches!(url.scheme(), "http" | "https") {
      return Interception::Bypass;
    }

    let path = url.path();
    let handle = |strategy, purpose| Interception::Handle { strategy, purpose };

    match extension(path).as_deref() {
      Some(ext) if STATIC_EXTENSIONS.contains(&ext) => {
        return handle(Strategy::CacheFirst, CachePurpose::StaticAssets)
      }
      Some(ext) if IMAGE_EXTENSIONS.contains(&ext) => {
        return handle(Strategy::CacheFirst, CachePurpose::Images)
      }
      _ => {}
    }

    if path.starts_with(&self.api_prefix) {
      return handle(Strategy::NetworkFirst, CachePurpose::ApiResponses);
    }

    if self.is_navigation(path) {
      return handle(Strategy::StaleWhileRevalidate, CachePurpose::AppShell);
    }

    handle(Strategy::NetworkFirst, CachePurpose::ApiResponses)
  }

  fn is_navigation(&self, path: &str) -> bool {
    if path == "/" {
      return true;
    }
    let trimmed = path.trim_end_matches('/');
    self.navigation_routes.iter().any(|route| route == trimmed)
  }
}

/// Lowercased extension of the last path segment, if any.
fn extension(path: &str) -> Option<String> {
  let segment = path.rsplit('/').next()?;
  let (stem, ext) = segment.rsplit_once('.')?;
  if stem.is_empty() || ext.is_empty() {
    return None;
  }
  Some(ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn interceptor() -> Interceptor {
    Interceptor::new(
      "/api/",
      vec![
        "/dashboard".to_string(),
        "/capture".to_string(),
        "/assignments".to_string(),
      ],
    )
  }

  fn classify(path: &str) -> Interception {
    let url = Url::parse("https://field.test").unwrap().join(path).unwrap();
    interceptor().classify("GET", &url)
  }

  fn strategy(path: &str) -> Strategy {
    match classify(path) {
      Interception::Handle { strategy, .. } => strategy,
      Interception::Bypass => panic!("{path} was bypassed"),
    }
  }

  #[test]
  fn test_asset_extensions_are_cache_first() {
    for ext in STATIC_EXTENSIONS.iter().chain(IMAGE_EXTENSIONS) {
      for path in [format!("/assets/file.{ext}"), format!("/api/export/file.{ext}")] {
        assert_eq!(strategy(&path), Strategy::CacheFirst, "{path}");
      }
    }
  }

  #[test]
  fn test_asset_purposes() {
    assert_eq!(
      classify("/assets/app.css"),
      Interception::Handle {
        strategy: Strategy::CacheFirst,
        purpose: CachePurpose::StaticAssets
      }
    );
    assert_eq!(
      classify("/icons/icon-192x192.PNG"),
      Interception::Handle {
        strategy: Strategy::CacheFirst,
        purpose: CachePurpose::Images
      }
    );
  }

  #[test]
  fn test_query_string_ignored_for_extension() {
    assert_eq!(strategy("/assets/app.js?v=42"), Strategy::CacheFirst);
  }

  #[test]
  fn test_api_prefix_is_network_first() {
    for path in ["/api/", "/api/poles", "/api/poles/17?include=photos"] {
      assert_eq!(strategy(path), Strategy::NetworkFirst, "{path}");
    }
  }

  #[test]
  fn test_navigation_routes_are_swr() {
    for path in ["/", "/dashboard", "/capture", "/assignments/"] {
      assert_eq!(strategy(path), Strategy::StaleWhileRevalidate, "{path}");
    }
  }

  #[test]
  fn test_default_is_network_first() {
    for path in ["/reports", "/capture/17", "/manifest.json"] {
      assert_eq!(strategy(path), Strategy::NetworkFirst, "{path}");
    }
  }

  #[test]
  fn test_non_get_bypasses() {
    let url = Url::parse("https://field.test/assets/app.css").unwrap();
    for method in ["POST", "PUT", "DELETE", "PATCH", "HEAD"] {
      assert_eq!(interceptor().classify(method, &url), Interception::Bypass);
    }
    assert_ne!(interceptor().classify("get", &url), Interception::Bypass);
  }

  #[test]
  fn test_internal_schemes_bypass() {
    for raw in ["chrome-extension://abc/app.js", "data:text/plain,hi", "blob:https://field.test/1"] {
      let url = Url::parse(raw).unwrap();
      assert_eq!(interceptor().classify("GET", &url), Interception::Bypass, "{raw}");
    }
  }

  #[test]
  fn test_extension_parsing() {
    assert_eq!(extension("/a/b.CSS"), Some("css".to_string()));
    assert_eq!(extension("/a/.hidden"), None);
    assert_eq!(extension("/a.b/c"), None);
    assert_eq!(extension("/"), None);
  }
}
