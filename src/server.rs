//! HTTP surface: platform events under `/__worker`, everything else proxied.

use axum::{
  body::{Body, Bytes},
  extract::{Json, State},
  http::{HeaderMap, Method, StatusCode, Uri},
  response::{IntoResponse, Response},
  routing::{get, post},
  Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use url::Url;

use crate::app::App;
use crate::cache::Served;
use crate::event::WorkerEvent;
use crate::lifecycle::ControlMessage;
use crate::network::ProxyRequest;
use crate::sync::SYNC_TAG;

/// Response header naming where a proxied response came from.
pub const CACHE_HEADER: &str = "x-fibrefield-cache";

#[derive(Debug)]
pub struct HttpError {
  source: &'static str,
  status: StatusCode,
  message: String,
}

impl HttpError {
  pub fn new(source: &'static str, status: StatusCode, message: impl Into<String>) -> Self {
    Self {
      source,
      status,
      message: message.into(),
    }
  }

  fn internal(source: &'static str, err: color_eyre::Report) -> Self {
    Self::new(source, StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
  }
}

impl IntoResponse for HttpError {
  fn into_response(self) -> Response {
    if self.status.is_server_error() {
      tracing::error!(source = self.source, status = %self.status, error = %self.message, "request failed");
    }
    (self.status, Json(json!({ "error": self.message }))).into_response()
  }
}

pub fn build_router(app: Arc<App>) -> Router {
  let worker = Router::new()
    .route("/status", get(status))
    .route("/sync", post(sync))
    .route("/push", post(push))
    .route("/notificationclick", post(notification_click))
    .route("/message", post(message))
    .route("/queue", post(queue))
    .route("/retry", post(retry));

  Router::new()
    .nest("/__worker", worker)
    .fallback(proxy)
    .with_state(app)
}

async fn status(State(app): State<Arc<App>>) -> Response {
  Json(json!({
    "version": app.names().version(),
    "worker": app.worker_state(),
    "controller": app.host().controller(),
    "bootstrap": app.bootstrap_state(),
    "readiness": app.readiness(),
    "snapshot": app.snapshot(),
    "sync_running": app.sync_running(),
  }))
  .into_response()
}

/// 503 with the readiness state while local data is unavailable.
fn not_ready(app: &App) -> Option<Response> {
  app.require_ready().err().map(|_| {
    (
      StatusCode::SERVICE_UNAVAILABLE,
      Json(json!({ "readiness": app.readiness() })),
    )
      .into_response()
  })
}

#[derive(Debug, Deserialize)]
struct SyncRequest {
  tag: Option<String>,
}

async fn sync(
  State(app): State<Arc<App>>,
  body: Option<Json<SyncRequest>>,
) -> Result<Response, HttpError> {
  if let Some(response) = not_ready(&app) {
    return Ok(response);
  }
  let tag = body
    .and_then(|Json(request)| request.tag)
    .unwrap_or_else(|| SYNC_TAG.to_string());

  let outcome = app
    .dispatch(WorkerEvent::ConnectivityRestored { tag })
    .await
    .map_err(|e| HttpError::internal("server::sync", e))?;
  Ok(Json(outcome).into_response())
}

async fn push(State(app): State<Arc<App>>, body: Bytes) -> Result<Response, HttpError> {
  let payload = (!body.is_empty()).then(|| body.to_vec());
  let outcome = app
    .dispatch(WorkerEvent::Push(payload))
    .await
    .map_err(|e| HttpError::internal("server::push", e))?;
  Ok(Json(outcome).into_response())
}

#[derive(Debug, Deserialize)]
struct ClickRequest {
  action: Option<String>,
  #[serde(default)]
  data: Value,
}

async fn notification_click(
  State(app): State<Arc<App>>,
  Json(request): Json<ClickRequest>,
) -> Result<Response, HttpError> {
  let outcome = app
    .dispatch(WorkerEvent::NotificationClick {
      action: request.action,
      data: request.data,
    })
    .await
    .map_err(|e| HttpError::internal("server::notification_click", e))?;
  Ok(Json(outcome).into_response())
}

async fn message(
  State(app): State<Arc<App>>,
  Json(message): Json<ControlMessage>,
) -> Result<Response, HttpError> {
  let outcome = app
    .dispatch(WorkerEvent::Message(message))
    .await
    .map_err(|e| HttpError::internal("server::message", e))?;
  Ok(Json(outcome).into_response())
}

async fn queue(
  State(app): State<Arc<App>>,
  Json(payload): Json<Value>,
) -> Result<Response, HttpError> {
  if let Some(response) = not_ready(&app) {
    return Ok(response);
  }
  let task = app
    .enqueue(&payload)
    .map_err(|e| HttpError::internal("server::queue", e))?;
  Ok((StatusCode::CREATED, Json(task)).into_response())
}

async fn retry(State(app): State<Arc<App>>) -> Result<Response, HttpError> {
  let state = app
    .retry()
    .await
    .map_err(|e| HttpError::new("server::retry", StatusCode::CONFLICT, format!("{e:#}")))?;
  Ok(Json(json!({ "bootstrap": state, "readiness": state.readiness() })).into_response())
}

async fn proxy(
  State(app): State<Arc<App>>,
  method: Method,
  uri: Uri,
  headers: HeaderMap,
  body: Bytes,
) -> Result<Response, HttpError> {
  let origin = app.origin().map_err(|e| {
    HttpError::new("server::proxy", StatusCode::SERVICE_UNAVAILABLE, format!("{e:#}"))
  })?;
  let url = upstream_url(origin, &uri);

  let request = ProxyRequest {
    method: method.as_str().to_string(),
    url,
    headers: headers
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect(),
    body: body.to_vec(),
  };

  let served = app
    .serve(&request)
    .await
    .map_err(|e| HttpError::new("server::proxy", StatusCode::BAD_GATEWAY, e.to_string()))?;
  Ok(served_response(served))
}

/// The origin with the request's path and query. Never takes the host from
/// the request, so `//other-host/...` stays a path on the origin.
fn upstream_url(origin: &Url, uri: &Uri) -> Url {
  let mut url = origin.clone();
  url.set_path(uri.path());
  url.set_query(uri.query());
  url
}

fn served_response(served: Served) -> Response {
  let status = StatusCode::from_u16(served.response.status).unwrap_or(StatusCode::BAD_GATEWAY);
  let mut builder = Response::builder().status(status);
  for (name, value) in &served.response.headers {
    builder = builder.header(name.as_str(), value.as_str());
  }
  builder
    .header(CACHE_HEADER, served.source.as_str())
    .body(Body::from(served.response.body))
    .unwrap_or_else(|e| {
      HttpError::new("server::proxy", StatusCode::BAD_GATEWAY, e.to_string()).into_response()
    })
}
