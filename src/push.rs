//! Push payloads to notifications, notification clicks to windows.

use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::host::ClientHost;

pub const NOTIFICATION_ICON: &str = "/icons/icon-192x192.png";
pub const NOTIFICATION_BADGE: &str = "/icons/icon-72x72.png";
pub const VIBRATION_PATTERN: [u32; 3] = [100, 50, 100];

/// Action id that opens `data.url`.
const VIEW_ACTION: &str = "view";

/// Push payload as delivered on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct PushPayload {
  pub title: String,
  pub body: String,
  #[serde(default)]
  pub data: Option<Value>,
  /// Absent and null both mean no actions
  #[serde(default)]
  pub actions: Option<Vec<NotificationAction>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
}

/// Everything needed to display one notification. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationDescriptor {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  pub data: Value,
  pub actions: Vec<NotificationAction>,
}

impl From<PushPayload> for NotificationDescriptor {
  fn from(payload: PushPayload) -> Self {
    Self {
      title: payload.title,
      body: payload.body,
      icon: NOTIFICATION_ICON.to_string(),
      badge: NOTIFICATION_BADGE.to_string(),
      vibrate: VIBRATION_PATTERN.to_vec(),
      data: payload.data.unwrap_or(Value::Null),
      actions: payload.actions.unwrap_or_default(),
    }
  }
}

/// Where a notification click should land.
pub fn click_target(action: Option<&str>, data: &Value) -> String {
  match action {
    Some(VIEW_ACTION) => data
      .get("url")
      .and_then(Value::as_str)
      .unwrap_or("/")
      .to_string(),
    _ => "/".to_string(),
  }
}

pub struct PushRouter<H: ClientHost + ?Sized> {
  host: Arc<H>,
}

impl<H: ClientHost + ?Sized> PushRouter<H> {
  pub fn new(host: Arc<H>) -> Self {
    Self { host }
  }

  /// Show a notification for a push event. Returns what was shown, if
  /// anything: an empty push is silent and a malformed one is dropped.
  pub async fn on_push(&self, payload: Option<&[u8]>) -> Result<Option<NotificationDescriptor>> {
    let bytes = match payload {
      Some(bytes) if !bytes.is_empty() => bytes,
      _ => return Ok(None),
    };

    let payload: PushPayload = match serde_json::from_slice(bytes) {
      Ok(payload) => payload,
      Err(err) => {
        tracing::warn!(error = %err, "dropping malformed push payload");
        return Ok(None);
      }
    };

    let notification = NotificationDescriptor::from(payload);
    self.host.show_notification(&notification).await?;
    Ok(Some(notification))
  }

  /// Dismiss the notification and open the window it points at. Returns the
  /// url opened.
  pub async fn on_notification_click(&self, action: Option<&str>, data: &Value) -> Result<String> {
    self.host.close_notification().await;

    let url = click_target(action, data);
    self.host.open_window(&url).await?;
    Ok(url)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::host::HostEvent;
  use crate::testing::RecordingHost;
  use serde_json::json;

  #[tokio::test]
  async fn test_empty_push_is_silent() {
    let host = Arc::new(RecordingHost::default());
    let router = PushRouter::new(host.clone());

    assert!(router.on_push(None).await.unwrap().is_none());
    assert!(router.on_push(Some(b"")).await.unwrap().is_none());
    assert!(host.events().is_empty());
  }

  #[tokio::test]
  async fn test_malformed_push_is_dropped() {
    let host = Arc::new(RecordingHost::default());
    let router = PushRouter::new(host.clone());

    assert!(router.on_push(Some(b"{not json")).await.unwrap().is_none());
    assert!(host.events().is_empty());
  }

  #[tokio::test]
  async fn test_push_builds_descriptor() {
    let host = Arc::new(RecordingHost::default());
    let router = PushRouter::new(host.clone());
    let payload = json!({
      "title": "New assignment",
      "body": "Pole 17 needs a photo",
      "data": { "url": "/assignments/17" },
      "actions": [{ "action": "view", "title": "Open" }]
    });

    let shown = router
      .on_push(Some(payload.to_string().as_bytes()))
      .await
      .unwrap()
      .unwrap();

    assert_eq!(shown.title, "New assignment");
    assert_eq!(shown.icon, NOTIFICATION_ICON);
    assert_eq!(shown.badge, NOTIFICATION_BADGE);
    assert_eq!(shown.vibrate, vec![100, 50, 100]);
    assert_eq!(shown.data["url"], "/assignments/17");
    assert_eq!(shown.actions.len(), 1);
    assert_eq!(host.events(), vec![HostEvent::Notification(shown)]);
  }

  #[tokio::test]
  async fn test_null_actions_still_notify() {
    let host = Arc::new(RecordingHost::default());
    let router = PushRouter::new(host.clone());

    let shown = router
      .on_push(Some(br#"{"title":"t","body":"b","actions":null}"#))
      .await
      .unwrap()
      .unwrap();

    assert!(shown.actions.is_empty());
    assert_eq!(host.events(), vec![HostEvent::Notification(shown)]);
  }

  #[tokio::test]
  async fn test_view_click_opens_data_url() {
    let host = Arc::new(RecordingHost::default());
    let router = PushRouter::new(host.clone());

    let url = router
      .on_notification_click(Some("view"), &json!({ "url": "/capture" }))
      .await
      .unwrap();

    assert_eq!(url, "/capture");
    assert_eq!(
      host.events(),
      vec![
        HostEvent::NotificationClosed,
        HostEvent::WindowOpened {
          url: "/capture".into()
        }
      ]
    );
  }

  #[test]
  fn test_click_targets() {
    assert_eq!(click_target(Some("view"), &Value::Null), "/");
    assert_eq!(click_target(Some("dismiss"), &json!({ "url": "/x" })), "/");
    assert_eq!(click_target(None, &json!({ "url": "/x" })), "/");
  }
}
