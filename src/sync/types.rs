use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::transport::HttpRequest;

/// A captured write, exactly as needed to replay it.
///
/// Serialized as `{ url, method, headers, body, timestamp }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedRequest {
  pub url: String,
  pub method: String,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  #[serde(default)]
  pub body: String,
  /// Capture time (epoch ms)
  pub timestamp: i64,
}

impl CapturedRequest {
  /// Capture `request` now.
  pub fn capture(request: &HttpRequest) -> Self {
    Self {
      url: request.url.clone(),
      method: request.method.clone(),
      headers: request.headers.clone(),
      body: request.body.clone().unwrap_or_default(),
      timestamp: crate::now_ms(),
    }
  }

  /// The request to send on replay. An empty captured body is sent as none.
  pub fn to_request(&self) -> HttpRequest {
    HttpRequest {
      method: self.method.clone(),
      url: self.url.clone(),
      headers: self.headers.clone(),
      body: (!self.body.is_empty()).then(|| self.body.clone()),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
  Pending,
  Processing,
  Failed,
}

impl MutationStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Processing => "processing",
      Self::Failed => "failed",
    }
  }
}

/// One entry of the mutation queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMutation {
  pub id: String,
  #[serde(flatten)]
  pub request: CapturedRequest,
  /// Capture order, breaks ties between equal timestamps
  pub seq: u64,
  pub retry_count: u32,
  pub status: MutationStatus,
  #[serde(default)]
  pub last_error: Option<String>,
}

/// Outcome of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
  pub success: usize,
  pub failed: usize,
}

impl DrainReport {
  pub fn is_empty(&self) -> bool {
    self.success == 0 && self.failed == 0
  }
}

/// Progress notifications from the sync processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncEvent {
  SyncStarted,
  #[serde(rename_all = "camelCase")]
  ItemSynced { id: String },
  #[serde(rename_all = "camelCase")]
  RetryScheduled {
    id: String,
    retry_count: u32,
    delay_ms: u64,
  },
  ItemFailed { id: String, error: String },
  SyncCompleted { success: usize, failed: usize },
  SyncAborted { error: String },
  FailedReset { count: usize },
  ItemDiscarded { id: String },
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_queued_mutation_wire_shape() {
    let item = QueuedMutation {
      id: "m1".into(),
      request: CapturedRequest {
        url: "/clients".into(),
        method: "POST".into(),
        headers: BTreeMap::from([("content-type".into(), "application/json".into())]),
        body: r#"{"name":"Ana"}"#.into(),
        timestamp: 1_700_000_000_000,
      },
      seq: 3,
      retry_count: 0,
      status: MutationStatus::Pending,
      last_error: None,
    };

    let value = serde_json::to_value(&item).unwrap();
    assert_eq!(value["url"], "/clients");
    assert_eq!(value["method"], "POST");
    assert_eq!(value["headers"]["content-type"], "application/json");
    assert_eq!(value["timestamp"], 1_700_000_000_000_i64);
    assert_eq!(value["retryCount"], 0);
    assert_eq!(value["status"], "pending");

    let back: QueuedMutation = serde_json::from_value(value).unwrap();
    assert_eq!(back, item);
  }

  #[test]
  fn test_sync_completed_event_shape() {
    let event = SyncEvent::SyncCompleted {
      success: 1,
      failed: 0,
    };
    assert_eq!(
      serde_json::to_value(event).unwrap(),
      json!({"type": "sync-completed", "success": 1, "failed": 0})
    );
  }

  #[test]
  fn test_replay_request_matches_capture() {
    let original = HttpRequest::post("/calls", r#"{"note":"x"}"#).with_header("x-id", "7");
    let captured = CapturedRequest::capture(&original);
    assert_eq!(captured.to_request(), original);

    let delete = HttpRequest::new("delete", "/calls/7");
    assert_eq!(CapturedRequest::capture(&delete).to_request(), delete);
  }
}
