//! Messages crossing the boundary between the interception layer and the
//! application.

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::sync::CapturedRequest;
use crate::transport::{HttpRequest, HttpResponse};

use super::InterceptError;

/// Interception layer → application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LayerMessage {
  /// A write was captured into the mutation queue
  QueueSync(CapturedRequest),
  /// The server looks reachable again; the queue should be drained
  ProcessSyncQueue,
}

/// Application → interception layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  /// Promote a waiting generation immediately
  SkipWaiting,
  /// Drop the layer's own response cache (never the local store)
  ClearCache,
}

/// Work handed to one generation's worker.
pub(crate) enum WorkerCommand {
  Fetch {
    request: HttpRequest,
    reply: oneshot::Sender<Result<HttpResponse, InterceptError>>,
  },
  ClearCache,
}
