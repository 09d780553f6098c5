//! Responses the layer synthesizes when the network cannot answer.

use serde_json::json;

use crate::transport::HttpResponse;

/// A read that could not be served from the network or any cache.
pub fn offline_response(message: &str) -> HttpResponse {
  HttpResponse::json(
    503,
    &json!({
      "error": "offline",
      "message": message,
      "offline": true,
    }),
  )
}

/// A write accepted into the mutation queue, not yet confirmed by the server.
pub fn queued_response(message: &str) -> HttpResponse {
  HttpResponse::json(
    202,
    &json!({
      "queued": true,
      "message": message,
      "offline": true,
    }),
  )
}
