//! Error types shared by the cache core and the backend catalogue.

use thiserror::Error;

/// Result type alias for cache and endpoint operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Everything a fetch or a mutation can fail with.
///
/// Errors are stored in cache entries and handed to every subscriber, so the
/// enum is `Clone` and carries rendered messages rather than source errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
  /// The request never completed (offline, timeout, connection reset).
  #[error("Network error: {0}")]
  Network(String),

  /// The server answered with a non-2xx status.
  #[error("Server error {status}: {detail}")]
  Server { status: u16, detail: String },

  /// An optimistic patch could not find the item it was meant to change.
  #[error("Conflict: {0}")]
  Conflict(String),

  #[error("Unknown endpoint: {0}")]
  UnknownEndpoint(String),

  /// The response body did not match the endpoint's result schema.
  #[error("Failed to decode response: {0}")]
  Decode(String),
}

impl SyncError {
  /// Build a server error from a status code and an optional response body.
  ///
  /// Mirrors the backend's `{"detail": "..."}` error shape and falls back to
  /// `Error <status>` when no detail is present.
  pub fn server(status: u16, body: Option<&serde_json::Value>) -> Self {
    let detail = body
      .and_then(|b| b.get("detail"))
      .and_then(|d| d.as_str())
      .map(String::from)
      .unwrap_or_else(|| format!("Error {}", status));
    SyncError::Server { status, detail }
  }

  /// Whether the failure happened before a response was received.
  pub fn is_network(&self) -> bool {
    matches!(self, SyncError::Network(_))
  }
}

impl From<serde_json::Error> for SyncError {
  fn from(e: serde_json::Error) -> Self {
    SyncError::Decode(e.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_server_error_uses_detail() {
    let body = json!({ "detail": "Bundle A not found" });
    let err = SyncError::server(404, Some(&body));
    assert_eq!(
      err,
      SyncError::Server {
        status: 404,
        detail: "Bundle A not found".to_string()
      }
    );
    assert_eq!(err.to_string(), "Server error 404: Bundle A not found");
  }

  #[test]
  fn test_server_error_without_body() {
    let err = SyncError::server(500, None);
    assert_eq!(err.to_string(), "Server error 500: Error 500");
    assert!(!err.is_network());
  }
}
