//! Query signatures: the normalized identity of a query call.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

/// Projects call arguments onto the fields that identify a cache entry.
///
/// Arguments left out of the projection (cursors, page sizes) never split the
/// cache: calls that differ only in those share one entry.
pub type KeyProjection = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Build a projection keeping only the named top-level fields.
pub fn pick(fields: &'static [&'static str]) -> KeyProjection {
  Arc::new(move |args| {
    let mut out = Map::new();
    if let Value::Object(map) = args {
      for field in fields {
        if let Some(value) = map.get(*field) {
          out.insert((*field).to_string(), value.clone());
        }
      }
    }
    Value::Object(out)
  })
}

/// Endpoint name plus the canonical form of its key arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QuerySignature {
  endpoint: String,
  key: String,
}

impl QuerySignature {
  /// Build a signature from already-projected key arguments.
  pub fn new(endpoint: &str, key_args: &Value) -> Self {
    Self {
      endpoint: endpoint.to_string(),
      key: canonicalize(key_args).to_string(),
    }
  }

  pub fn endpoint(&self) -> &str {
    &self.endpoint
  }

  /// Canonical JSON of the key arguments.
  pub fn key(&self) -> &str {
    &self.key
  }

  /// SHA256 of `endpoint:key`, a stable fixed-length id for logs.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.endpoint.as_bytes());
    hasher.update(b":");
    hasher.update(self.key.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for QuerySignature {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}({})", self.endpoint, self.key)
  }
}

/// Sort object keys and drop `null` fields so that `{"a":1,"b":null}` and
/// `{"a":1}` identify the same entry.
fn canonicalize(value: &Value) -> Value {
  match value {
    Value::Object(map) => {
      let mut keys: Vec<&String> = map.keys().collect();
      keys.sort();
      let mut out = Map::new();
      for key in keys {
        let v = &map[key];
        if !v.is_null() {
          out.insert(key.clone(), canonicalize(v));
        }
      }
      Value::Object(out)
    }
    Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
    other => other.clone(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_key_order_and_nulls_ignored() {
    let a = QuerySignature::new("getActivities", &json!({"b": 2, "a": 1, "c": null}));
    let b = QuerySignature::new("getActivities", &json!({"a": 1, "b": 2}));
    assert_eq!(a, b);
    assert_eq!(a.cache_hash(), b.cache_hash());
    assert_eq!(a.key(), r#"{"a":1,"b":2}"#);
  }

  #[test]
  fn test_projection_excludes_cursor() {
    let project = pick(&["projectName", "entityIds"]);
    let first = json!({"projectName": "p", "entityIds": ["e1"], "cursor": null, "last": 20});
    let second = json!({"projectName": "p", "entityIds": ["e1"], "cursor": "abc", "last": 50});

    let a = QuerySignature::new("getActivities", &project(&first));
    let b = QuerySignature::new("getActivities", &project(&second));
    assert_eq!(a, b);
  }

  #[test]
  fn test_endpoint_distinguishes() {
    let a = QuerySignature::new("getProject", &json!({"projectName": "p"}));
    let b = QuerySignature::new("getAllProjects", &json!({"projectName": "p"}));
    assert_ne!(a, b);
    assert_ne!(a.cache_hash(), b.cache_hash());
    assert_eq!(a.to_string(), r#"getProject({"projectName":"p"})"#);
  }
}
