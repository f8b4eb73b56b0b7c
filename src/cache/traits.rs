//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::fmt::Debug;

use crate::error::{SyncError, SyncResult};

/// Trait for entities that can be kept in the entity store.
///
/// Implementors must provide a unique cache key and optionally an updated_at
/// timestamp used to keep the newest representation.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned {
  /// Unique identifier for this entity (e.g., bundle name, activity id)
  fn cache_key(&self) -> String;

  /// Last modification time, if the server reports one.
  fn updated_at(&self) -> Option<DateTime<Utc>>;

  /// Entity type name for storage organization (e.g., "bundle", "project")
  fn entity_type() -> &'static str;
}

/// A query result type the cache can hold.
///
/// One payload type covers every endpoint of a cache instance, usually an enum
/// with one variant per endpoint result.
pub trait Payload: Clone + Debug + PartialEq + Send + Sync + 'static {
  /// Entities carried by this result. Written to the entity store on every
  /// successful fetch.
  fn entities(&self) -> Vec<EntityRecord> {
    Vec::new()
  }
}

/// Serialized entity extracted from a query result.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
  pub entity_type: &'static str,
  pub key: String,
  pub updated_at: Option<DateTime<Utc>>,
  pub value: Value,
}

impl EntityRecord {
  pub fn from_entity<T: Cacheable>(entity: &T) -> SyncResult<Self> {
    Ok(Self {
      entity_type: T::entity_type(),
      key: entity.cache_key(),
      updated_at: entity.updated_at(),
      value: serde_json::to_value(entity).map_err(|e| SyncError::Decode(e.to_string()))?,
    })
  }
}

/// Fetch status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryStatus {
  /// Nothing has been requested yet
  #[default]
  Uninitialized,
  /// A fetch is in flight (data from an earlier fetch may still be present)
  Loading,
  /// Last fetch succeeded
  Success,
  /// Last fetch failed
  Error,
}

/// What a subscriber sees of a cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnapshot<D> {
  pub data: Option<D>,
  pub status: QueryStatus,
  /// Present iff `status` is `Error`
  pub error: Option<SyncError>,
  /// When the data was last written by a successful fetch
  pub fetched_at: Option<DateTime<Utc>>,
}

impl<D> QuerySnapshot<D> {
  pub fn uninitialized() -> Self {
    Self {
      data: None,
      status: QueryStatus::Uninitialized,
      error: None,
      fetched_at: None,
    }
  }

  pub fn is_loading(&self) -> bool {
    self.status == QueryStatus::Loading
  }

  pub fn is_success(&self) -> bool {
    self.status == QueryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Error
  }

  /// Whether the entry has reached a terminal state for the current fetch.
  pub fn is_settled(&self) -> bool {
    matches!(self.status, QueryStatus::Success | QueryStatus::Error)
  }

  pub fn data(&self) -> Option<&D> {
    self.data.as_ref()
  }

  pub fn error(&self) -> Option<&SyncError> {
    self.error.as_ref()
  }
}

impl<D> Default for QuerySnapshot<D> {
  fn default() -> Self {
    Self::uninitialized()
  }
}
