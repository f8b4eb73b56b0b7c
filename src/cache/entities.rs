//! Normalized store of the last-known-good server representation per entity.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

use super::traits::{Cacheable, EntityRecord};
use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityStatus {
  /// Matches the server as of `cached_at`
  Fresh,
  /// An item tag for this entity was invalidated since it was cached
  Stale,
}

/// A single cached entity.
#[derive(Debug, Clone)]
pub struct StoredEntity {
  pub value: Value,
  pub status: EntityStatus,
  /// When the entity was written
  pub cached_at: DateTime<Utc>,
  /// Server-side modification time, if known
  pub updated_at: Option<DateTime<Utc>>,
}

/// In-memory `(entity_type, key) -> entity` map.
#[derive(Debug, Default)]
pub struct EntityStore {
  entries: HashMap<(String, String), StoredEntity>,
}

impl EntityStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Store an entity unless a strictly newer version is already cached.
  ///
  /// Returns whether the stored value changed.
  pub fn upsert(&mut self, record: EntityRecord) -> bool {
    let id = (record.entity_type.to_string(), record.key);

    if let Some(existing) = self.entries.get_mut(&id) {
      if let (Some(have), Some(incoming)) = (existing.updated_at, record.updated_at) {
        if have > incoming {
          return false;
        }
      }
      existing.value = record.value;
      existing.updated_at = record.updated_at;
      existing.status = EntityStatus::Fresh;
      existing.cached_at = Utc::now();
      return true;
    }

    self.entries.insert(
      id,
      StoredEntity {
        value: record.value,
        status: EntityStatus::Fresh,
        cached_at: Utc::now(),
        updated_at: record.updated_at,
      },
    );
    true
  }

  /// Get a typed entity by key.
  pub fn get<T: Cacheable>(&self, key: &str) -> SyncResult<Option<T>> {
    match self.get_raw(T::entity_type(), key) {
      Some(stored) => serde_json::from_value(stored.value.clone())
        .map(Some)
        .map_err(|e| SyncError::Decode(e.to_string())),
      None => Ok(None),
    }
  }

  pub fn get_raw(&self, entity_type: &str, key: &str) -> Option<&StoredEntity> {
    self
      .entries
      .get(&(entity_type.to_string(), key.to_string()))
  }

  /// Flag an entity as stale. Returns false when it is not cached.
  pub fn mark_stale(&mut self, entity_type: &str, key: &str) -> bool {
    match self
      .entries
      .get_mut(&(entity_type.to_string(), key.to_string()))
    {
      Some(stored) => {
        stored.status = EntityStatus::Stale;
        true
      }
      None => false,
    }
  }

  /// Drop entities `keep` rejects. Returns how many were dropped.
  pub fn retain<F>(&mut self, mut keep: F) -> usize
  where
    F: FnMut(&str, &str) -> bool,
  {
    let before = self.entries.len();
    self
      .entries
      .retain(|(entity_type, key), _| keep(entity_type, key));
    before - self.entries.len()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}
