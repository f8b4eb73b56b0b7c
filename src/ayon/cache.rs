//! Caching implementations for AYON types.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::cache::{Cacheable, EntityRecord, Payload};
use crate::error::SyncResult;

use super::types::{Activity, AyonData, Bundle, Project};

// ============================================================================
// Cacheable implementations
// ============================================================================

impl Cacheable for Bundle {
  fn cache_key(&self) -> String {
    self.name.clone()
  }

  fn updated_at(&self) -> Option<DateTime<Utc>> {
    // Bundles are immutable apart from their flags; no modification time
    None
  }

  fn entity_type() -> &'static str {
    "bundle"
  }
}

impl Cacheable for Project {
  fn cache_key(&self) -> String {
    self.name.clone()
  }

  fn updated_at(&self) -> Option<DateTime<Utc>> {
    self.updated_at
  }

  fn entity_type() -> &'static str {
    "project"
  }
}

impl Cacheable for Activity {
  fn cache_key(&self) -> String {
    self.activity_id.clone()
  }

  fn updated_at(&self) -> Option<DateTime<Utc>> {
    Some(self.created_at)
  }

  fn entity_type() -> &'static str {
    "activity"
  }
}

// ============================================================================
// Payload
// ============================================================================

impl Payload for AyonData {
  fn entities(&self) -> Vec<EntityRecord> {
    let records: Vec<SyncResult<EntityRecord>> = match self {
      AyonData::BundleList(bundles) => bundles.iter().map(EntityRecord::from_entity).collect(),
      AyonData::Activities(feed) => feed
        .activities
        .iter()
        .map(EntityRecord::from_entity)
        .collect(),
      AyonData::Projects(projects) => projects.iter().map(EntityRecord::from_entity).collect(),
      AyonData::Project(project) => vec![EntityRecord::from_entity(project)],
      // entity type varies per call; details live in their query entry only
      AyonData::EntitiesDetails(_) => Vec::new(),
    };

    records
      .into_iter()
      .filter_map(|record| match record {
        Ok(record) => Some(record),
        Err(error) => {
          warn!(%error, "entity not stored");
          None
        }
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ayon::types::ActivityFeed;
  use std::collections::BTreeMap;

  fn bundle(name: &str) -> Bundle {
    Bundle {
      name: name.to_string(),
      is_production: false,
      is_staging: false,
      is_archived: false,
      is_dev: false,
      created_at: None,
      installer_version: None,
      addons: BTreeMap::new(),
    }
  }

  #[test]
  fn test_bundle_list_entities() {
    let data = AyonData::BundleList(vec![bundle("a"), bundle("b")]);
    let entities = data.entities();

    assert_eq!(entities.len(), 2);
    assert_eq!(entities[0].entity_type, "bundle");
    assert_eq!(entities[1].key, "b");
    assert_eq!(entities[0].value["name"], "a");
  }

  #[test]
  fn test_empty_feed_has_no_entities() {
    let data = AyonData::Activities(ActivityFeed::default());
    assert!(data.entities().is_empty());
  }
}
