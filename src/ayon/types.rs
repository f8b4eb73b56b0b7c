use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::cache::{merge_records, FeedRecord};

/// Addon bundle as listed by `/api/bundles`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
  pub name: String,
  #[serde(default)]
  pub is_production: bool,
  #[serde(default)]
  pub is_staging: bool,
  #[serde(default)]
  pub is_archived: bool,
  #[serde(default)]
  pub is_dev: bool,
  pub created_at: Option<DateTime<Utc>>,
  pub installer_version: Option<String>,
  /// Addon name -> version (null when the addon is disabled in this bundle)
  #[serde(default)]
  pub addons: BTreeMap<String, Option<String>>,
}

/// Project summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
  pub name: String,
  #[serde(default)]
  pub code: String,
  #[serde(default)]
  pub library: bool,
  #[serde(default = "default_true")]
  pub active: bool,
  pub created_at: Option<DateTime<Utc>>,
  pub updated_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
  true
}

/// One entry in an entity's activity feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
  pub reference_id: String,
  pub activity_id: String,
  pub activity_type: String,
  pub entity_id: String,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub body: String,
  pub author: Option<String>,
  /// Set when the activity is a reply to another one in the same feed
  pub parent_reference_id: Option<String>,
  #[serde(default)]
  pub data: Map<String, Value>,
}

impl FeedRecord for Activity {
  fn reference_id(&self) -> &str {
    &self.reference_id
  }

  fn created_at(&self) -> DateTime<Utc> {
    self.created_at
  }

  fn parent_reference_id(&self) -> Option<&str> {
    self.parent_reference_id.as_deref()
  }
}

/// Cursor information for loading older activities
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
  #[serde(default)]
  pub has_previous_page: bool,
  pub start_cursor: Option<String>,
}

/// A merged, paginated activity feed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityFeed {
  pub activities: Vec<Activity>,
  #[serde(default)]
  pub page_info: PageInfo,
}

/// Partial update of an activity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityPatch {
  /// Empty when the id is given next to the patch instead of inside it
  #[serde(default)]
  pub activity_id: String,
  pub body: Option<String>,
  #[serde(default)]
  pub data: Map<String, Value>,
}

impl ActivityFeed {
  /// Merge a newly loaded page into this feed. Cursor info comes from the
  /// newer page.
  pub fn merge(existing: ActivityFeed, incoming: ActivityFeed) -> ActivityFeed {
    ActivityFeed {
      activities: merge_records(&existing.activities, &incoming.activities),
      page_info: incoming.page_info,
    }
  }

  /// Add an activity, or replace the one with the same activity id.
  pub fn upsert(&mut self, activity: Activity) {
    match self
      .activities
      .iter_mut()
      .find(|a| a.activity_id == activity.activity_id)
    {
      Some(existing) => *existing = activity,
      None => self.activities = merge_records(&self.activities, &[activity]),
    }
  }

  /// Apply a partial update. Returns false if the activity is not in the feed.
  pub fn apply_patch(&mut self, patch: &ActivityPatch) -> bool {
    let Some(activity) = self
      .activities
      .iter_mut()
      .find(|a| a.activity_id == patch.activity_id)
    else {
      return false;
    };

    if let Some(body) = &patch.body {
      activity.body = body.clone();
    }
    activity
      .data
      .extend(patch.data.iter().map(|(k, v)| (k.clone(), v.clone())));
    true
  }

  /// Remove an activity. Returns false if it was not in the feed.
  pub fn remove(&mut self, activity_id: &str) -> bool {
    let before = self.activities.len();
    self.activities.retain(|a| a.activity_id != activity_id);
    self.activities.len() != before
  }
}

/// Folder, task or version as returned by the entity REST endpoints.
/// Only `id` is interpreted; everything else is kept as sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDetails {
  pub id: String,
  #[serde(flatten)]
  pub fields: Map<String, Value>,
}

impl EntityDetails {
  /// Overwrite the fields present in `patch`. `id` is never changed.
  pub fn apply(&mut self, patch: &Map<String, Value>) {
    for (name, value) in patch {
      if name != "id" {
        self.fields.insert(name.clone(), value.clone());
      }
    }
  }
}

/// Result payload of every query endpoint
#[derive(Debug, Clone, PartialEq)]
pub enum AyonData {
  BundleList(Vec<Bundle>),
  Activities(ActivityFeed),
  Projects(Vec<Project>),
  Project(Project),
  EntitiesDetails(Vec<EntityDetails>),
}
