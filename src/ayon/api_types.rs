//! Serde-deserializable types matching AYON API responses.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping domain types focused on application needs.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{Map, Value};

use crate::error::{SyncError, SyncResult};

use super::types::{Activity, ActivityFeed, Bundle, PageInfo, Project};

/// Decode a JSON response into a typed value, reporting the endpoint on failure.
pub fn decode<T: DeserializeOwned>(what: &str, value: Value) -> SyncResult<T> {
  serde_json::from_value(value).map_err(|e| SyncError::Decode(format!("{}: {}", what, e)))
}

/// GraphQL document used by `getActivities`.
pub const ACTIVITIES_QUERY: &str = r#"
query getActivities(
  $projectName: String!
  $entityIds: [String!]!
  $cursor: String
  $last: Int
  $activityTypes: [String!]
) {
  project(name: $projectName) {
    activities(
      entityIds: $entityIds
      activityTypes: $activityTypes
      last: $last
      before: $cursor
    ) {
      pageInfo {
        hasPreviousPage
        startCursor
      }
      edges {
        node {
          referenceId
          activityId
          activityType
          entityId
          body
          createdAt
          parentReferenceId
          activityData
          author {
            name
          }
        }
      }
    }
  }
}
"#;

// ============================================================================
// REST list envelopes
// ============================================================================

/// `GET /api/bundles`
#[derive(Debug, Deserialize)]
pub struct ApiBundleList {
  #[serde(default)]
  pub bundles: Vec<Bundle>,
}

/// `GET /api/projects`
#[derive(Debug, Deserialize)]
pub struct ApiProjectList {
  #[serde(default)]
  pub projects: Vec<Project>,
}

// ============================================================================
// GraphQL envelope
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct GraphQlResponse<T> {
  pub data: Option<T>,
  #[serde(default)]
  pub errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
pub struct GraphQlError {
  pub message: String,
}

impl<T> GraphQlResponse<T> {
  /// The `data` member, or the first reported error.
  pub fn into_data(self) -> SyncResult<T> {
    match (self.data, self.errors.into_iter().next()) {
      (_, Some(error)) => Err(SyncError::Server {
        status: 200,
        detail: error.message,
      }),
      (Some(data), None) => Ok(data),
      (None, None) => Err(SyncError::Decode("graphql response without data".into())),
    }
  }
}

// ============================================================================
// Activities
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiActivitiesData {
  pub project: ApiProjectActivities,
}

#[derive(Debug, Deserialize)]
pub struct ApiProjectActivities {
  pub activities: ApiActivityConnection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiActivityConnection {
  #[serde(default)]
  pub page_info: ApiPageInfo,
  #[serde(default)]
  pub edges: Vec<ApiActivityEdge>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiPageInfo {
  #[serde(default)]
  pub has_previous_page: bool,
  pub start_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiActivityEdge {
  pub node: ApiActivityNode,
}

#[derive(Debug, Deserialize)]
pub struct ApiAuthor {
  pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiActivityNode {
  pub reference_id: String,
  pub activity_id: String,
  pub activity_type: String,
  pub entity_id: String,
  #[serde(default)]
  pub body: Option<String>,
  pub created_at: DateTime<Utc>,
  pub parent_reference_id: Option<String>,
  /// Either an object or a JSON-encoded string, depending on server version
  #[serde(default)]
  pub activity_data: Value,
  pub author: Option<ApiAuthor>,
}

impl ApiActivityNode {
  pub fn into_activity(self) -> Activity {
    Activity {
      reference_id: self.reference_id,
      activity_id: self.activity_id,
      activity_type: self.activity_type,
      entity_id: self.entity_id,
      created_at: self.created_at,
      body: self.body.unwrap_or_default(),
      author: self.author.map(|a| a.name),
      parent_reference_id: self.parent_reference_id,
      data: activity_data(self.activity_data),
    }
  }
}

fn activity_data(value: Value) -> Map<String, Value> {
  match value {
    Value::Object(map) => map,
    Value::String(raw) => match serde_json::from_str(&raw) {
      Ok(Value::Object(map)) => map,
      _ => Map::new(),
    },
    _ => Map::new(),
  }
}

impl ApiActivitiesData {
  pub fn into_feed(self) -> ActivityFeed {
    let connection = self.project.activities;
    ActivityFeed {
      activities: connection
        .edges
        .into_iter()
        .map(|edge| edge.node.into_activity())
        .collect(),
      page_info: PageInfo {
        has_previous_page: connection.page_info.has_previous_page,
        start_cursor: connection.page_info.start_cursor,
      },
    }
  }
}
