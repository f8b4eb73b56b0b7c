//! AYON endpoint catalogue: query and mutation definitions for the cache layer.
//!
//! Every endpoint is registered by name; arguments are JSON objects using the
//! server's camelCase field names.

use reqwest::Method;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::cache::{
  pick, CacheLayer, KeyProjection, MutationDefinition, PatchRequest, QueryDefinition, Tag,
};
use crate::error::{SyncError, SyncResult};

use super::api_types::{
  decode, ApiActivitiesData, ApiBundleList, ApiProjectList, GraphQlResponse, ACTIVITIES_QUERY,
};
use super::client::{graphql, Backend};
use super::types::{
  Activity, ActivityFeed, ActivityPatch, AyonData, Bundle, EntityDetails, Project,
};

/// Activity feed filters offered by the AYON web UI.
pub const DEFAULT_ACTIVITY_FILTERS: &[&str] = &["activity", "comments", "versions", "checklists"];

pub const GET_BUNDLE_LIST: &str = "getBundleList";
pub const GET_ACTIVITIES: &str = "getActivities";
pub const GET_ALL_PROJECTS: &str = "getAllProjects";
pub const GET_PROJECT: &str = "getProject";
pub const GET_ENTITIES_DETAILS: &str = "getEntitiesDetails";

/// Register every AYON query and mutation on `layer`.
///
/// `filters` lists the activity filters whose feeds are refreshed after an
/// activity is created, updated or deleted.
pub fn register(layer: &CacheLayer<AyonData>, backend: Arc<dyn Backend>, filters: Vec<String>) {
  let filters = Arc::new(filters);

  layer.define_query(bundle_list_query(backend.clone()));
  layer.define_query(activities_query(backend.clone()));
  layer.define_query(all_projects_query(backend.clone()));
  layer.define_query(project_query(backend.clone()));
  layer.define_query(entities_details_query(backend.clone()));

  layer.define_mutation(update_bundle(backend.clone()));
  layer.define_mutation(delete_bundle(backend.clone()));
  layer.define_mutation(create_bundle(backend.clone()));
  layer.define_mutation(promote_bundle(backend.clone()));
  layer.define_mutation(migrate_settings_by_bundle(backend.clone()));

  layer.define_mutation(create_entity_activity(backend.clone(), filters.clone()));
  layer.define_mutation(update_activity(backend.clone(), filters.clone()));
  layer.define_mutation(delete_activity(backend.clone(), filters));

  layer.define_mutation(create_project(backend.clone()));
  layer.define_mutation(delete_project(backend.clone()));
  layer.define_mutation(update_project(backend.clone()));
  layer.define_mutation(update_project_anatomy(backend.clone()));

  layer.define_mutation(update_entities_details(backend));
}

// ============================================================================
// Argument helpers
// ============================================================================

fn str_arg<'a>(args: &'a Value, name: &str) -> SyncResult<&'a str> {
  args
    .get(name)
    .and_then(Value::as_str)
    .ok_or_else(|| SyncError::Decode(format!("missing argument {}", name)))
}

/// A string argument percent-encoded for use as one URL path segment.
fn path_arg(args: &Value, name: &str) -> SyncResult<String> {
  path_segment(name, str_arg(args, name)?)
}

/// Dot segments are rejected because joining would resolve them.
fn path_segment(name: &str, value: &str) -> SyncResult<String> {
  if matches!(value, "" | "." | "..") {
    return Err(SyncError::Decode(format!("invalid {} {:?}", name, value)));
  }
  let encoded: String = url::form_urlencoded::byte_serialize(value.as_bytes()).collect();
  // form encoding turns spaces into '+', which a path keeps literally
  Ok(encoded.replace('+', "%20"))
}

fn bool_arg(args: &Value, name: &str, default: bool) -> bool {
  args.get(name).and_then(Value::as_bool).unwrap_or(default)
}

fn strings_arg(args: &Value, name: &str) -> Vec<String> {
  args
    .get(name)
    .and_then(Value::as_array)
    .map(|items| {
      items
        .iter()
        .filter_map(|item| item.as_str().map(String::from))
        .collect()
    })
    .unwrap_or_default()
}

/// Identity of an activity feed: everything except paging arguments.
/// `activityTypes` defaults to an empty list so mutations and queries agree.
pub fn feed_key(args: &Value) -> Value {
  json!({
    "projectName": args.get("projectName").cloned().unwrap_or(Value::Null),
    "entityIds": args.get("entityIds").cloned().unwrap_or_else(|| json!([])),
    "activityTypes": args.get("activityTypes").cloned().unwrap_or_else(|| json!([])),
    "filter": args.get("filter").cloned().unwrap_or(Value::Null),
  })
}

fn unexpected(endpoint: &str, data: &AyonData) -> SyncError {
  SyncError::Decode(format!("{} holds unexpected payload {:?}", endpoint, data))
}

fn type_wide(kinds: &[&str]) -> Vec<Tag> {
  kinds.iter().map(|kind| Tag::of_kind(*kind)).collect()
}

// ============================================================================
// Queries
// ============================================================================

fn bundle_list_query(backend: Arc<dyn Backend>) -> QueryDefinition<AyonData> {
  QueryDefinition::new(GET_BUNDLE_LIST, move |args: Value| {
    let backend = backend.clone();
    async move {
      let archived = bool_arg(&args, "archived", false);
      let path = format!("/api/bundles?archived={}", archived);
      let response = backend.request(Method::GET, path, None).await?;
      let list: ApiBundleList = decode(GET_BUNDLE_LIST, response)?;
      Ok(AyonData::BundleList(list.bundles))
    }
  })
  .key_projection(Arc::new(|args: &Value| {
    json!({ "archived": bool_arg(args, "archived", false) })
  }))
  .provides_tags(|data, _args| {
    let mut tags = vec![Tag::list("bundleList")];
    if let AyonData::BundleList(bundles) = data {
      tags.extend(bundles.iter().map(|b| Tag::item("bundle", b.name.clone())));
    }
    tags
  })
}

fn activities_query(backend: Arc<dyn Backend>) -> QueryDefinition<AyonData> {
  let projection: KeyProjection = Arc::new(feed_key);

  QueryDefinition::new(GET_ACTIVITIES, move |args: Value| {
    let backend = backend.clone();
    async move {
      let variables = json!({
        "projectName": str_arg(&args, "projectName")?,
        "entityIds": strings_arg(&args, "entityIds"),
        "activityTypes": strings_arg(&args, "activityTypes"),
        "cursor": args.get("cursor").cloned().unwrap_or(Value::Null),
        "last": args.get("last").cloned().unwrap_or(Value::Null),
      });
      let response = graphql(backend.as_ref(), ACTIVITIES_QUERY, variables).await?;
      let response: GraphQlResponse<ApiActivitiesData> = decode(GET_ACTIVITIES, response)?;
      Ok(AyonData::Activities(response.into_data()?.into_feed()))
    }
  })
  .key_projection(projection)
  .merge(|existing, incoming| match (existing, incoming) {
    (AyonData::Activities(existing), AyonData::Activities(incoming)) => {
      AyonData::Activities(ActivityFeed::merge(existing, incoming))
    }
    (_, incoming) => incoming,
  })
  // a new cursor means a new page: fetch it even though the entry exists
  .force_refetch(|current, previous| current != previous)
  .provides_tags(activity_tags)
}

fn activity_tags(data: &AyonData, args: &Value) -> Vec<Tag> {
  let entity_ids = strings_arg(args, "entityIds");
  let activity_types = strings_arg(args, "activityTypes");
  let filter = args.get("filter").and_then(Value::as_str).unwrap_or_default();

  let mut tags = Vec::new();
  if let AyonData::Activities(feed) = data {
    tags.extend(
      feed
        .activities
        .iter()
        .map(|a| Tag::item("activity", a.activity_id.clone())),
    );
  }
  tags.push(Tag::list("activity"));
  tags.extend(entity_ids.iter().map(|id| Tag::item("entityActivities", id.clone())));
  tags.push(Tag::list("entityActivities"));
  tags.extend(activity_types.into_iter().map(|t| Tag::item("entityActivities", t)));
  // lets a comment on one filter refresh the feeds of the others
  tags.extend(
    entity_ids
      .iter()
      .map(|id| Tag::item("entityActivities", format!("{}-{}", id, filter))),
  );
  tags
}

fn all_projects_query(backend: Arc<dyn Backend>) -> QueryDefinition<AyonData> {
  QueryDefinition::new(GET_ALL_PROJECTS, move |_args: Value| {
    let backend = backend.clone();
    async move {
      let response = backend
        .request(Method::GET, "/api/projects".to_string(), None)
        .await?;
      let list: ApiProjectList = decode(GET_ALL_PROJECTS, response)?;
      Ok(AyonData::Projects(list.projects))
    }
  })
  // takes no arguments
  .key_projection(Arc::new(|_: &Value| json!({})))
  .provides_tags(|data, _args| {
    let mut tags = Vec::new();
    if let AyonData::Projects(projects) = data {
      tags.extend(projects.iter().map(|p| Tag::item("project", p.name.clone())));
    }
    tags.push(Tag::list("projects"));
    tags
  })
}

fn project_query(backend: Arc<dyn Backend>) -> QueryDefinition<AyonData> {
  QueryDefinition::new(GET_PROJECT, move |args: Value| {
    let backend = backend.clone();
    async move {
      let name = path_arg(&args, "projectName")?;
      let response = backend
        .request(Method::GET, format!("/api/projects/{}", name), None)
        .await?;
      Ok(AyonData::Project(decode(GET_PROJECT, response)?))
    }
  })
  .key_projection(pick(&["projectName"]))
  .provides_tags(|data, args| match data {
    AyonData::Project(project) => vec![Tag::item("project", project.name.clone())],
    _ => args
      .get("projectName")
      .and_then(Value::as_str)
      .map(|name| vec![Tag::item("project", name)])
      .unwrap_or_default(),
  })
}

/// Details of several entities of one type, e.g. the tasks open in a panel.
fn entities_details_query(backend: Arc<dyn Backend>) -> QueryDefinition<AyonData> {
  QueryDefinition::new(GET_ENTITIES_DETAILS, move |args: Value| {
    let backend = backend.clone();
    async move {
      let project = path_arg(&args, "projectName")?;
      let kind = path_arg(&args, "type")?;
      let mut entities = Vec::new();
      for id in strings_arg(&args, "ids") {
        let id = path_segment("id", &id)?;
        let path = format!("/api/projects/{}/{}s/{}", project, kind, id);
        let response = backend.request(Method::GET, path, None).await?;
        let entity: EntityDetails = decode(GET_ENTITIES_DETAILS, response)?;
        entities.push(entity);
      }
      Ok(AyonData::EntitiesDetails(entities))
    }
  })
  .key_projection(pick(&["projectName", "type", "ids"]))
  .provides_tags(|_data, args| {
    let kind = args.get("type").and_then(Value::as_str).unwrap_or_default();
    strings_arg(args, "ids")
      .into_iter()
      .map(|id| Tag::item(kind, id))
      .collect()
  })
}

// ============================================================================
// Bundles
// ============================================================================

fn update_bundle(backend: Arc<dyn Backend>) -> MutationDefinition<AyonData> {
  MutationDefinition::new("updateBundle", move |args: Value| {
    let backend = backend.clone();
    async move {
      let name = path_arg(&args, "name")?;
      let force = bool_arg(&args, "force", true);
      let body = args.get("data").cloned().unwrap_or_else(|| json!({}));
      let path = format!("/api/bundles/{}?force={}", name, force);
      backend.request(Method::PATCH, path, Some(body)).await
    }
  })
  .optimistic(|args| {
    let archived = bool_arg(args, "archived", true);
    let name = args
      .get("name")
      .and_then(Value::as_str)
      .unwrap_or_default()
      .to_string();
    let patch = args.get("patch").cloned().filter(|p| !p.is_null());

    vec![PatchRequest::new(
      GET_BUNDLE_LIST,
      json!({ "archived": archived }),
      move |data: &mut AyonData| {
        let Some(patch) = patch else {
          return Ok(());
        };
        let AyonData::BundleList(bundles) = data else {
          return Err(unexpected(GET_BUNDLE_LIST, data));
        };
        let replacement: Bundle = decode("updateBundle patch", patch)?;
        let bundle = bundles
          .iter_mut()
          .find(|b| b.name == name)
          .ok_or_else(|| SyncError::Conflict("bundle not found".into()))?;
        *bundle = replacement;
        Ok(())
      },
    )]
  })
  .invalidates_tags(|_args, _response| {
    type_wide(&["bundleList", "addonList", "addonSettingsList", "marketAddon"])
  })
}

fn delete_bundle(backend: Arc<dyn Backend>) -> MutationDefinition<AyonData> {
  MutationDefinition::new("deleteBundle", move |args: Value| {
    let backend = backend.clone();
    async move {
      let name = path_arg(&args, "name")?;
      let path = format!("/api/bundles/{}", name);
      backend.request(Method::DELETE, path, None).await
    }
  })
  .optimistic(|args| {
    let archived = bool_arg(args, "archived", true);
    let name = args
      .get("name")
      .and_then(Value::as_str)
      .unwrap_or_default()
      .to_string();

    vec![PatchRequest::new(
      GET_BUNDLE_LIST,
      json!({ "archived": archived }),
      move |data: &mut AyonData| {
        if let AyonData::BundleList(bundles) = data {
          bundles.retain(|b| b.name != name);
        }
        Ok(())
      },
    )]
  })
  .invalidates_tags(|_args, _response| {
    type_wide(&["bundleList", "addonList", "addonSettingsList"])
  })
}

fn create_bundle(backend: Arc<dyn Backend>) -> MutationDefinition<AyonData> {
  MutationDefinition::new("createBundle", move |args: Value| {
    let backend = backend.clone();
    async move {
      // the serializer is not Send; it must be gone before the await
      let params = {
        let mut params = url::form_urlencoded::Serializer::new(String::new());
        if bool_arg(&args, "force", false) {
          params.append_pair("force", "true");
        }
        for name in ["settingsFromBundle", "settingsFromVariant"] {
          if let Some(value) = args.get(name).and_then(Value::as_str) {
            params.append_pair(name, value);
          }
        }
        params.finish()
      };
      let path = if params.is_empty() {
        "/api/bundles".to_string()
      } else {
        format!("/api/bundles?{}", params)
      };

      let body = args.get("data").cloned().unwrap_or_else(|| json!({}));
      backend.request(Method::POST, path, Some(body)).await
    }
  })
  // no optimistic insert: the bundle list shows up once the server has it
  .invalidates_tags(|_args, _response| {
    type_wide(&[
      "bundleList",
      "addonList",
      "addonSettingsList",
      "addonSettings",
      "addonSettingsOverrides",
    ])
  })
}

fn promote_bundle(backend: Arc<dyn Backend>) -> MutationDefinition<AyonData> {
  MutationDefinition::new("promoteBundle", move |args: Value| {
    let backend = backend.clone();
    async move {
      let name = path_arg(&args, "name")?;
      let force = bool_arg(&args, "force", true);
      let path = format!("/api/bundles/{}?force={}", name, force);
      let body = json!({ "action": "promote" });
      backend.request(Method::POST, path, Some(body)).await
    }
  })
  .invalidates_tags(|_args, _response| {
    type_wide(&[
      "bundleList",
      "addonList",
      "addonSettingsList",
      "addonSettings",
      "addonSettingsOverrides",
      "marketAddon",
    ])
  })
}

fn migrate_settings_by_bundle(backend: Arc<dyn Backend>) -> MutationDefinition<AyonData> {
  MutationDefinition::new("migrateSettingsByBundle", move |args: Value| {
    let backend = backend.clone();
    async move {
      let body = json!({
        "sourceBundle": str_arg(&args, "sourceBundle")?,
        "sourceVariant": str_arg(&args, "sourceVariant")?,
        "targetBundle": str_arg(&args, "targetBundle")?,
        "targetVariant": str_arg(&args, "targetVariant")?,
      });
      let path = "/api/migrateSettingsByBundle".to_string();
      backend.request(Method::POST, path, Some(body)).await
    }
  })
  .invalidates_tags(|_args, _response| {
    type_wide(&["addonSettings", "addonSettingsOverrides", "addonSettingsList"])
  })
}

// ============================================================================
// Activities
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeedChange {
  Create,
  Update,
  Delete,
}

/// Optimistic patch of the feed the mutation was issued from.
fn patch_feed(args: &Value, change: FeedChange) -> Vec<PatchRequest<AyonData>> {
  let patch = args.get("patch").cloned().filter(|p| !p.is_null());
  if patch.is_none() && change != FeedChange::Delete {
    return Vec::new();
  }
  let patch = patch.unwrap_or_else(|| json!({}));
  let activity_id = args
    .get("activityId")
    .or_else(|| patch.get("activityId"))
    .and_then(Value::as_str)
    .unwrap_or_default()
    .to_string();

  vec![PatchRequest::new(
    GET_ACTIVITIES,
    feed_key(args),
    move |data: &mut AyonData| {
      let AyonData::Activities(feed) = data else {
        return Err(unexpected(GET_ACTIVITIES, data));
      };
      match change {
        FeedChange::Create => {
          let activity: Activity = decode("activity patch", patch)?;
          feed.upsert(activity);
        }
        FeedChange::Update => {
          let mut update: ActivityPatch = decode("activity patch", patch)?;
          if update.activity_id.is_empty() {
            update.activity_id = activity_id;
          }
          feed.apply_patch(&update);
        }
        FeedChange::Delete => {
          feed.remove(&activity_id);
        }
      }
      Ok(())
    },
  )]
}

/// Feeds of the other filters on the same entity may now be out of date.
fn other_filter_tags(args: &Value, filters: &[String]) -> Vec<Tag> {
  let entity_id = args.get("entityId").and_then(Value::as_str).unwrap_or_default();
  let current = args.get("filter").and_then(Value::as_str).unwrap_or_default();

  filters
    .iter()
    .filter(|filter| filter.as_str() != current)
    .map(|filter| Tag::item("entityActivities", format!("{}-{}", entity_id, filter)))
    .collect()
}

fn create_entity_activity(
  backend: Arc<dyn Backend>,
  filters: Arc<Vec<String>>,
) -> MutationDefinition<AyonData> {
  MutationDefinition::new("createEntityActivity", move |args: Value| {
    let backend = backend.clone();
    async move {
      let path = format!(
        "/api/projects/{}/{}/{}/activities",
        path_arg(&args, "projectName")?,
        path_arg(&args, "entityType")?,
        path_arg(&args, "entityId")?,
      );
      let body = args.get("data").cloned().unwrap_or_else(|| json!({}));
      backend.request(Method::POST, path, Some(body)).await
    }
  })
  .optimistic(|args| patch_feed(args, FeedChange::Create))
  .invalidates_tags(move |args, _response| other_filter_tags(args, &filters))
}

fn update_activity(
  backend: Arc<dyn Backend>,
  filters: Arc<Vec<String>>,
) -> MutationDefinition<AyonData> {
  MutationDefinition::new("updateActivity", move |args: Value| {
    let backend = backend.clone();
    async move {
      let path = format!(
        "/api/projects/{}/activities/{}",
        path_arg(&args, "projectName")?,
        path_arg(&args, "activityId")?,
      );
      let body = args.get("data").cloned().unwrap_or_else(|| json!({}));
      backend.request(Method::PATCH, path, Some(body)).await
    }
  })
  .optimistic(|args| patch_feed(args, FeedChange::Update))
  .invalidates_tags(move |args, _response| other_filter_tags(args, &filters))
}

fn delete_activity(
  backend: Arc<dyn Backend>,
  filters: Arc<Vec<String>>,
) -> MutationDefinition<AyonData> {
  MutationDefinition::new("deleteActivity", move |args: Value| {
    let backend = backend.clone();
    async move {
      let path = format!(
        "/api/projects/{}/activities/{}",
        path_arg(&args, "projectName")?,
        path_arg(&args, "activityId")?,
      );
      backend.request(Method::DELETE, path, None).await
    }
  })
  .optimistic(|args| patch_feed(args, FeedChange::Delete))
  .invalidates_tags(move |args, _response| other_filter_tags(args, &filters))
}

// ============================================================================
// Projects
// ============================================================================

fn create_project(backend: Arc<dyn Backend>) -> MutationDefinition<AyonData> {
  MutationDefinition::new("createProject", move |args: Value| {
    let backend = backend.clone();
    async move {
      let body = json!({
        "name": str_arg(&args, "name")?,
        "code": str_arg(&args, "code")?,
        "anatomy": args.get("anatomy").cloned().unwrap_or(Value::Null),
        "library": bool_arg(&args, "library", false),
      });
      backend
        .request(Method::POST, "/api/projects".to_string(), Some(body))
        .await
    }
  })
  .optimistic(|args| {
    let project = Project {
      name: args
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string(),
      code: args
        .get("code")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string(),
      library: bool_arg(args, "library", false),
      active: true,
      created_at: None,
      updated_at: None,
    };

    vec![PatchRequest::new(
      GET_ALL_PROJECTS,
      json!({}),
      move |data: &mut AyonData| {
        let AyonData::Projects(projects) = data else {
          return Err(unexpected(GET_ALL_PROJECTS, data));
        };
        projects.push(project);
        Ok(())
      },
    )]
  })
  .invalidates_tags(|_args, _response| type_wide(&["projects", "kanBanTask"]))
}

fn delete_project(backend: Arc<dyn Backend>) -> MutationDefinition<AyonData> {
  MutationDefinition::new("deleteProject", move |args: Value| {
    let backend = backend.clone();
    async move {
      let path = format!("/api/projects/{}", path_arg(&args, "projectName")?);
      backend.request(Method::DELETE, path, None).await
    }
  })
  .invalidates_tags(|_args, _response| type_wide(&["projects"]))
}

fn update_project(backend: Arc<dyn Backend>) -> MutationDefinition<AyonData> {
  MutationDefinition::new("updateProject", move |args: Value| {
    let backend = backend.clone();
    async move {
      let path = format!("/api/projects/{}", path_arg(&args, "projectName")?);
      let body = args.get("update").cloned().unwrap_or_else(|| json!({}));
      backend.request(Method::PATCH, path, Some(body)).await
    }
  })
  .invalidates_tags(|args, _response| {
    let activated = args
      .get("update")
      .and_then(Value::as_object)
      .is_some_and(|update| update.contains_key("active"));
    if activated {
      // active flags show up in every project listing
      vec![Tag::of_kind("project")]
    } else {
      let name = args.get("projectName").and_then(Value::as_str).unwrap_or_default();
      vec![Tag::item("project", name)]
    }
  })
}

fn update_project_anatomy(backend: Arc<dyn Backend>) -> MutationDefinition<AyonData> {
  MutationDefinition::new("updateProjectAnatomy", move |args: Value| {
    let backend = backend.clone();
    async move {
      let path = format!("/api/projects/{}/anatomy", path_arg(&args, "projectName")?);
      let body = args.get("anatomy").cloned().unwrap_or_else(|| json!({}));
      backend.request(Method::POST, path, Some(body)).await
    }
  })
  .invalidates_tags(|args, _response| {
    let name = args.get("projectName").and_then(Value::as_str).unwrap_or_default();
    vec![Tag::item("project", name)]
  })
}

// ============================================================================
// Entities
// ============================================================================

/// Ids an entity update applies to: `ids`, or the ids of the patches.
fn updated_ids(args: &Value) -> Vec<String> {
  let ids = strings_arg(args, "ids");
  if !ids.is_empty() {
    return ids;
  }
  args
    .get("patches")
    .and_then(Value::as_array)
    .map(|patches| {
      patches
        .iter()
        .filter_map(|p| p.get("id").and_then(Value::as_str).map(String::from))
        .collect()
    })
    .unwrap_or_default()
}

/// The operations endpoint answers 200 even when an operation failed.
fn operations_failure(response: &Value) -> Option<SyncError> {
  if response.get("success").and_then(Value::as_bool) != Some(false) {
    return None;
  }
  let detail = response
    .get("operations")
    .and_then(Value::as_array)
    .and_then(|ops| {
      ops
        .iter()
        .find_map(|op| op.get("detail").and_then(Value::as_str))
    })
    .unwrap_or("Failed to update entities");
  Some(SyncError::Server {
    status: 200,
    detail: detail.to_string(),
  })
}

fn update_entities_details(backend: Arc<dyn Backend>) -> MutationDefinition<AyonData> {
  MutationDefinition::new("updateEntitiesDetails", move |args: Value| {
    let backend = backend.clone();
    async move {
      let path = format!("/api/projects/{}/operations", path_arg(&args, "projectName")?);
      let kind = str_arg(&args, "type")?;
      let data = args.get("data").cloned().unwrap_or_else(|| json!({}));
      let operations: Vec<Value> = updated_ids(&args)
        .into_iter()
        .map(|id| {
          json!({
            "type": "update",
            "entityType": kind,
            "entityId": id,
            "data": data,
          })
        })
        .collect();

      let body = json!({ "operations": operations });
      let response = backend.request(Method::POST, path, Some(body)).await?;
      match operations_failure(&response) {
        Some(error) => Err(error),
        None => Ok(response),
      }
    }
  })
  .optimistic(|args| {
    let Some(patches) = args.get("patches").and_then(Value::as_array).cloned() else {
      return Vec::new();
    };
    let target = json!({
      "projectName": args.get("projectName").cloned().unwrap_or(Value::Null),
      "type": args.get("type").cloned().unwrap_or(Value::Null),
      "ids": updated_ids(args),
    });

    vec![PatchRequest::new(
      GET_ENTITIES_DETAILS,
      target,
      move |data: &mut AyonData| {
        let AyonData::EntitiesDetails(entities) = data else {
          return Err(unexpected(GET_ENTITIES_DETAILS, data));
        };
        for patch in patches.iter().filter_map(Value::as_object) {
          let id = patch.get("id").and_then(Value::as_str).unwrap_or_default();
          if let Some(entity) = entities.iter_mut().find(|e| e.id == id) {
            entity.apply(patch);
          }
        }
        Ok(())
      },
    )]
  })
  .invalidates_tags(|args, _response| {
    if bool_arg(args, "disabledInvalidation", false) {
      return Vec::new();
    }
    let kind = args.get("type").and_then(Value::as_str).unwrap_or_default();
    let ids = updated_ids(args);

    let mut tags: Vec<Tag> = ids.iter().map(|id| Tag::item(kind, id.clone())).collect();
    tags.push(Tag::item("kanBanTask", "TASKS"));
    // a status change shows up as an activity
    let status_changed = args
      .get("data")
      .and_then(Value::as_object)
      .is_some_and(|data| data.contains_key("status"));
    if status_changed {
      tags.extend(ids.into_iter().map(|id| Tag::item("entityActivities", id)));
    }
    tags
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{BoxFuture, EntityStatus, QueryStatus};
  use std::collections::HashMap;
  use std::sync::Mutex;
  use std::time::Duration;
  use tokio::sync::Notify;

  /// In-memory AYON server. Routes are matched on `METHOD path`.
  #[derive(Default)]
  struct FakeBackend {
    routes: Mutex<HashMap<String, SyncResult<Value>>>,
    calls: Mutex<Vec<(String, Option<Value>)>>,
    /// When set, mutating requests wait for a notification before answering
    hold: Option<Arc<Notify>>,
  }

  impl FakeBackend {
    fn route(&self, key: &str, response: SyncResult<Value>) {
      self.routes.lock().unwrap().insert(key.to_string(), response);
    }

    fn calls_to(&self, key: &str) -> usize {
      self
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter(|(k, _)| k == key)
        .count()
    }

    fn body_of(&self, key: &str) -> Option<Value> {
      self
        .calls
        .lock()
        .unwrap()
        .iter()
        .rev()
        .find(|(k, _)| k == key)
        .and_then(|(_, body)| body.clone())
    }
  }

  impl Backend for Arc<FakeBackend> {
    fn request(&self, method: Method, path: String, body: Option<Value>) -> BoxFuture<Value> {
      let key = format!("{} {}", method, path);
      let fake = self.clone();
      Box::pin(async move {
        fake.calls.lock().unwrap().push((key.clone(), body));
        if method != Method::GET {
          if let Some(hold) = &fake.hold {
            hold.notified().await;
          }
        }
        fake
          .routes
          .lock()
          .unwrap()
          .get(&key)
          .cloned()
          .unwrap_or_else(|| Err(SyncError::server(404, None)))
      })
    }
  }

  fn setup(fake: FakeBackend) -> (CacheLayer<AyonData>, Arc<FakeBackend>) {
    let fake = Arc::new(fake);
    let layer = CacheLayer::new();
    let filters = DEFAULT_ACTIVITY_FILTERS.iter().map(|f| f.to_string()).collect();
    register(&layer, Arc::new(fake.clone()), filters);
    (layer, fake)
  }

  fn bundle_json(name: &str, production: bool) -> Value {
    json!({ "name": name, "isProduction": production, "addons": {} })
  }

  fn bundle_names(data: &AyonData) -> Vec<String> {
    match data {
      AyonData::BundleList(bundles) => bundles.iter().map(|b| b.name.clone()).collect(),
      other => panic!("unexpected payload {:?}", other),
    }
  }

  fn activity_node(id: &str, minute: u32, body: &str) -> Value {
    json!({ "node": {
      "referenceId": format!("ref-{}", id),
      "activityId": id,
      "activityType": "comment",
      "entityId": "task1",
      "body": body,
      "createdAt": format!("2024-03-01T09:{:02}:00Z", minute),
    } })
  }

  fn activities_response(edges: Vec<Value>, cursor: &str, more: bool) -> Value {
    json!({ "data": { "project": { "activities": {
      "pageInfo": { "hasPreviousPage": more, "startCursor": cursor },
      "edges": edges,
    } } } })
  }

  fn feed_args(filter: &str) -> Value {
    json!({
      "projectName": "demo",
      "entityIds": ["task1"],
      "activityTypes": ["comment"],
      "filter": filter,
    })
  }

  #[tokio::test]
  async fn test_bundle_list_tags() {
    let (layer, fake) = setup(FakeBackend::default());
    fake.route(
      "GET /api/bundles?archived=true",
      Ok(json!({ "bundles": [bundle_json("b1", true), bundle_json("b2", false)] })),
    );

    let data = layer
      .query(GET_BUNDLE_LIST, json!({ "archived": true }))
      .await
      .unwrap();
    assert_eq!(bundle_names(&data), vec!["b1", "b2"]);

    assert_eq!(layer.signatures_for(&Tag::list("bundleList")).len(), 1);
    assert_eq!(layer.signatures_for(&Tag::item("bundle", "b2")).len(), 1);
    let bundle: Option<Bundle> = layer.entity("b1").unwrap();
    assert!(bundle.unwrap().is_production);
  }

  #[tokio::test]
  async fn test_update_bundle_patches_then_refetches() {
    let hold = Arc::new(Notify::new());
    let (layer, fake) = setup(FakeBackend {
      hold: Some(hold.clone()),
      ..FakeBackend::default()
    });
    fake.route(
      "GET /api/bundles?archived=true",
      Ok(json!({ "bundles": [bundle_json("b1", false)] })),
    );
    fake.route("PATCH /api/bundles/b1?force=true", Ok(Value::Null));

    let mut sub = layer
      .subscribe(GET_BUNDLE_LIST, json!({ "archived": true }))
      .unwrap();
    sub.settled().await;

    let mutation = {
      let layer = layer.clone();
      tokio::spawn(async move {
        layer
          .execute_mutation(
            "updateBundle",
            json!({
              "name": "b1",
              "data": { "isProduction": true },
              "patch": bundle_json("b1", true),
            }),
          )
          .await
      })
    };
    tokio::task::yield_now().await;

    // patched before the server answered
    match sub.data() {
      Some(AyonData::BundleList(bundles)) => assert!(bundles[0].is_production),
      other => panic!("unexpected {:?}", other),
    }

    fake.route(
      "GET /api/bundles?archived=true",
      Ok(json!({ "bundles": [bundle_json("b1", true)] })),
    );
    hold.notify_one();
    mutation.await.unwrap().unwrap();

    assert_eq!(
      fake.body_of("PATCH /api/bundles/b1?force=true"),
      Some(json!({ "isProduction": true }))
    );
    sub.settled().await;
    assert_eq!(fake.calls_to("GET /api/bundles?archived=true"), 2);
  }

  #[tokio::test]
  async fn test_update_bundle_failure_rolls_back() {
    let (layer, fake) = setup(FakeBackend::default());
    fake.route(
      "GET /api/bundles?archived=true",
      Ok(json!({ "bundles": [bundle_json("b1", false)] })),
    );
    fake.route(
      "PATCH /api/bundles/b1?force=true",
      Err(SyncError::server(409, Some(&json!({ "detail": "Bundle is locked" })))),
    );
    layer
      .query(GET_BUNDLE_LIST, json!({ "archived": true }))
      .await
      .unwrap();

    let err = layer
      .execute_mutation(
        "updateBundle",
        json!({ "name": "b1", "data": {}, "patch": bundle_json("b1", true) }),
      )
      .await
      .unwrap_err();
    assert_eq!(
      err,
      SyncError::Server {
        status: 409,
        detail: "Bundle is locked".into()
      }
    );

    let snapshot = layer
      .snapshot(GET_BUNDLE_LIST, &json!({ "archived": true }))
      .unwrap();
    match snapshot.data {
      Some(AyonData::BundleList(bundles)) => assert!(!bundles[0].is_production),
      other => panic!("unexpected {:?}", other),
    }
    assert_eq!(fake.calls_to("GET /api/bundles?archived=true"), 1);
  }

  #[tokio::test]
  async fn test_update_unknown_bundle_conflicts() {
    let (layer, fake) = setup(FakeBackend::default());
    fake.route(
      "GET /api/bundles?archived=true",
      Ok(json!({ "bundles": [bundle_json("b1", false)] })),
    );
    layer
      .query(GET_BUNDLE_LIST, json!({ "archived": true }))
      .await
      .unwrap();

    let err = layer
      .execute_mutation(
        "updateBundle",
        json!({ "name": "ghost", "patch": bundle_json("ghost", true) }),
      )
      .await
      .unwrap_err();

    assert_eq!(err, SyncError::Conflict("bundle not found".into()));
    assert_eq!(fake.calls_to("PATCH /api/bundles/ghost?force=true"), 0);
  }

  #[tokio::test]
  async fn test_delete_bundle_removes_optimistically() {
    let (layer, fake) = setup(FakeBackend::default());
    fake.route(
      "GET /api/bundles?archived=true",
      Ok(json!({ "bundles": [bundle_json("b1", false), bundle_json("b2", false)] })),
    );
    layer
      .query(GET_BUNDLE_LIST, json!({ "archived": true }))
      .await
      .unwrap();
    fake.route("DELETE /api/bundles/b1", Err(SyncError::Network("offline".into())));

    let err = layer
      .execute_mutation("deleteBundle", json!({ "name": "b1" }))
      .await
      .unwrap_err();
    assert!(err.is_network());

    let snapshot = layer
      .snapshot(GET_BUNDLE_LIST, &json!({ "archived": true }))
      .unwrap();
    assert_eq!(bundle_names(&snapshot.data.unwrap()), vec!["b1", "b2"]);
  }

  #[tokio::test]
  async fn test_create_bundle_builds_query_string() {
    let (layer, fake) = setup(FakeBackend::default());
    fake.route(
      "POST /api/bundles?force=true&settingsFromBundle=prod+2%2Fa",
      Ok(Value::Null),
    );
    fake.route("POST /api/bundles", Ok(Value::Null));

    layer
      .execute_mutation(
        "createBundle",
        json!({ "data": { "name": "b3" }, "force": true, "settingsFromBundle": "prod 2/a" }),
      )
      .await
      .unwrap();
    layer
      .execute_mutation("createBundle", json!({ "data": { "name": "b4" } }))
      .await
      .unwrap();

    assert_eq!(fake.body_of("POST /api/bundles"), Some(json!({ "name": "b4" })));
  }

  #[tokio::test]
  async fn test_activity_pages_merge() {
    let (layer, fake) = setup(FakeBackend::default());
    // graphql requests all share one route; answer with the newest page first
    fake.route(
      "POST /graphql",
      Ok(activities_response(
        vec![activity_node("a2", 2, "two"), activity_node("a3", 3, "three")],
        "c2",
        true,
      )),
    );

    let mut first = layer.subscribe(GET_ACTIVITIES, feed_args("comments")).unwrap();
    first.settled().await;

    fake.route(
      "POST /graphql",
      Ok(activities_response(
        vec![activity_node("a1", 1, "one"), activity_node("a2", 2, "two")],
        "c1",
        false,
      )),
    );
    let mut older_args = feed_args("comments");
    older_args["cursor"] = json!("c2");
    let mut older = layer.subscribe(GET_ACTIVITIES, older_args).unwrap();
    let snapshot = older.settled().await;

    assert_eq!(first.signature(), older.signature());
    match snapshot.data {
      Some(AyonData::Activities(feed)) => {
        let ids: Vec<&str> = feed.activities.iter().map(|a| a.activity_id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "a2", "a3"]);
        assert!(!feed.page_info.has_previous_page);
      }
      other => panic!("unexpected {:?}", other),
    }

    let variables = fake.body_of("POST /graphql").unwrap()["variables"].clone();
    assert_eq!(variables["cursor"], "c2");
    assert_eq!(variables["projectName"], "demo");
  }

  #[tokio::test]
  async fn test_comment_refreshes_other_filters() {
    let (layer, fake) = setup(FakeBackend::default());
    fake.route(
      "POST /graphql",
      Ok(activities_response(vec![activity_node("a1", 1, "one")], "c1", false)),
    );
    fake.route("POST /api/projects/demo/task/task1/activities", Ok(json!({ "id": "a9" })));

    let mut comments = layer.subscribe(GET_ACTIVITIES, feed_args("comments")).unwrap();
    let mut everything = layer.subscribe(GET_ACTIVITIES, feed_args("activity")).unwrap();
    comments.settled().await;
    everything.settled().await;
    let before = fake.calls_to("POST /graphql");

    let mut args = feed_args("comments");
    args["entityType"] = json!("task");
    args["entityId"] = json!("task1");
    args["data"] = json!({ "body": "new" });
    args["patch"] = activity_node("a9", 9, "new")["node"].clone();
    layer
      .execute_mutation("createEntityActivity", args)
      .await
      .unwrap();

    // the commented feed is patched, the other one refetched
    match comments.data() {
      Some(AyonData::Activities(feed)) => {
        assert_eq!(feed.activities.len(), 2);
        assert_eq!(feed.activities[1].body, "new");
      }
      other => panic!("unexpected {:?}", other),
    }
    everything.settled().await;
    assert_eq!(fake.calls_to("POST /graphql"), before + 1);
    assert_eq!(comments.status(), QueryStatus::Success);
  }

  #[tokio::test]
  async fn test_update_and_delete_activity() {
    let (layer, fake) = setup(FakeBackend::default());
    fake.route(
      "POST /graphql",
      Ok(activities_response(
        vec![activity_node("a1", 1, "one"), activity_node("a2", 2, "two")],
        "c1",
        false,
      )),
    );
    fake.route("PATCH /api/projects/demo/activities/a1", Ok(Value::Null));
    fake.route(
      "DELETE /api/projects/demo/activities/a2",
      Err(SyncError::server(403, None)),
    );
    layer.query(GET_ACTIVITIES, feed_args("comments")).await.unwrap();

    let mut update = feed_args("comments");
    update["activityId"] = json!("a1");
    update["data"] = json!({ "body": "edited" });
    update["patch"] = json!({ "body": "edited" });
    layer.execute_mutation("updateActivity", update).await.unwrap();

    let mut delete = feed_args("comments");
    delete["activityId"] = json!("a2");
    let err = layer
      .execute_mutation("deleteActivity", delete)
      .await
      .unwrap_err();
    assert_eq!(err.to_string(), "Server error 403: Error 403");

    let snapshot = layer
      .snapshot(GET_ACTIVITIES, &feed_args("comments"))
      .unwrap();
    match snapshot.data {
      Some(AyonData::Activities(feed)) => {
        assert_eq!(feed.activities.len(), 2);
        assert_eq!(feed.activities[0].body, "edited");
      }
      other => panic!("unexpected {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_create_project_appends_and_invalidates() {
    let hold = Arc::new(Notify::new());
    let (layer, fake) = setup(FakeBackend {
      hold: Some(hold.clone()),
      ..FakeBackend::default()
    });
    fake.route(
      "GET /api/projects",
      Ok(json!({ "projects": [{ "name": "demo", "code": "dm" }] })),
    );
    fake.route("POST /api/projects", Ok(Value::Null));

    let mut projects = layer.subscribe(GET_ALL_PROJECTS, Value::Null).unwrap();
    projects.settled().await;

    let mutation = {
      let layer = layer.clone();
      tokio::spawn(async move {
        layer
          .execute_mutation(
            "createProject",
            json!({ "name": "next", "code": "nx", "library": false }),
          )
          .await
      })
    };
    tokio::task::yield_now().await;
    match projects.data() {
      Some(AyonData::Projects(list)) => assert_eq!(list.len(), 2),
      other => panic!("unexpected {:?}", other),
    }

    hold.notify_one();
    mutation.await.unwrap().unwrap();
    projects.settled().await;
    assert_eq!(fake.calls_to("GET /api/projects"), 2);
  }

  #[tokio::test]
  async fn test_update_project_tag_scope() {
    let (layer, fake) = setup(FakeBackend::default());
    for name in ["p1", "p2"] {
      fake.route(
        &format!("GET /api/projects/{}", name),
        Ok(json!({ "name": name, "code": name })),
      );
    }
    fake.route("PATCH /api/projects/p1", Ok(Value::Null));

    let mut p1 = layer.subscribe(GET_PROJECT, json!({ "projectName": "p1" })).unwrap();
    let mut p2 = layer.subscribe(GET_PROJECT, json!({ "projectName": "p2" })).unwrap();
    p1.settled().await;
    p2.settled().await;

    layer
      .execute_mutation(
        "updateProject",
        json!({ "projectName": "p1", "update": { "code": "x" } }),
      )
      .await
      .unwrap();
    p1.settled().await;
    assert_eq!(fake.calls_to("GET /api/projects/p1"), 2);
    assert_eq!(fake.calls_to("GET /api/projects/p2"), 1);

    layer
      .execute_mutation(
        "updateProject",
        json!({ "projectName": "p1", "update": { "active": false } }),
      )
      .await
      .unwrap();
    p1.settled().await;
    p2.settled().await;
    assert_eq!(fake.calls_to("GET /api/projects/p1"), 3);
    assert_eq!(fake.calls_to("GET /api/projects/p2"), 2);
  }

  #[tokio::test]
  async fn test_invalidated_bundle_entity_is_stale() {
    let (layer, fake) = setup(FakeBackend::default());
    fake.route(
      "GET /api/bundles?archived=true",
      Ok(json!({ "bundles": [bundle_json("b1", false), bundle_json("b2", false)] })),
    );
    layer
      .query(GET_BUNDLE_LIST, json!({ "archived": true }))
      .await
      .unwrap();
    assert_eq!(layer.entity_status("bundle", "b1"), Some(EntityStatus::Fresh));

    layer.invalidate_tags(&[Tag::item("bundle", "b1")]);
    assert_eq!(layer.entity_status("bundle", "b1"), Some(EntityStatus::Stale));
    assert_eq!(layer.entity_status("bundle", "b2"), Some(EntityStatus::Fresh));
    assert_eq!(layer.entity_status("bundle", "b3"), None);

    // refetched on the next read, which stores the entity fresh again
    layer
      .query(GET_BUNDLE_LIST, json!({ "archived": true }))
      .await
      .unwrap();
    assert_eq!(layer.entity_status("bundle", "b1"), Some(EntityStatus::Fresh));
    assert_eq!(fake.calls_to("GET /api/bundles?archived=true"), 2);
  }

  #[tokio::test]
  async fn test_garbage_collection_drops_orphaned_entities() {
    let (layer, fake) = setup(FakeBackend::default());
    let layer = layer.with_keep_unused_for(Duration::ZERO);
    fake.route(
      "GET /api/bundles?archived=true",
      Ok(json!({ "bundles": [bundle_json("b1", false), bundle_json("b2", false)] })),
    );
    fake.route(
      "GET /api/bundles?archived=false",
      Ok(json!({ "bundles": [bundle_json("b1", false)] })),
    );

    let mut all = layer
      .subscribe(GET_BUNDLE_LIST, json!({ "archived": true }))
      .unwrap();
    let mut active = layer
      .subscribe(GET_BUNDLE_LIST, json!({ "archived": false }))
      .unwrap();
    all.settled().await;
    active.settled().await;

    drop(all);
    assert_eq!(layer.collect_garbage(), 1);
    // b1 is still held by the subscribed list
    assert!(layer.entity::<Bundle>("b1").unwrap().is_some());
    assert!(layer.entity::<Bundle>("b2").unwrap().is_none());
  }

  #[tokio::test]
  async fn test_path_arguments_are_encoded() {
    let (layer, fake) = setup(FakeBackend::default());
    fake.route("DELETE /api/bundles/..%2Fprojects%2Fx", Ok(Value::Null));
    fake.route("PATCH /api/bundles/dev%20build?force=true", Ok(Value::Null));

    layer
      .execute_mutation("deleteBundle", json!({ "name": "../projects/x" }))
      .await
      .unwrap();
    layer
      .execute_mutation("updateBundle", json!({ "name": "dev build", "data": {} }))
      .await
      .unwrap();
    assert_eq!(fake.calls_to("DELETE /api/projects/x"), 0);

    let err = layer
      .execute_mutation("deleteBundle", json!({ "name": ".." }))
      .await
      .unwrap_err();
    assert_eq!(err, SyncError::Decode("invalid name \"..\"".into()));
    assert_eq!(fake.calls.lock().unwrap().len(), 2);
  }

  fn task_json(id: &str, status: &str) -> Value {
    json!({ "id": id, "name": format!("{}-name", id), "status": status })
  }

  fn details_args() -> Value {
    json!({ "projectName": "demo", "type": "task", "ids": ["t1", "t2"] })
  }

  fn statuses(data: Option<AyonData>) -> Vec<String> {
    match data {
      Some(AyonData::EntitiesDetails(entities)) => entities
        .iter()
        .map(|e| e.fields["status"].as_str().unwrap_or_default().to_string())
        .collect(),
      other => panic!("unexpected {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_update_entities_rolls_back_when_operations_fail() {
    let hold = Arc::new(Notify::new());
    let (layer, fake) = setup(FakeBackend {
      hold: Some(hold.clone()),
      ..FakeBackend::default()
    });
    fake.route("GET /api/projects/demo/tasks/t1", Ok(task_json("t1", "Todo")));
    fake.route("GET /api/projects/demo/tasks/t2", Ok(task_json("t2", "Todo")));
    fake.route(
      "POST /api/projects/demo/operations",
      Ok(json!({
        "success": false,
        "operations": [{ "id": "op1", "success": false, "detail": "Invalid status" }],
      })),
    );

    let mut details = layer.subscribe(GET_ENTITIES_DETAILS, details_args()).unwrap();
    details.settled().await;

    let mutation = {
      let layer = layer.clone();
      tokio::spawn(async move {
        layer
          .execute_mutation(
            "updateEntitiesDetails",
            json!({
              "projectName": "demo",
              "type": "task",
              "ids": ["t1", "t2"],
              "data": { "status": "Approved" },
              "patches": [
                { "id": "t1", "status": "Approved" },
                { "id": "t2", "status": "Approved" },
              ],
            }),
          )
          .await
      })
    };
    tokio::task::yield_now().await;
    assert_eq!(statuses(details.data()), vec!["Approved", "Approved"]);

    hold.notify_one();
    let err = mutation.await.unwrap().unwrap_err();
    assert_eq!(
      err,
      SyncError::Server {
        status: 200,
        detail: "Invalid status".into()
      }
    );

    assert_eq!(statuses(details.data()), vec!["Todo", "Todo"]);
    assert!(!details.is_loading());
    assert_eq!(fake.calls_to("GET /api/projects/demo/tasks/t1"), 1);

    let body = fake.body_of("POST /api/projects/demo/operations").unwrap();
    assert_eq!(body["operations"][1]["entityId"], "t2");
    assert_eq!(body["operations"][0]["type"], "update");
    assert_eq!(body["operations"][0]["data"]["status"], "Approved");
  }

  #[tokio::test]
  async fn test_update_entities_tags() {
    let (layer, fake) = setup(FakeBackend::default());
    fake.route("GET /api/projects/demo/tasks/t1", Ok(task_json("t1", "Todo")));
    fake.route("GET /api/projects/demo/tasks/t2", Ok(task_json("t2", "Todo")));
    fake.route("POST /api/projects/demo/operations", Ok(json!({ "success": true })));

    let mut details = layer.subscribe(GET_ENTITIES_DETAILS, details_args()).unwrap();
    details.settled().await;
    assert_eq!(layer.signatures_for(&Tag::item("task", "t2")).len(), 1);

    // ids come from the patches when not given
    layer
      .execute_mutation(
        "updateEntitiesDetails",
        json!({
          "projectName": "demo",
          "type": "task",
          "data": { "name": "renamed" },
          "patches": [{ "id": "t1", "name": "renamed" }],
          "disabledInvalidation": true,
        }),
      )
      .await
      .unwrap();
    let body = fake.body_of("POST /api/projects/demo/operations").unwrap();
    assert_eq!(body["operations"].as_array().map(Vec::len), Some(1));
    assert_eq!(fake.calls_to("GET /api/projects/demo/tasks/t1"), 1);

    layer
      .execute_mutation(
        "updateEntitiesDetails",
        json!({
          "projectName": "demo",
          "type": "task",
          "ids": ["t2"],
          "data": { "status": "Done" },
        }),
      )
      .await
      .unwrap();
    details.settled().await;
    assert_eq!(fake.calls_to("GET /api/projects/demo/tasks/t1"), 2);
  }

  #[test]
  fn test_update_entities_invalidates_activities_on_status() {
    let definition = update_entities_details(Arc::new(Arc::new(FakeBackend::default())));
    let rendered = |args: Value| -> Vec<String> {
      (definition.invalidates)(&args, &Value::Null)
        .iter()
        .map(|t| t.to_string())
        .collect()
    };

    let args = json!({ "type": "task", "ids": ["t1"], "data": { "status": "Done" } });
    assert_eq!(
      rendered(args),
      vec!["task/t1", "kanBanTask/TASKS", "entityActivities/t1"]
    );
    let args = json!({ "type": "task", "ids": ["t1"], "data": { "name": "x" } });
    assert_eq!(rendered(args), vec!["task/t1", "kanBanTask/TASKS"]);
    let args = json!({ "type": "task", "ids": ["t1"], "data": {}, "disabledInvalidation": true });
    assert!(rendered(args).is_empty());
  }

  #[tokio::test]
  async fn test_update_project_anatomy_refetches_project() {
    let (layer, fake) = setup(FakeBackend::default());
    fake.route("GET /api/projects/p1", Ok(json!({ "name": "p1", "code": "p1" })));
    fake.route("POST /api/projects/p1/anatomy", Ok(Value::Null));

    let mut project = layer.subscribe(GET_PROJECT, json!({ "projectName": "p1" })).unwrap();
    project.settled().await;

    layer
      .execute_mutation(
        "updateProjectAnatomy",
        json!({ "projectName": "p1", "anatomy": { "roots": [] } }),
      )
      .await
      .unwrap();
    project.settled().await;

    assert_eq!(
      fake.body_of("POST /api/projects/p1/anatomy"),
      Some(json!({ "roots": [] }))
    );
    assert_eq!(fake.calls_to("GET /api/projects/p1"), 2);
  }

  #[test]
  fn test_feed_key_ignores_paging() {
    let mut paged = feed_args("comments");
    paged["cursor"] = json!("c9");
    paged["last"] = json!(20);
    assert_eq!(feed_key(&paged), feed_key(&feed_args("comments")));

    let bare = json!({ "projectName": "demo", "entityIds": ["task1"], "filter": "comments" });
    assert_eq!(feed_key(&bare)["activityTypes"], json!([]));
  }

  #[test]
  fn test_other_filter_tags() {
    let filters: Vec<String> = DEFAULT_ACTIVITY_FILTERS.iter().map(|f| f.to_string()).collect();
    let tags = other_filter_tags(&json!({ "entityId": "t1", "filter": "comments" }), &filters);
    let rendered: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
    assert_eq!(
      rendered,
      vec![
        "entityActivities/t1-activity",
        "entityActivities/t1-versions",
        "entityActivities/t1-checklists",
      ]
    );
  }
}
