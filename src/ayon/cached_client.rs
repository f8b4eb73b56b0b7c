//! Typed AYON client on top of the cache layer.

use color_eyre::Result;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::cache::CacheLayer;
use crate::config::Config;
use crate::error::{SyncError, SyncResult};
use crate::query::Subscription;

use super::client::{Backend, RestClient};
use super::endpoints::{self, GET_ACTIVITIES, GET_ALL_PROJECTS, GET_BUNDLE_LIST, GET_PROJECT};
use super::types::{ActivityFeed, AyonData, Bundle, Project};

/// Arguments identifying one activity feed page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedQuery {
  pub project_name: String,
  pub entity_ids: Vec<String>,
  pub activity_types: Vec<String>,
  /// UI filter this feed is shown under (`comments`, `checklists`, ...)
  pub filter: String,
  /// Load activities before this cursor
  pub cursor: Option<String>,
  pub last: Option<u32>,
}

impl FeedQuery {
  pub fn args(&self) -> Value {
    json!({
      "projectName": self.project_name,
      "entityIds": self.entity_ids,
      "activityTypes": self.activity_types,
      "filter": self.filter,
      "cursor": self.cursor,
      "last": self.last,
    })
  }
}

/// AYON client with transparent caching.
///
/// Every read goes through the shared cache layer, so repeated calls with the
/// same arguments share one request and mutations keep cached results current.
#[derive(Clone)]
pub struct AyonCache {
  cache: CacheLayer<AyonData>,
}

impl AyonCache {
  /// Create a cached client talking to the configured server.
  pub fn new(config: &Config) -> Result<Self> {
    let rest = RestClient::new(config)?;
    let cache = CacheLayer::new().with_keep_unused_for(config.cache.keep_unused_for());
    endpoints::register(&cache, Arc::new(rest), config.activity.filters.clone());
    Ok(Self { cache })
  }

  /// Create a cached client over any backend.
  pub fn with_backend(backend: Arc<dyn Backend>, filters: Vec<String>) -> Self {
    let cache = CacheLayer::new();
    endpoints::register(&cache, backend, filters);
    Self { cache }
  }

  /// The underlying cache layer, for subscriptions and raw mutations.
  pub fn layer(&self) -> &CacheLayer<AyonData> {
    &self.cache
  }

  pub async fn bundles(&self, archived: bool) -> SyncResult<Vec<Bundle>> {
    match self.cache.query(GET_BUNDLE_LIST, bundle_args(archived)).await? {
      AyonData::BundleList(bundles) => Ok(bundles),
      other => Err(unexpected(GET_BUNDLE_LIST, &other)),
    }
  }

  pub async fn projects(&self) -> SyncResult<Vec<Project>> {
    match self.cache.query(GET_ALL_PROJECTS, json!({})).await? {
      AyonData::Projects(projects) => Ok(projects),
      other => Err(unexpected(GET_ALL_PROJECTS, &other)),
    }
  }

  pub async fn project(&self, name: &str) -> SyncResult<Project> {
    match self
      .cache
      .query(GET_PROJECT, json!({ "projectName": name }))
      .await?
    {
      AyonData::Project(project) => Ok(project),
      other => Err(unexpected(GET_PROJECT, &other)),
    }
  }

  /// Load a feed page and return the whole merged feed.
  pub async fn activities(&self, query: &FeedQuery) -> SyncResult<ActivityFeed> {
    match self.cache.query(GET_ACTIVITIES, query.args()).await? {
      AyonData::Activities(feed) => Ok(feed),
      other => Err(unexpected(GET_ACTIVITIES, &other)),
    }
  }

  /// Subscribe to a feed; keep the subscription alive to have it refreshed.
  pub fn watch_activities(&self, query: &FeedQuery) -> SyncResult<Subscription<AyonData>> {
    self.cache.subscribe(GET_ACTIVITIES, query.args())
  }

  /// Mark a bundle as (not) the production bundle.
  ///
  /// The cached bundle list shows the change immediately and is refetched
  /// once the server accepted it.
  pub async fn set_production(&self, name: &str, production: bool) -> SyncResult<()> {
    let mut bundle = self
      .bundles(true)
      .await?
      .into_iter()
      .find(|b| b.name == name)
      .ok_or_else(|| SyncError::Conflict(format!("bundle {} not found", name)))?;
    bundle.is_production = production;

    self
      .cache
      .execute_mutation(
        "updateBundle",
        json!({
          "name": name,
          "archived": true,
          "data": { "isProduction": production },
          "patch": serde_json::to_value(&bundle)?,
        }),
      )
      .await?;
    Ok(())
  }

  /// Post a comment on an entity. Feeds of the entity shown under the other
  /// filters are refetched.
  pub async fn comment(
    &self,
    feed: &FeedQuery,
    entity_type: &str,
    entity_id: &str,
    body: &str,
  ) -> SyncResult<Value> {
    let mut args = feed.args();
    args["entityType"] = json!(entity_type);
    args["entityId"] = json!(entity_id);
    args["data"] = json!({ "body": body });
    self.cache.execute_mutation("createEntityActivity", args).await
  }
}

fn bundle_args(archived: bool) -> Value {
  json!({ "archived": archived })
}

fn unexpected(endpoint: &str, data: &AyonData) -> SyncError {
  SyncError::Decode(format!("{} returned unexpected payload {:?}", endpoint, data))
}
