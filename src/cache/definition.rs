//! Query and mutation definitions registered on a cache layer.

use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::signature::{KeyProjection, QuerySignature};
use super::tags::Tag;
use crate::error::SyncResult;

/// A boxed future that returns a `SyncResult<T>`
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = SyncResult<T>> + Send>>;

/// A factory function that creates futures for fetching or mutating data
type ResolverFn<T> = Arc<dyn Fn(Value) -> BoxFuture<T> + Send + Sync>;

type TagsFn<D> = Arc<dyn Fn(&D, &Value) -> Vec<Tag> + Send + Sync>;
type MergeFn<D> = Arc<dyn Fn(D, D) -> D + Send + Sync>;
type RefetchFn = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;
type PatchesFn<D> = Arc<dyn Fn(&Value) -> Vec<PatchRequest<D>> + Send + Sync>;
type ResponsePatchesFn<D> = Arc<dyn Fn(&Value, &Value) -> Vec<PatchRequest<D>> + Send + Sync>;
type InvalidatesFn = Arc<dyn Fn(&Value, &Value) -> Vec<Tag> + Send + Sync>;

fn no_tags<D>(_: &D, _: &Value) -> Vec<Tag> {
  Vec::new()
}

fn no_invalidation(_: &Value, _: &Value) -> Vec<Tag> {
  Vec::new()
}

/// A read endpoint.
///
/// # Example
///
/// ```ignore
/// let rest = rest.clone();
/// let def = QueryDefinition::new("getBundleList", move |args| {
///     let rest = rest.clone();
///     async move { fetch_bundles(&rest, args).await }
/// })
/// .key_projection(pick(&["archived"]))
/// .provides_tags(|data, _args| vec![Tag::list("bundleList")]);
/// ```
pub struct QueryDefinition<D> {
  name: String,
  pub(crate) resolver: ResolverFn<D>,
  key_projection: Option<KeyProjection>,
  pub(crate) tags_for_result: TagsFn<D>,
  pub(crate) merge: Option<MergeFn<D>>,
  force_refetch: Option<RefetchFn>,
}

impl<D: Send + 'static> QueryDefinition<D> {
  /// Create a query with the given resolver.
  ///
  /// The resolver receives the full call arguments and is called once per
  /// fetch; it provides no tags until `provides_tags` is set.
  pub fn new<F, Fut>(name: impl Into<String>, resolver: F) -> Self
  where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SyncResult<D>> + Send + 'static,
  {
    Self {
      name: name.into(),
      resolver: Arc::new(move |args| -> BoxFuture<D> { Box::pin(resolver(args)) }),
      key_projection: None,
      tags_for_result: Arc::new(no_tags::<D>),
      merge: None,
      force_refetch: None,
    }
  }

  /// Restrict the cache key to part of the arguments.
  pub fn key_projection(mut self, projection: KeyProjection) -> Self {
    self.key_projection = Some(projection);
    self
  }

  /// Tags provided by a successful result.
  pub fn provides_tags<F>(mut self, f: F) -> Self
  where
    F: Fn(&D, &Value) -> Vec<Tag> + Send + Sync + 'static,
  {
    self.tags_for_result = Arc::new(f);
    self
  }

  /// Merge each new result into the cached one instead of replacing it.
  /// Called as `merge(existing, incoming)`.
  pub fn merge<F>(mut self, f: F) -> Self
  where
    F: Fn(D, D) -> D + Send + Sync + 'static,
  {
    self.merge = Some(Arc::new(f));
    self
  }

  /// Decide whether a subscription must refetch given its arguments and the
  /// arguments of the last fetch. Called as `f(current, previous)`.
  pub fn force_refetch<F>(mut self, f: F) -> Self
  where
    F: Fn(&Value, &Value) -> bool + Send + Sync + 'static,
  {
    self.force_refetch = Some(Arc::new(f));
    self
  }
}

impl<D> QueryDefinition<D> {
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn signature(&self, args: &Value) -> QuerySignature {
    match &self.key_projection {
      Some(project) => QuerySignature::new(&self.name, &project(args)),
      None => QuerySignature::new(&self.name, args),
    }
  }

  pub(crate) fn requires_refetch(&self, current: &Value, previous: &Value) -> bool {
    self
      .force_refetch
      .as_ref()
      .map(|f| f(current, previous))
      .unwrap_or(false)
  }
}

/// Change to apply to one cached query result.
pub struct PatchRequest<D> {
  pub(crate) endpoint: String,
  pub(crate) args: Value,
  pub(crate) recipe: Box<dyn FnOnce(&mut D) -> SyncResult<()> + Send>,
}

impl<D> PatchRequest<D> {
  /// Patch the entry `endpoint(args)`; `args` go through the endpoint's key
  /// projection like any other call.
  pub fn new<F>(endpoint: impl Into<String>, args: Value, recipe: F) -> Self
  where
    F: FnOnce(&mut D) -> SyncResult<()> + Send + 'static,
  {
    Self {
      endpoint: endpoint.into(),
      args,
      recipe: Box::new(recipe),
    }
  }
}

/// A write endpoint.
pub struct MutationDefinition<D> {
  name: String,
  pub(crate) resolver: ResolverFn<Value>,
  pub(crate) optimistic: Option<PatchesFn<D>>,
  pub(crate) on_success: Option<ResponsePatchesFn<D>>,
  pub(crate) invalidates: InvalidatesFn,
}

impl<D> MutationDefinition<D> {
  pub fn new<F, Fut>(name: impl Into<String>, resolver: F) -> Self
  where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SyncResult<Value>> + Send + 'static,
  {
    Self {
      name: name.into(),
      resolver: Arc::new(move |args| -> BoxFuture<Value> { Box::pin(resolver(args)) }),
      optimistic: None,
      on_success: None,
      invalidates: Arc::new(no_invalidation),
    }
  }

  /// Patches applied before the request is sent and undone if it fails.
  pub fn optimistic<F>(mut self, f: F) -> Self
  where
    F: Fn(&Value) -> Vec<PatchRequest<D>> + Send + Sync + 'static,
  {
    self.optimistic = Some(Arc::new(f));
    self
  }

  /// Patches computed from the server response, applied on success.
  /// Called as `f(args, response)`.
  pub fn on_success<F>(mut self, f: F) -> Self
  where
    F: Fn(&Value, &Value) -> Vec<PatchRequest<D>> + Send + Sync + 'static,
  {
    self.on_success = Some(Arc::new(f));
    self
  }

  /// Tags to invalidate once the request succeeded. Called as `f(args, response)`.
  pub fn invalidates_tags<F>(mut self, f: F) -> Self
  where
    F: Fn(&Value, &Value) -> Vec<Tag> + Send + Sync + 'static,
  {
    self.invalidates = Arc::new(f);
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}
