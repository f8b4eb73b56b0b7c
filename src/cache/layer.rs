//! Cache layer that orchestrates the query cache, tag index and entity store.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

use super::definition::{MutationDefinition, QueryDefinition};
use super::entities::{EntityStatus, EntityStore};
use super::signature::QuerySignature;
use super::storage::QueryCache;
use super::tags::{Tag, TagId, TagIndex};
use super::traits::{Cacheable, Payload, QuerySnapshot, QueryStatus};
use crate::error::{SyncError, SyncResult};
use crate::query::Subscription;

/// Everything guarded by the layer's lock. Each cache operation takes the
/// lock once and never awaits while holding it.
pub(crate) struct State<D> {
  pub(crate) queries: QueryCache<D>,
  pub(crate) tags: TagIndex,
  pub(crate) entities: EntityStore,
}

#[derive(Default)]
pub(crate) struct Counters {
  pub(crate) fetches: AtomicU64,
  pub(crate) stacked_patches: AtomicU64,
  pub(crate) overwritten_patches: AtomicU64,
}

struct Shared<D> {
  state: Mutex<State<D>>,
  queries: RwLock<HashMap<String, Arc<QueryDefinition<D>>>>,
  mutations: RwLock<HashMap<String, Arc<MutationDefinition<D>>>>,
  counters: Counters,
}

/// Counters describing what the layer has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheDiagnostics {
  /// Fetches started (initial loads and refetches)
  pub fetches: u64,
  /// Optimistic patches applied while another patch on the same entry was
  /// still outstanding
  pub stacked_patches: u64,
  /// Undos that overwrote a newer optimistic patch
  pub overwritten_patches: u64,
}

/// Cache context shared by every consumer of one backend.
///
/// Cloning is cheap and yields a handle to the same cache. Construct one per
/// application (or per test); there is no global instance.
pub struct CacheLayer<D: Payload> {
  shared: Arc<Shared<D>>,
  /// How long an entry without subscribers survives garbage collection
  keep_unused_for: Duration,
}

impl<D: Payload> CacheLayer<D> {
  /// Create an empty cache layer.
  pub fn new() -> Self {
    Self {
      shared: Arc::new(Shared {
        state: Mutex::new(State {
          queries: QueryCache::new(),
          tags: TagIndex::new(),
          entities: EntityStore::new(),
        }),
        queries: RwLock::new(HashMap::new()),
        mutations: RwLock::new(HashMap::new()),
        counters: Counters::default(),
      }),
      keep_unused_for: Duration::from_secs(60),
    }
  }

  /// Set how long unused entries are kept.
  pub fn with_keep_unused_for(mut self, keep_unused_for: Duration) -> Self {
    self.keep_unused_for = keep_unused_for;
    self
  }

  /// Register a query. A later definition with the same name replaces it.
  pub fn define_query(&self, definition: QueryDefinition<D>) {
    let mut queries = self
      .shared
      .queries
      .write()
      .unwrap_or_else(PoisonError::into_inner);
    queries.insert(definition.name().to_string(), Arc::new(definition));
  }

  /// Register a mutation. A later definition with the same name replaces it.
  pub fn define_mutation(&self, definition: MutationDefinition<D>) {
    let mut mutations = self
      .shared
      .mutations
      .write()
      .unwrap_or_else(PoisonError::into_inner);
    mutations.insert(definition.name().to_string(), Arc::new(definition));
  }

  pub(crate) fn query_definition(&self, name: &str) -> SyncResult<Arc<QueryDefinition<D>>> {
    self
      .shared
      .queries
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .get(name)
      .cloned()
      .ok_or_else(|| SyncError::UnknownEndpoint(name.to_string()))
  }

  pub(crate) fn mutation_definition(
    &self,
    name: &str,
  ) -> SyncResult<Arc<MutationDefinition<D>>> {
    self
      .shared
      .mutations
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .get(name)
      .cloned()
      .ok_or_else(|| SyncError::UnknownEndpoint(name.to_string()))
  }

  pub(crate) fn lock(&self) -> MutexGuard<'_, State<D>> {
    self
      .shared
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  pub(crate) fn counters(&self) -> &Counters {
    &self.shared.counters
  }

  /// Subscribe to `endpoint(args)`.
  ///
  /// Starts a fetch when the entry is new, failed, invalidated, or when the
  /// endpoint's refetch rule rejects the previous arguments. Must be called
  /// from within a tokio runtime.
  pub fn subscribe(&self, endpoint: &str, args: Value) -> SyncResult<Subscription<D>> {
    let definition = self.query_definition(endpoint)?;
    let signature = definition.signature(&args);

    let (receiver, fetch) = {
      let mut state = self.lock();
      let forced = state
        .queries
        .get(&signature)
        .map(|entry| {
          entry.status() != QueryStatus::Uninitialized
            && definition.requires_refetch(&args, entry.last_args())
        })
        .unwrap_or(false);

      let receiver = state.queries.subscribe(&signature, &args);
      let needs_fetch = forced
        || state
          .queries
          .get(&signature)
          .map(|entry| entry.needs_fetch())
          .unwrap_or(true);
      let fetch = needs_fetch && state.queries.begin_fetch(&signature, args.clone());
      (receiver, fetch)
    };

    if fetch {
      self.spawn_fetch(definition, signature.clone(), args);
    }

    Ok(Subscription::new(self.clone(), signature, receiver))
  }

  pub(crate) fn release(&self, signature: &QuerySignature) {
    self.lock().queries.unsubscribe(signature);
  }

  /// Fetch `endpoint(args)` through the cache and wait for the result.
  pub async fn query(&self, endpoint: &str, args: Value) -> SyncResult<D> {
    let mut subscription = self.subscribe(endpoint, args)?;
    let snapshot = subscription.settled().await;

    match (snapshot.error, snapshot.data) {
      (Some(error), _) => Err(error),
      (None, Some(data)) => Ok(data),
      (None, None) => Err(SyncError::Network(format!(
        "{} settled without data",
        subscription.signature()
      ))),
    }
  }

  /// Current state of `endpoint(args)` without subscribing.
  pub fn snapshot(&self, endpoint: &str, args: &Value) -> SyncResult<QuerySnapshot<D>> {
    let signature = self.query_definition(endpoint)?.signature(args);
    Ok(
      self
        .lock()
        .queries
        .get(&signature)
        .map(|entry| entry.snapshot())
        .unwrap_or_default(),
    )
  }

  /// Refetch an entry with its last arguments. Returns false when a fetch is
  /// already in flight or the entry does not exist.
  pub fn refetch(&self, signature: &QuerySignature) -> bool {
    let args = {
      let mut state = self.lock();
      let Some(args) = state
        .queries
        .get(signature)
        .map(|entry| entry.last_args().clone())
      else {
        return false;
      };
      if !state.queries.begin_fetch(signature, args.clone()) {
        return false;
      }
      args
    };

    self.start_refetch(signature.clone(), args);
    true
  }

  /// Invalidate every query providing one of `tags`.
  ///
  /// Subscribed entries refetch now (at most one fetch in flight each);
  /// the rest refetch on their next subscription. Returns the number of
  /// fetches started.
  pub fn invalidate_tags(&self, tags: &[Tag]) -> usize {
    let started = {
      let mut guard = self.lock();
      let state = &mut *guard;

      let mut signatures = HashSet::new();
      for tag in tags {
        signatures.extend(state.tags.lookup(tag));
        if let Some(TagId::Item(id)) = &tag.id {
          state.entities.mark_stale(&tag.kind, id);
        }
      }

      let mut started = Vec::new();
      for (signature, args) in state.queries.mark_stale(&signatures) {
        if state.queries.begin_fetch(&signature, args.clone()) {
          started.push((signature, args));
        }
      }
      debug!(
        tags = tags.len(),
        invalidated = signatures.len(),
        refetching = started.len(),
        "tags invalidated"
      );
      started
    };

    let count = started.len();
    for (signature, args) in started {
      self.start_refetch(signature, args);
    }
    count
  }

  fn start_refetch(&self, signature: QuerySignature, args: Value) {
    match self.query_definition(signature.endpoint()) {
      Ok(definition) => self.spawn_fetch(definition, signature, args),
      Err(error) => self.lock().queries.fail(&signature, error),
    }
  }

  fn spawn_fetch(
    &self,
    definition: Arc<QueryDefinition<D>>,
    signature: QuerySignature,
    args: Value,
  ) {
    self.shared.counters.fetches.fetch_add(1, Ordering::Relaxed);
    debug!(query = %signature, hash = %signature.cache_hash(), "fetch started");

    let future = (definition.resolver)(args.clone());
    let layer = self.clone();
    tokio::spawn(async move {
      let result = future.await;
      if let Some(args) = layer.finish_fetch(&definition, &signature, &args, result) {
        layer.spawn_fetch(definition, signature, args);
      }
    });
  }

  /// Store a fetch result. Returns the arguments of a follow-up fetch when
  /// the entry was invalidated while this one was in flight and is still
  /// subscribed; that fetch is already marked as begun.
  fn finish_fetch(
    &self,
    definition: &QueryDefinition<D>,
    signature: &QuerySignature,
    args: &Value,
    result: SyncResult<D>,
  ) -> Option<Value> {
    let mut guard = self.lock();
    let state = &mut *guard;

    match result {
      Ok(incoming) => {
        let existing = state
          .queries
          .get(signature)
          .and_then(|entry| entry.data().cloned());
        let data = match (&definition.merge, existing) {
          (Some(merge), Some(existing)) => merge(existing, incoming),
          _ => incoming,
        };

        let tags: HashSet<Tag> = (definition.tags_for_result)(&data, args)
          .into_iter()
          .collect();
        for record in data.entities() {
          state.entities.upsert(record);
        }
        state.tags.register(signature, tags.iter().cloned());
        state.queries.write(signature, data, tags);
        debug!(query = %signature, "fetch succeeded");
      }
      Err(error) => {
        warn!(query = %signature, %error, "fetch failed");
        state.queries.fail(signature, error);
      }
    }

    let follow_up = state
      .queries
      .get(signature)
      .filter(|entry| entry.is_stale() && entry.subscribers() > 0)
      .map(|entry| entry.last_args().clone())?;
    if !state.queries.begin_fetch(signature, follow_up.clone()) {
      return None;
    }
    debug!(query = %signature, "invalidated during fetch, refetching");
    Some(follow_up)
  }

  /// Signatures currently registered under `tag`.
  pub fn signatures_for(&self, tag: &Tag) -> HashSet<QuerySignature> {
    self.lock().tags.lookup(tag)
  }

  /// Typed entity from the entity store.
  pub fn entity<T: Cacheable>(&self, key: &str) -> SyncResult<Option<T>> {
    self.lock().entities.get(key)
  }

  pub fn entity_status(&self, entity_type: &str, key: &str) -> Option<EntityStatus> {
    self
      .lock()
      .entities
      .get_raw(entity_type, key)
      .map(|stored| stored.status)
  }

  /// Drop entries unused for longer than the keep-unused period, along with
  /// their tag registrations and the entities no remaining entry holds.
  /// Returns how many entries were removed.
  pub fn collect_garbage(&self) -> usize {
    let mut guard = self.lock();
    let state = &mut *guard;
    let removed = state.queries.collect_garbage(self.keep_unused_for);
    if removed.is_empty() {
      return 0;
    }
    for signature in &removed {
      state.tags.remove(signature);
    }

    let live: HashSet<(String, String)> = state
      .queries
      .cached_data()
      .flat_map(|data| data.entities())
      .map(|record| (record.entity_type.to_string(), record.key))
      .collect();
    let dropped = state
      .entities
      .retain(|entity_type, key| live.contains(&(entity_type.to_string(), key.to_string())));
    debug!(
      removed = removed.len(),
      entities = dropped,
      "collected unused cache entries"
    );
    removed.len()
  }

  pub fn diagnostics(&self) -> CacheDiagnostics {
    let counters = &self.shared.counters;
    CacheDiagnostics {
      fetches: counters.fetches.load(Ordering::Relaxed),
      stacked_patches: counters.stacked_patches.load(Ordering::Relaxed),
      overwritten_patches: counters.overwritten_patches.load(Ordering::Relaxed),
    }
  }
}

impl<D: Payload> Default for CacheLayer<D> {
  fn default() -> Self {
    Self::new()
  }
}

impl<D: Payload> Clone for CacheLayer<D> {
  fn clone(&self) -> Self {
    Self {
      shared: Arc::clone(&self.shared),
      keep_unused_for: self.keep_unused_for,
    }
  }
}
