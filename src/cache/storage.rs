//! Query cache storage: one entry per query signature.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::watch;

use super::signature::QuerySignature;
use super::tags::Tag;
use super::traits::{Payload, QuerySnapshot, QueryStatus};
use crate::error::{SyncError, SyncResult};

/// A cached query result with its bookkeeping.
#[derive(Debug)]
pub struct CacheEntry<D> {
  data: Option<D>,
  status: QueryStatus,
  error: Option<SyncError>,
  tags: HashSet<Tag>,
  subscribers: usize,
  /// Full arguments of the most recent fetch
  last_args: Value,
  in_flight: bool,
  /// Invalidated since the last fetch started
  stale: bool,
  fetched_at: Option<DateTime<Utc>>,
  unused_since: Option<Instant>,
  patch_generation: u64,
  outstanding_patches: usize,
  tx: watch::Sender<QuerySnapshot<D>>,
}

impl<D: Payload> CacheEntry<D> {
  fn new(args: Value) -> Self {
    let (tx, _rx) = watch::channel(QuerySnapshot::uninitialized());
    Self {
      data: None,
      status: QueryStatus::Uninitialized,
      error: None,
      tags: HashSet::new(),
      subscribers: 0,
      last_args: args,
      in_flight: false,
      stale: false,
      fetched_at: None,
      unused_since: Some(Instant::now()),
      patch_generation: 0,
      outstanding_patches: 0,
      tx,
    }
  }

  pub fn snapshot(&self) -> QuerySnapshot<D> {
    QuerySnapshot {
      data: self.data.clone(),
      status: self.status,
      error: self.error.clone(),
      fetched_at: self.fetched_at,
    }
  }

  fn publish(&self) {
    self.tx.send_replace(self.snapshot());
  }

  pub fn data(&self) -> Option<&D> {
    self.data.as_ref()
  }

  pub fn status(&self) -> QueryStatus {
    self.status
  }

  pub fn tags(&self) -> &HashSet<Tag> {
    &self.tags
  }

  pub fn subscribers(&self) -> usize {
    self.subscribers
  }

  pub fn last_args(&self) -> &Value {
    &self.last_args
  }

  pub fn is_in_flight(&self) -> bool {
    self.in_flight
  }

  pub fn is_stale(&self) -> bool {
    self.stale
  }

  /// Whether the next access should start a fetch.
  pub fn needs_fetch(&self) -> bool {
    self.stale || matches!(self.status, QueryStatus::Uninitialized | QueryStatus::Error)
  }
}

/// A patch applied to an entry, with what is needed to undo it.
#[derive(Debug)]
pub struct AppliedPatch<D> {
  pub prior: D,
  /// Entry generation right after this patch was applied
  pub generation: u64,
  /// Another patch on the same entry was still outstanding
  pub stacked: bool,
}

/// Result of writing a prior value back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
  /// Restored; `overwrote_newer` is set when a later patch is lost by this undo
  Restored { overwrote_newer: bool },
  /// The entry is gone, nothing to restore
  Missing,
}

/// Map from query signature to cache entry.
#[derive(Debug)]
pub struct QueryCache<D> {
  entries: HashMap<QuerySignature, CacheEntry<D>>,
}

impl<D: Payload> QueryCache<D> {
  pub fn new() -> Self {
    Self {
      entries: HashMap::new(),
    }
  }

  pub fn get(&self, signature: &QuerySignature) -> Option<&CacheEntry<D>> {
    self.entries.get(signature)
  }

  /// Register interest in `signature`, creating the entry on first use.
  pub fn subscribe(
    &mut self,
    signature: &QuerySignature,
    args: &Value,
  ) -> watch::Receiver<QuerySnapshot<D>> {
    let entry = self
      .entries
      .entry(signature.clone())
      .or_insert_with(|| CacheEntry::new(args.clone()));
    entry.subscribers += 1;
    entry.unused_since = None;
    entry.tx.subscribe()
  }

  /// Drop one subscriber. The entry stays until garbage collection.
  pub fn unsubscribe(&mut self, signature: &QuerySignature) {
    if let Some(entry) = self.entries.get_mut(signature) {
      entry.subscribers = entry.subscribers.saturating_sub(1);
      if entry.subscribers == 0 {
        entry.unused_since = Some(Instant::now());
      }
    }
  }

  /// Mark the start of a fetch. Returns false if one is already in flight.
  pub fn begin_fetch(&mut self, signature: &QuerySignature, args: Value) -> bool {
    let entry = self
      .entries
      .entry(signature.clone())
      .or_insert_with(|| CacheEntry::new(args.clone()));
    if entry.in_flight {
      return false;
    }
    entry.in_flight = true;
    entry.stale = false;
    entry.status = QueryStatus::Loading;
    entry.error = None;
    entry.last_args = args;
    entry.publish();
    true
  }

  /// Store a successful fetch result.
  pub fn write(&mut self, signature: &QuerySignature, data: D, tags: HashSet<Tag>) {
    let entry = self
      .entries
      .entry(signature.clone())
      .or_insert_with(|| CacheEntry::new(Value::Null));
    entry.data = Some(data);
    entry.status = QueryStatus::Success;
    entry.error = None;
    entry.tags = tags;
    entry.in_flight = false;
    entry.fetched_at = Some(Utc::now());
    entry.publish();
  }

  /// Record a failed fetch, keeping previously cached data.
  pub fn fail(&mut self, signature: &QuerySignature, error: SyncError) {
    if let Some(entry) = self.entries.get_mut(signature) {
      entry.status = QueryStatus::Error;
      entry.error = Some(error);
      entry.in_flight = false;
      entry.publish();
    }
  }

  /// Mark entries stale. Returns the ones that should refetch right away:
  /// subscribed and not already fetching, with their last arguments.
  pub fn mark_stale<'a>(
    &mut self,
    signatures: impl IntoIterator<Item = &'a QuerySignature>,
  ) -> Vec<(QuerySignature, Value)> {
    let mut refetch = Vec::new();
    for signature in signatures {
      if let Some(entry) = self.entries.get_mut(signature) {
        entry.stale = true;
        if entry.subscribers > 0 && !entry.in_flight {
          refetch.push((signature.clone(), entry.last_args.clone()));
        }
      }
    }
    refetch
  }

  /// Apply `recipe` to a copy of the entry's data and keep the result.
  ///
  /// Returns `Ok(None)` when there is nothing to patch (no entry or no data).
  /// A recipe error leaves the entry untouched.
  pub fn apply_patch<F>(
    &mut self,
    signature: &QuerySignature,
    recipe: F,
  ) -> SyncResult<Option<AppliedPatch<D>>>
  where
    F: FnOnce(&mut D) -> SyncResult<()>,
  {
    let Some(entry) = self.entries.get_mut(signature) else {
      return Ok(None);
    };
    let Some(prior) = entry.data.clone() else {
      return Ok(None);
    };

    let mut draft = prior.clone();
    recipe(&mut draft)?;

    let stacked = entry.outstanding_patches > 0;
    entry.data = Some(draft);
    entry.patch_generation += 1;
    entry.outstanding_patches += 1;
    entry.publish();

    Ok(Some(AppliedPatch {
      prior,
      generation: entry.patch_generation,
      stacked,
    }))
  }

  /// Undo a patch by writing its prior value back.
  pub fn restore(
    &mut self,
    signature: &QuerySignature,
    prior: D,
    generation: u64,
  ) -> RestoreOutcome {
    let Some(entry) = self.entries.get_mut(signature) else {
      return RestoreOutcome::Missing;
    };
    let overwrote_newer = entry.patch_generation != generation;
    entry.outstanding_patches = entry.outstanding_patches.saturating_sub(1);
    entry.data = Some(prior);
    entry.publish();
    RestoreOutcome::Restored { overwrote_newer }
  }

  /// Keep a patch: its undo information is discarded.
  pub fn settle_patch(&mut self, signature: &QuerySignature) {
    if let Some(entry) = self.entries.get_mut(signature) {
      entry.outstanding_patches = entry.outstanding_patches.saturating_sub(1);
    }
  }

  /// Overwrite data in place without undo information. Returns whether
  /// anything was changed.
  pub fn modify<F>(&mut self, signature: &QuerySignature, recipe: F) -> SyncResult<bool>
  where
    F: FnOnce(&mut D) -> SyncResult<()>,
  {
    let Some(entry) = self.entries.get_mut(signature) else {
      return Ok(false);
    };
    let Some(data) = entry.data.as_ref() else {
      return Ok(false);
    };

    let mut draft = data.clone();
    recipe(&mut draft)?;
    entry.data = Some(draft);
    entry.publish();
    Ok(true)
  }

  /// Remove entries nobody has used for `keep_unused_for`.
  pub fn collect_garbage(&mut self, keep_unused_for: Duration) -> Vec<QuerySignature> {
    let expired: Vec<QuerySignature> = self
      .entries
      .iter()
      .filter(|(_, entry)| {
        entry.subscribers == 0
          && !entry.in_flight
          && entry
            .unused_since
            .map(|since| since.elapsed() >= keep_unused_for)
            .unwrap_or(false)
      })
      .map(|(signature, _)| signature.clone())
      .collect();

    for signature in &expired {
      self.entries.remove(signature);
    }
    expired
  }

  /// Data of every entry that holds some.
  pub fn cached_data(&self) -> impl Iterator<Item = &D> {
    self.entries.values().filter_map(|entry| entry.data.as_ref())
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}
