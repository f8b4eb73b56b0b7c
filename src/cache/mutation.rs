//! Mutation executor: optimistic patches, request, commit or roll back.

use serde_json::Value;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::definition::PatchRequest;
use super::layer::CacheLayer;
use super::signature::QuerySignature;
use super::storage::RestoreOutcome;
use super::traits::Payload;
use crate::error::SyncResult;

/// Lifecycle of one mutation call.
///
/// `Idle -> Patching -> InFlight -> Committed | RolledBack`. A patch conflict
/// goes straight from `Patching` to `RolledBack` without sending the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
  Idle,
  Patching,
  InFlight,
  Committed,
  RolledBack,
}

impl MutationPhase {
  pub fn can_advance_to(self, next: MutationPhase) -> bool {
    use MutationPhase::*;
    matches!(
      (self, next),
      (Idle, Patching)
        | (Patching, InFlight)
        | (Patching, RolledBack)
        | (InFlight, Committed)
        | (InFlight, RolledBack)
    )
  }

  pub fn is_settled(self) -> bool {
    matches!(self, MutationPhase::Committed | MutationPhase::RolledBack)
  }
}

/// Tracks the phase of a running mutation for logging.
#[derive(Debug)]
struct MutationRun<'a> {
  name: &'a str,
  phase: MutationPhase,
  started: Instant,
}

impl<'a> MutationRun<'a> {
  fn new(name: &'a str) -> Self {
    Self {
      name,
      phase: MutationPhase::Idle,
      started: Instant::now(),
    }
  }

  fn advance(&mut self, next: MutationPhase) {
    if !self.phase.can_advance_to(next) {
      warn!(mutation = self.name, from = ?self.phase, to = ?next, "illegal mutation transition");
      return;
    }
    debug!(mutation = self.name, from = ?self.phase, to = ?next, "mutation phase");
    self.phase = next;
    if next.is_settled() {
      info!(
        mutation = self.name,
        outcome = ?next,
        elapsed_ms = self.started.elapsed().as_millis() as u64,
        "mutation settled"
      );
    }
  }
}

/// An applied optimistic patch with the value needed to undo it.
///
/// Undoing writes `prior_value` back even if a later patch was applied on top
/// of this one; that later change is lost. Dropping the patch without calling
/// `undo` keeps the patched value.
pub struct OptimisticPatch<D: Payload> {
  layer: CacheLayer<D>,
  signature: QuerySignature,
  prior: Option<D>,
  generation: u64,
}

impl<D: Payload> OptimisticPatch<D> {
  pub fn signature(&self) -> &QuerySignature {
    &self.signature
  }

  /// Data of the entry before this patch.
  pub fn prior_value(&self) -> Option<&D> {
    self.prior.as_ref()
  }

  /// Restore the entry to its value before this patch.
  pub fn undo(mut self) {
    let Some(prior) = self.prior.take() else {
      return;
    };
    let outcome = self
      .layer
      .lock()
      .queries
      .restore(&self.signature, prior, self.generation);

    match outcome {
      RestoreOutcome::Restored {
        overwrote_newer: true,
      } => {
        self
          .layer
          .counters()
          .overwritten_patches
          .fetch_add(1, Ordering::Relaxed);
        warn!(query = %self.signature, "rollback overwrote a newer optimistic patch");
      }
      RestoreOutcome::Restored { .. } => {}
      RestoreOutcome::Missing => {
        debug!(query = %self.signature, "rollback target no longer cached");
      }
    }
  }

  /// Keep the patched value and discard the undo information.
  pub fn commit(mut self) {
    self.settle();
  }

  fn settle(&mut self) {
    if self.prior.take().is_some() {
      self.layer.lock().queries.settle_patch(&self.signature);
    }
  }
}

impl<D: Payload> Drop for OptimisticPatch<D> {
  fn drop(&mut self) {
    self.settle();
  }
}

impl<D: Payload> CacheLayer<D> {
  /// Patch the cached result of `endpoint(args)`.
  ///
  /// Returns `Ok(None)` if the entry does not exist or holds no data yet.
  /// A recipe error is returned unchanged and leaves the entry untouched.
  pub fn update_query_data<F>(
    &self,
    endpoint: &str,
    args: &Value,
    recipe: F,
  ) -> SyncResult<Option<OptimisticPatch<D>>>
  where
    F: FnOnce(&mut D) -> SyncResult<()>,
  {
    let signature = self.query_definition(endpoint)?.signature(args);
    let applied = self.lock().queries.apply_patch(&signature, recipe)?;

    Ok(applied.map(|applied| {
      if applied.stacked {
        self
          .counters()
          .stacked_patches
          .fetch_add(1, Ordering::Relaxed);
        warn!(query = %signature, "optimistic patch stacked on an outstanding patch");
      }
      OptimisticPatch {
        layer: self.clone(),
        signature,
        prior: Some(applied.prior),
        generation: applied.generation,
      }
    }))
  }

  fn apply_patch_request(
    &self,
    request: PatchRequest<D>,
  ) -> SyncResult<Option<OptimisticPatch<D>>> {
    self.update_query_data(&request.endpoint, &request.args, request.recipe)
  }

  /// Run a mutation.
  ///
  /// Optimistic patches are visible to readers before the request is sent.
  /// On success the patches are kept, response patches are applied, and the
  /// declared tags are invalidated. On failure every patch is undone in
  /// reverse order and the error is returned; nothing is invalidated.
  pub async fn execute_mutation(&self, name: &str, args: Value) -> SyncResult<Value> {
    let definition = self.mutation_definition(name)?;
    let mut run = MutationRun::new(name);

    run.advance(MutationPhase::Patching);
    let mut patches = Vec::new();
    if let Some(optimistic) = &definition.optimistic {
      for request in optimistic(&args) {
        match self.apply_patch_request(request) {
          Ok(Some(patch)) => patches.push(patch),
          Ok(None) => {}
          Err(error) => {
            warn!(mutation = name, %error, "optimistic patch rejected");
            undo_all(patches);
            run.advance(MutationPhase::RolledBack);
            return Err(error);
          }
        }
      }
    }

    run.advance(MutationPhase::InFlight);
    let response = (definition.resolver)(args.clone()).await;

    match response {
      Ok(response) => {
        for patch in patches {
          patch.commit();
        }
        if let Some(on_success) = &definition.on_success {
          for request in on_success(&args, &response) {
            let endpoint = request.endpoint.clone();
            if let Err(error) = self.apply_response_patch(request) {
              warn!(mutation = name, query = %endpoint, %error, "response patch failed");
            }
          }
        }
        run.advance(MutationPhase::Committed);

        let tags = (definition.invalidates)(&args, &response);
        self.invalidate_tags(&tags);
        Ok(response)
      }
      Err(error) => {
        warn!(mutation = name, %error, "mutation failed, rolling back");
        undo_all(patches);
        run.advance(MutationPhase::RolledBack);
        Err(error)
      }
    }
  }

  fn apply_response_patch(&self, request: PatchRequest<D>) -> SyncResult<bool> {
    let signature = self.query_definition(&request.endpoint)?.signature(&request.args);
    self.lock().queries.modify(&signature, request.recipe)
  }
}

fn undo_all<D: Payload>(patches: Vec<OptimisticPatch<D>>) {
  for patch in patches.into_iter().rev() {
    patch.undo();
  }
}
