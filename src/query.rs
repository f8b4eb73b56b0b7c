//! Query subscriptions: a consumer's live view of one cache entry.
//!
//! Inspired by TanStack Query, a `Subscription<D>` keeps an entry alive,
//! exposes its loading/success/error state, and reports changes.
//!
//! # Example
//!
//! ```ignore
//! let mut bundles = layer.subscribe("getBundleList", json!({ "archived": true }))?;
//!
//! // In event loop tick
//! if bundles.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! // In render
//! match bundles.status() {
//!     QueryStatus::Loading => render_spinner(),
//!     QueryStatus::Success => render_data(bundles.data()),
//!     QueryStatus::Error => render_error(bundles.error()),
//!     QueryStatus::Uninitialized => {}
//! }
//! ```

use tokio::sync::watch;

use crate::cache::{CacheLayer, Payload, QuerySignature, QuerySnapshot, QueryStatus};
use crate::error::SyncError;

/// Subscription handle for one query signature.
///
/// Dropping the handle unsubscribes. An in-flight fetch is not cancelled;
/// its result is still written to the cache, but this handle no longer sees it.
pub struct Subscription<D: Payload> {
  layer: CacheLayer<D>,
  signature: QuerySignature,
  receiver: watch::Receiver<QuerySnapshot<D>>,
}

impl<D: Payload> Subscription<D> {
  pub(crate) fn new(
    layer: CacheLayer<D>,
    signature: QuerySignature,
    receiver: watch::Receiver<QuerySnapshot<D>>,
  ) -> Self {
    Self {
      layer,
      signature,
      receiver,
    }
  }

  pub fn signature(&self) -> &QuerySignature {
    &self.signature
  }

  /// Current state of the entry.
  pub fn snapshot(&self) -> QuerySnapshot<D> {
    self.receiver.borrow().clone()
  }

  pub fn status(&self) -> QueryStatus {
    self.receiver.borrow().status
  }

  /// Get the data, if any has been fetched. Kept while refetching and after
  /// a failed refetch.
  pub fn data(&self) -> Option<D> {
    self.receiver.borrow().data.clone()
  }

  pub fn error(&self) -> Option<SyncError> {
    self.receiver.borrow().error.clone()
  }

  pub fn is_loading(&self) -> bool {
    self.status() == QueryStatus::Loading
  }

  /// Check for a change without blocking.
  ///
  /// Returns `true` if the state changed since the last `poll` or `changed`.
  /// Call this in your event loop tick handler.
  pub fn poll(&mut self) -> bool {
    match self.receiver.has_changed() {
      Ok(true) => {
        self.receiver.borrow_and_update();
        true
      }
      _ => false,
    }
  }

  /// Wait for the next change. Returns `None` once the entry is gone.
  pub async fn changed(&mut self) -> Option<QuerySnapshot<D>> {
    self.receiver.changed().await.ok()?;
    Some(self.receiver.borrow_and_update().clone())
  }

  /// Wait until the current fetch (if any) has finished.
  pub async fn settled(&mut self) -> QuerySnapshot<D> {
    loop {
      let snapshot = self.receiver.borrow_and_update().clone();
      if snapshot.is_settled() {
        return snapshot;
      }
      if self.receiver.changed().await.is_err() {
        return self.receiver.borrow().clone();
      }
    }
  }

  /// Force a refetch with the arguments of the last fetch.
  ///
  /// This is a no-op if a fetch is already in flight.
  pub fn refetch(&self) -> bool {
    self.layer.refetch(&self.signature)
  }
}

impl<D: Payload> Drop for Subscription<D> {
  fn drop(&mut self) {
    self.layer.release(&self.signature);
  }
}

impl<D: Payload> std::fmt::Debug for Subscription<D> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("signature", &self.signature)
      .field("snapshot", &*self.receiver.borrow())
      .finish_non_exhaustive()
  }
}
