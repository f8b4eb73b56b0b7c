//! Client-side cache synchronization layer.
//!
//! This module provides a backend-agnostic query cache that:
//! - Keys results by endpoint plus a declared projection of the call arguments
//! - Tracks which invalidation tags each result provides
//! - Refetches subscribed results when their tags are invalidated
//! - Applies optimistic patches for mutations and rolls them back on failure
//! - Merges paginated feed pages without duplicating records

mod definition;
mod entities;
mod layer;
mod merge;
mod mutation;
mod signature;
mod storage;
mod tags;
mod traits;

pub use definition::{BoxFuture, MutationDefinition, PatchRequest, QueryDefinition};
pub use entities::{EntityStatus, EntityStore, StoredEntity};
pub use layer::{CacheDiagnostics, CacheLayer};
pub use merge::{merge_records, FeedRecord};
pub use mutation::{MutationPhase, OptimisticPatch};
pub use signature::{pick, KeyProjection, QuerySignature};
pub use storage::{CacheEntry, QueryCache};
pub use tags::{Tag, TagId, TagIndex};
pub use traits::{Cacheable, EntityRecord, Payload, QuerySnapshot, QueryStatus};
