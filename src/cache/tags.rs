//! Invalidation tags and the index from tags to the queries that provide them.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

use super::signature::QuerySignature;

/// Identifier part of a tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TagId {
  /// A single entity, e.g. `bundle/2024.1`.
  Item(String),
  /// The collection as a whole. Invalidate this when membership may change.
  List,
}

/// Coarse invalidation topic attached to cached query results.
///
/// A tag without an id is type-wide: invalidating `project` hits every query
/// that provides any `project/...` tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
  pub kind: String,
  pub id: Option<TagId>,
}

impl Tag {
  /// Type-wide tag.
  pub fn of_kind(kind: impl Into<String>) -> Self {
    Self {
      kind: kind.into(),
      id: None,
    }
  }

  pub fn item(kind: impl Into<String>, id: impl Into<String>) -> Self {
    Self {
      kind: kind.into(),
      id: Some(TagId::Item(id.into())),
    }
  }

  pub fn list(kind: impl Into<String>) -> Self {
    Self {
      kind: kind.into(),
      id: Some(TagId::List),
    }
  }

  /// Whether invalidating `self` affects a query that provided `provided`.
  pub fn matches(&self, provided: &Tag) -> bool {
    self.kind == provided.kind && (self.id.is_none() || self.id == provided.id)
  }
}

impl fmt::Display for Tag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.id {
      None => write!(f, "{}", self.kind),
      Some(TagId::List) => write!(f, "{}/LIST", self.kind),
      Some(TagId::Item(id)) => write!(f, "{}/{}", self.kind, id),
    }
  }
}

/// Index from provided tags to query signatures.
///
/// Always mirrors the last successful write per signature: registering a new
/// tag set removes every association of the previous one.
#[derive(Debug, Default)]
pub struct TagIndex {
  by_tag: HashMap<String, HashMap<Option<TagId>, HashSet<QuerySignature>>>,
  by_signature: HashMap<QuerySignature, HashSet<Tag>>,
}

impl TagIndex {
  pub fn new() -> Self {
    Self::default()
  }

  /// Replace the tags provided by `signature`.
  pub fn register(&mut self, signature: &QuerySignature, tags: impl IntoIterator<Item = Tag>) {
    self.remove(signature);

    let tags: HashSet<Tag> = tags.into_iter().collect();
    for tag in &tags {
      self
        .by_tag
        .entry(tag.kind.clone())
        .or_default()
        .entry(tag.id.clone())
        .or_default()
        .insert(signature.clone());
    }
    if !tags.is_empty() {
      self.by_signature.insert(signature.clone(), tags);
    }
  }

  /// Drop every association of `signature`.
  pub fn remove(&mut self, signature: &QuerySignature) {
    let Some(old) = self.by_signature.remove(signature) else {
      return;
    };

    for tag in old {
      if let Some(ids) = self.by_tag.get_mut(&tag.kind) {
        if let Some(signatures) = ids.get_mut(&tag.id) {
          signatures.remove(signature);
          if signatures.is_empty() {
            ids.remove(&tag.id);
          }
        }
        if ids.is_empty() {
          self.by_tag.remove(&tag.kind);
        }
      }
    }
  }

  /// Signatures affected by invalidating `tag`.
  pub fn lookup(&self, tag: &Tag) -> HashSet<QuerySignature> {
    let Some(ids) = self.by_tag.get(&tag.kind) else {
      return HashSet::new();
    };

    match &tag.id {
      None => ids.values().flatten().cloned().collect(),
      id => ids.get(id).cloned().unwrap_or_default(),
    }
  }

  /// Tags currently registered for `signature`.
  pub fn tags_for(&self, signature: &QuerySignature) -> Option<&HashSet<Tag>> {
    self.by_signature.get(signature)
  }

  /// Number of signatures with at least one tag.
  pub fn len(&self) -> usize {
    self.by_signature.len()
  }

  pub fn is_empty(&self) -> bool {
    self.by_signature.is_empty()
  }
}
