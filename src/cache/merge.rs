//! Merge engine for paginated feeds.
//!
//! Merging keys records by reference id, lets incoming records replace cached
//! ones with the same id, and orders the result by creation time. Merging the
//! same page twice gives the same feed as merging it once.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

/// A record that can live in a merged feed.
pub trait FeedRecord: Clone {
  /// Unique, stable across pages
  fn reference_id(&self) -> &str;

  fn created_at(&self) -> DateTime<Utc>;

  /// Record this one replies to or hangs under, if any.
  fn parent_reference_id(&self) -> Option<&str> {
    None
  }
}

/// Merge `incoming` into `existing`.
///
/// Records are sorted ascending by `created_at`; ties keep first-seen order
/// (existing records first, then new incoming ones). A record whose parent is
/// in the feed is placed after that parent.
pub fn merge_records<R: FeedRecord>(existing: &[R], incoming: &[R]) -> Vec<R> {
  let mut records: Vec<R> = Vec::with_capacity(existing.len() + incoming.len());
  let mut positions: HashMap<String, usize> = HashMap::new();

  for record in existing.iter().chain(incoming) {
    match positions.get(record.reference_id()) {
      Some(&position) => records[position] = record.clone(),
      None => {
        positions.insert(record.reference_id().to_string(), records.len());
        records.push(record.clone());
      }
    }
  }

  // stable: equal timestamps stay in first-seen order
  records.sort_by_key(|record| record.created_at());
  attach_children(records)
}

/// Move records after their parent when the parent is present in the feed.
fn attach_children<R: FeedRecord>(sorted: Vec<R>) -> Vec<R> {
  let present: HashSet<String> = sorted
    .iter()
    .map(|record| record.reference_id().to_string())
    .collect();

  let mut out = Vec::with_capacity(sorted.len());
  let mut emitted: HashSet<String> = HashSet::new();
  let mut waiting: HashMap<String, Vec<(usize, R)>> = HashMap::new();

  for (position, record) in sorted.into_iter().enumerate() {
    let parent = record
      .parent_reference_id()
      .filter(|parent| *parent != record.reference_id())
      .filter(|parent| present.contains(*parent) && !emitted.contains(*parent))
      .map(String::from);

    match parent {
      Some(parent) => waiting.entry(parent).or_default().push((position, record)),
      None => emit(record, &mut out, &mut emitted, &mut waiting),
    }
  }

  // parent cycles: whatever is still waiting goes out in sorted order
  let mut leftover: Vec<(usize, R)> = waiting.drain().flat_map(|(_, records)| records).collect();
  leftover.sort_by_key(|(position, _)| *position);
  for (_, record) in leftover {
    if !emitted.contains(record.reference_id()) {
      emit(record, &mut out, &mut emitted, &mut waiting);
    }
  }

  out
}

fn emit<R: FeedRecord>(
  record: R,
  out: &mut Vec<R>,
  emitted: &mut HashSet<String>,
  waiting: &mut HashMap<String, Vec<(usize, R)>>,
) {
  let id = record.reference_id().to_string();
  out.push(record);
  emitted.insert(id.clone());

  if let Some(children) = waiting.remove(&id) {
    for (_, child) in children {
      emit(child, out, emitted, waiting);
    }
  }
}
