//! # Live Queries
//!
//! A query that re-runs whenever its entity type changes and reports what
//! moved in the result list.
//!
//! ## Event Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  WriteScope::commit(&["bill"])                                          │
//! │       │                                                                 │
//! │       ▼  broadcast ChangeNotice { entity_type: "bill" }                 │
//! │  LiveQuery<Bill>::next_change()                                         │
//! │       │  other type?  → keep waiting                                   │
//! │       │  lagged?      → re-evaluate anyway                             │
//! │       ▼                                                                 │
//! │  re-run QuerySpec ──► diff(old snapshot, new snapshot)                  │
//! │       │  empty diff?  → keep waiting                                   │
//! │       ▼                                                                 │
//! │  LiveQueryEvent { records, changes: [Removed(2), Inserted(0), ...] }    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `Removed` indices refer to the previous snapshot; `Inserted` and
//! `Updated` indices refer to the new one. A record whose position moved
//! but whose body did not change produces no event.

use std::collections::HashMap;

use futures_util::stream::{self, Stream};
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use finsync_core::{Entity, PrimaryKey, QuerySpec};

use crate::error::DbResult;
use crate::pool::ChangeNotice;
use crate::store::EntityStore;

/// One row of a live query snapshot.
#[derive(Debug, Clone)]
pub(crate) struct SnapshotRow<T> {
    pub key: PrimaryKey,
    pub body: Value,
    pub record: T,
}

/// Position-level change between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowChange {
    /// Index in the new snapshot.
    Inserted(usize),
    /// Index in the previous snapshot.
    Removed(usize),
    /// Index in the new snapshot.
    Updated(usize),
}

/// Emitted when a re-evaluated live query differs from its last snapshot.
#[derive(Debug, Clone)]
pub struct LiveQueryEvent<T> {
    /// The full new result list.
    pub records: Vec<T>,
    /// Removed first, then inserted, then updated; each ascending.
    pub changes: Vec<RowChange>,
}

/// Computes the changes turning `old` into `new`, matching rows by key.
pub fn diff(old: &[(PrimaryKey, &Value)], new: &[(PrimaryKey, &Value)]) -> Vec<RowChange> {
    let old_by_key: HashMap<PrimaryKey, &Value> = old.iter().map(|(k, v)| (*k, *v)).collect();
    let new_keys: HashMap<PrimaryKey, ()> = new.iter().map(|(k, _)| (*k, ())).collect();

    let mut changes: Vec<RowChange> = old
        .iter()
        .enumerate()
        .filter(|(_, (key, _))| !new_keys.contains_key(key))
        .map(|(i, _)| RowChange::Removed(i))
        .collect();

    let mut updated = Vec::new();
    for (i, (key, body)) in new.iter().enumerate() {
        match old_by_key.get(key) {
            None => changes.push(RowChange::Inserted(i)),
            Some(previous) if *previous != *body => updated.push(RowChange::Updated(i)),
            Some(_) => {}
        }
    }

    changes.extend(updated);
    changes
}

/// A subscription to the results of one query.
pub struct LiveQuery<T: Entity> {
    store: EntityStore<T>,
    spec: QuerySpec,
    receiver: broadcast::Receiver<ChangeNotice>,
    snapshot: Vec<SnapshotRow<T>>,
}

impl<T: Entity> std::fmt::Debug for LiveQuery<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveQuery")
            .field("entity_type", &T::ENTITY_TYPE)
            .field("spec", &self.spec)
            .field("rows", &self.snapshot.len())
            .finish()
    }
}

impl<T: Entity> LiveQuery<T> {
    pub(crate) fn new(
        store: EntityStore<T>,
        spec: QuerySpec,
        receiver: broadcast::Receiver<ChangeNotice>,
        snapshot: Vec<SnapshotRow<T>>,
    ) -> Self {
        LiveQuery {
            store,
            spec,
            receiver,
            snapshot,
        }
    }

    pub fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    /// The records of the latest snapshot.
    pub fn current(&self) -> Vec<T> {
        self.snapshot.iter().map(|r| r.record.clone()).collect()
    }

    /// Waits for the next change to this query's results.
    ///
    /// Returns `Ok(None)` once the database has been dropped.
    pub async fn next_change(&mut self) -> DbResult<Option<LiveQueryEvent<T>>> {
        loop {
            match self.receiver.recv().await {
                Ok(notice) if notice.entity_type != T::ENTITY_TYPE => continue,
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        entity_type = T::ENTITY_TYPE,
                        skipped, "Live query lagged, re-evaluating"
                    );
                }
                Err(RecvError::Closed) => return Ok(None),
            }

            let rows = self.store.query_rows(&self.spec).await?;
            let changes = {
                let old: Vec<(PrimaryKey, &Value)> =
                    self.snapshot.iter().map(|r| (r.key, &r.body)).collect();
                let new: Vec<(PrimaryKey, &Value)> = rows.iter().map(|r| (r.key, &r.body)).collect();
                diff(&old, &new)
            };
            self.snapshot = rows;

            if changes.is_empty() {
                continue;
            }

            debug!(
                entity_type = T::ENTITY_TYPE,
                changes = changes.len(),
                "Live query changed"
            );
            return Ok(Some(LiveQueryEvent {
                records: self.current(),
                changes,
            }));
        }
    }

    /// Converts the live query into a stream of change events.
    pub fn into_stream(self) -> impl Stream<Item = DbResult<LiveQueryEvent<T>>> {
        stream::unfold(self, |mut query| async move {
            match query.next_change().await {
                Ok(Some(event)) => Some((Ok(event), query)),
                Ok(None) => None,
                Err(e) => Some((Err(e), query)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_diff_reports_each_kind() {
        let a = json!({"v": 1});
        let b = json!({"v": 2});
        let c = json!({"v": 3});
        let b2 = json!({"v": 20});
        let d = json!({"v": 4});

        let old = vec![(1, &a), (2, &b), (3, &c)];
        let new = vec![(2, &b2), (3, &c), (4, &d)];

        assert_eq!(
            diff(&old, &new),
            vec![
                RowChange::Removed(0),
                RowChange::Inserted(2),
                RowChange::Updated(0),
            ]
        );
    }

    #[test]
    fn test_diff_ignores_reordering() {
        let a = json!({"v": 1});
        let b = json!({"v": 2});

        let old = vec![(1, &a), (2, &b)];
        let new = vec![(2, &b), (1, &a)];

        assert!(diff(&old, &new).is_empty());
    }
}
