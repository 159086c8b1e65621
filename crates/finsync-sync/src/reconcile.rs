//! # Reconciler
//!
//! Applies a batch of remote records for one entity type to the local store.
//!
//! ## Reconcile Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         reconcile::<Bill>(batch)                        │
//! │                                                                         │
//! │  1. decode each record ──► failures counted as `rejected`               │
//! │     sort by key (stable), duplicates keep the later occurrence          │
//! │                                                                         │
//! │  2. WRITE scope "bill"  (type lock + one SQLite transaction)            │
//! │     fetch local records in scope, key ascending                         │
//! │                                                                         │
//! │  3. merge-join                                                          │
//! │        local [1, 3, 5]       batch [1, 2, 3]                            │
//! │        1 = 1  → update if body differs, else unchanged                  │
//! │        2      → insert (or update if key lives outside the scope)       │
//! │        3 = 3  → update if body differs, else unchanged                  │
//! │        5      → delete, unless authority is Partial                     │
//! │                                                                         │
//! │  4. write inserts / updates / deletes                                   │
//! │  5. link written records to parents and children                        │
//! │  6. commit ──► change notice "bill" (+ linked types)                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Any store error drops the write scope, which rolls the whole batch back.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use finsync_core::{
    DecodeError, Entity, Filter, PrimaryKey, QuerySpec, ReconcileReport, Sort,
};
use finsync_db::{Database, DbError, LinkRepository, RecordRepository, StoredRecord, WriteScope};

use crate::error::{SyncError, SyncResult};
use crate::linker::{LinkRecord, RelationshipLinker};
use crate::transport::DecodedBatch;

/// Maximum number of keys bound into one `KeyIn` lookup.
const KEY_CHUNK_SIZE: usize = 500;

// =============================================================================
// Batch and Authority
// =============================================================================

/// Raw remote records of one entity type.
#[derive(Debug, Clone, Default)]
pub struct RemoteBatch {
    pub records: Vec<Value>,
    /// Records the decoder already gave up on.
    pub errors: Vec<DecodeError>,
}

impl RemoteBatch {
    pub fn new(records: Vec<Value>) -> Self {
        RemoteBatch {
            records,
            errors: Vec::new(),
        }
    }

    /// Builds a batch from typed records.
    pub fn from_records<T: Entity>(records: &[T]) -> SyncResult<Self> {
        let records = records
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SyncError::Internal(format!("Failed to encode record: {}", e)))?;
        Ok(RemoteBatch::new(records))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl From<DecodedBatch> for RemoteBatch {
    fn from(batch: DecodedBatch) -> Self {
        RemoteBatch {
            records: batch.records,
            errors: batch.errors,
        }
    }
}

/// How much of the local store a batch speaks for.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Authority {
    /// The batch is a subset; nothing is deleted.
    #[default]
    Partial,
    /// The batch is everything matching the filter.
    Scoped(Filter),
    /// The batch is everything of this type.
    Complete,
}

impl Authority {
    /// `None` means `Partial`.
    pub fn from_scope(scope: Option<Filter>) -> Self {
        match scope {
            Some(filter) => Authority::Scoped(filter),
            None => Authority::Partial,
        }
    }

    /// Returns true if unmatched local records are deleted.
    pub fn deletes(&self) -> bool {
        !matches!(self, Authority::Partial)
    }

    fn label(&self) -> &'static str {
        match self {
            Authority::Partial => "partial",
            Authority::Scoped(_) => "scoped",
            Authority::Complete => "complete",
        }
    }
}

// =============================================================================
// Merge Plan
// =============================================================================

/// One decoded, normalized remote record.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Incoming {
    pub key: PrimaryKey,
    pub body: Value,
}

/// What the merge-join decided.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct MergePlan {
    pub inserts: Vec<Incoming>,
    pub updates: Vec<Incoming>,
    pub unchanged: usize,
    pub deletes: Vec<PrimaryKey>,
}

/// Sorts by key and keeps the last occurrence of each key.
pub(crate) fn dedup_last(mut items: Vec<Incoming>) -> Vec<Incoming> {
    items.sort_by_key(|item| item.key);

    let mut out: Vec<Incoming> = Vec::with_capacity(items.len());
    for item in items {
        match out.last_mut() {
            Some(last) if last.key == item.key => *last = item,
            _ => out.push(item),
        }
    }
    out
}

/// Merge-joins key-sorted local records with key-sorted, deduplicated
/// incoming records.
pub(crate) fn merge_plan(local: Vec<(PrimaryKey, Value)>, incoming: Vec<Incoming>) -> MergePlan {
    let mut plan = MergePlan::default();
    let mut local = local.into_iter().peekable();

    for item in incoming {
        while let Some((stale, _)) = local.next_if(|(key, _)| *key < item.key) {
            plan.deletes.push(stale);
        }

        match local.next_if(|(key, _)| *key == item.key) {
            Some((_, body)) if body == item.body => plan.unchanged += 1,
            Some(_) => plan.updates.push(item),
            None => plan.inserts.push(item),
        }
    }

    plan.deletes.extend(local.map(|(key, _)| key));
    plan
}

// =============================================================================
// Reconciler
// =============================================================================

/// Reconciles remote batches into the entity store.
#[derive(Debug, Clone)]
pub struct Reconciler {
    db: Database,
    linker: Arc<RelationshipLinker>,
}

impl Reconciler {
    pub fn new(db: Database, linker: Arc<RelationshipLinker>) -> Self {
        Reconciler { db, linker }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn linker(&self) -> &RelationshipLinker {
        &self.linker
    }

    /// Reconciles `batch`; an unscoped batch never deletes.
    pub async fn reconcile<T: Entity>(
        &self,
        batch: RemoteBatch,
        scope: Option<Filter>,
    ) -> SyncResult<ReconcileReport> {
        self.reconcile_with::<T>(batch, Authority::from_scope(scope))
            .await
    }

    /// Reconciles `batch` under an explicit authority.
    pub async fn reconcile_with<T: Entity>(
        &self,
        batch: RemoteBatch,
        authority: Authority,
    ) -> SyncResult<ReconcileReport> {
        let entity_type = T::ENTITY_TYPE;
        if let Authority::Scoped(filter) = &authority {
            filter.validate().map_err(DbError::from)?;
        }

        let mut report = ReconcileReport::new(entity_type);
        let incoming = dedup_last(decode_batch::<T>(batch, &mut report));

        let mut scope = self.db.begin_write(entity_type).await?;

        // Step 2: local records in scope.
        let local = {
            let mut records = RecordRepository::new(scope.conn());
            let stored = match &authority {
                Authority::Partial => {
                    let keys: Vec<PrimaryKey> = incoming.iter().map(|i| i.key).collect();
                    fetch_by_keys(&mut records, entity_type, &keys).await?
                }
                Authority::Scoped(filter) => {
                    let spec = QuerySpec::new().filter(filter.clone()).sort(Sort::by_key());
                    records.fetch(entity_type, &spec).await?
                }
                Authority::Complete => {
                    records
                        .fetch(entity_type, &QuerySpec::new().sort(Sort::by_key()))
                        .await?
                }
            };
            to_pairs(stored)?
        };

        // Step 3: merge-join.
        let mut plan = merge_plan(local, incoming);

        if let Authority::Scoped(_) = &authority {
            if !plan.inserts.is_empty() {
                let keys: Vec<PrimaryKey> = plan.inserts.iter().map(|i| i.key).collect();
                let mut records = RecordRepository::new(scope.conn());
                let outside: HashMap<PrimaryKey, Value> =
                    to_pairs(fetch_by_keys(&mut records, entity_type, &keys).await?)?
                        .into_iter()
                        .collect();
                reclassify_moved(&mut plan, &outside);
            }
        }

        if !authority.deletes() {
            plan.deletes.clear();
        }

        // Step 4: writes.
        let now = Utc::now();
        {
            let mut records = RecordRepository::new(scope.conn());
            for item in plan.inserts.iter().chain(plan.updates.iter()) {
                let body = serde_json::to_string(&item.body).map_err(DbError::from)?;
                records.upsert(entity_type, item.key, &body, now).await?;
            }
            for key in &plan.deletes {
                records.delete(entity_type, *key).await?;
            }
        }

        report.inserted = plan.inserts.iter().map(|i| i.key).collect();
        report.updated = plan.updates.iter().map(|i| i.key).collect();
        report.unchanged = plan.unchanged;
        report.deleted = plan.deletes.clone();

        // Step 5: relationship slots.
        let written: Vec<LinkRecord> = plan
            .inserts
            .into_iter()
            .chain(plan.updates)
            .map(|i| LinkRecord::new(i.key, i.body))
            .collect();

        let mut changed: Vec<&'static str> = vec![entity_type];
        if !written.is_empty() && !self.linker.is_empty() {
            let (links_changed, linked_types) = self
                .link_written(&mut scope, entity_type, &written)
                .await?;
            report.links_changed = links_changed;
            changed.extend(linked_types);
        }

        // Step 6: commit.
        if report.has_changes() || report.links_changed > 0 {
            scope.commit(&changed).await?;
        } else {
            scope.commit(&[]).await?;
        }

        info!(
            entity_type,
            authority = authority.label(),
            inserted = report.inserted_count(),
            updated = report.updated_count(),
            unchanged = report.unchanged,
            deleted = report.deleted_count(),
            rejected = report.rejected,
            links_changed = report.links_changed,
            "Reconciled batch"
        );

        Ok(report)
    }

    /// Reconciles typed records.
    pub async fn reconcile_records<T: Entity>(
        &self,
        records: &[T],
        authority: Authority,
    ) -> SyncResult<ReconcileReport> {
        let batch = RemoteBatch::from_records(records)?;
        self.reconcile_with::<T>(batch, authority).await
    }

    /// Recomputes relationship slots for freshly written records.
    ///
    /// Other entity types are read through the open transaction without
    /// taking their type locks. Link functions are opaque predicates, so
    /// every cached record of a linked type is a candidate: the cost is one
    /// scan per linked type plus `written × cached` predicate calls. Only
    /// written records are paired, never the whole of their own type.
    async fn link_written(
        &self,
        scope: &mut WriteScope,
        entity_type: &'static str,
        written: &[LinkRecord],
    ) -> SyncResult<(usize, Vec<&'static str>)> {
        let mut links_changed = 0;
        let mut linked_types = Vec::new();

        // Written records as parents.
        for child_type in self.linker.child_types_of(entity_type) {
            let children = fetch_all(scope, child_type).await?;
            let Some(pairs) = self.linker.pairs(entity_type, child_type, written, &children) else {
                continue;
            };

            let mut changed_here = 0;
            let mut links = LinkRepository::new(scope.conn());
            for (parent_key, child_keys) in RelationshipLinker::children_by_parent(written, &pairs) {
                changed_here += links
                    .replace_children(entity_type, parent_key, child_type, &child_keys)
                    .await?;
            }

            debug!(
                parent_type = entity_type,
                child_type,
                changed = changed_here,
                "Linked children"
            );
            if changed_here > 0 {
                links_changed += changed_here;
                linked_types.push(child_type);
            }
        }

        // Written records as children.
        for parent_type in self.linker.parent_types_of(entity_type) {
            let parents = fetch_all(scope, parent_type).await?;
            let Some(pairs) = self.linker.pairs(parent_type, entity_type, &parents, written) else {
                continue;
            };

            let mut changed_here = 0;
            let mut links = LinkRepository::new(scope.conn());
            for (child_key, parent_keys) in RelationshipLinker::parents_by_child(written, &pairs) {
                changed_here += links
                    .replace_parents(entity_type, child_key, parent_type, &parent_keys)
                    .await?;
            }

            debug!(
                parent_type,
                child_type = entity_type,
                changed = changed_here,
                "Linked parents"
            );
            if changed_here > 0 {
                links_changed += changed_here;
                linked_types.push(parent_type);
            }
        }

        linked_types.sort_unstable();
        linked_types.dedup();
        linked_types.retain(|t| *t != entity_type);
        Ok((links_changed, linked_types))
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Decodes and normalizes each raw record, counting failures.
fn decode_batch<T: Entity>(batch: RemoteBatch, report: &mut ReconcileReport) -> Vec<Incoming> {
    report.rejected += batch.errors.len();
    for error in &batch.errors {
        warn!(entity_type = T::ENTITY_TYPE, %error, "Record rejected by decoder");
    }

    let mut incoming = Vec::with_capacity(batch.records.len());
    for (index, raw) in batch.records.into_iter().enumerate() {
        let record = match serde_json::from_value::<T>(raw) {
            Ok(record) => record,
            Err(e) => {
                warn!(entity_type = T::ENTITY_TYPE, index, error = %e, "Rejected remote record");
                report.rejected += 1;
                continue;
            }
        };

        match serde_json::to_value(&record) {
            Ok(body) => incoming.push(Incoming {
                key: record.primary_key(),
                body,
            }),
            Err(e) => {
                warn!(entity_type = T::ENTITY_TYPE, index, error = %e, "Rejected remote record");
                report.rejected += 1;
            }
        }
    }
    incoming
}

/// Moves inserts whose key already exists (outside the scope) to updates
/// or unchanged.
fn reclassify_moved(plan: &mut MergePlan, existing: &HashMap<PrimaryKey, Value>) {
    let inserts = std::mem::take(&mut plan.inserts);
    for item in inserts {
        match existing.get(&item.key) {
            None => plan.inserts.push(item),
            Some(body) if *body == item.body => plan.unchanged += 1,
            Some(_) => plan.updates.push(item),
        }
    }
    plan.updates.sort_by_key(|i| i.key);
}

async fn fetch_by_keys(
    records: &mut RecordRepository<'_>,
    entity_type: &str,
    keys: &[PrimaryKey],
) -> SyncResult<Vec<StoredRecord>> {
    let mut stored = Vec::new();
    for chunk in keys.chunks(KEY_CHUNK_SIZE) {
        let spec = QuerySpec::new()
            .filter(Filter::keys(chunk.iter().copied()))
            .sort(Sort::by_key());
        stored.extend(records.fetch(entity_type, &spec).await?);
    }
    stored.sort_by_key(|r| r.primary_key);
    Ok(stored)
}

async fn fetch_all(
    scope: &mut WriteScope,
    entity_type: &str,
) -> SyncResult<Vec<LinkRecord>> {
    let stored = RecordRepository::new(scope.conn())
        .fetch(entity_type, &QuerySpec::new().sort(Sort::by_key()))
        .await?;

    Ok(to_pairs(stored)?
        .into_iter()
        .map(|(key, body)| LinkRecord::new(key, body))
        .collect())
}

fn to_pairs(stored: Vec<StoredRecord>) -> SyncResult<Vec<(PrimaryKey, Value)>> {
    stored
        .into_iter()
        .map(|row| -> SyncResult<(PrimaryKey, Value)> { Ok((row.primary_key, row.value()?)) })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn item(key: PrimaryKey, v: i64) -> Incoming {
        Incoming {
            key,
            body: json!({"id": key, "v": v}),
        }
    }

    #[test]
    fn test_merge_plan() {
        let local = vec![
            (1, json!({"id": 1, "v": 0})),
            (3, json!({"id": 3, "v": 0})),
            (5, json!({"id": 5, "v": 0})),
        ];
        let incoming = vec![item(1, 1), item(2, 1), item(3, 0)];

        let plan = merge_plan(local, incoming);

        assert_eq!(plan.inserts, vec![item(2, 1)]);
        assert_eq!(plan.updates, vec![item(1, 1)]);
        assert_eq!(plan.unchanged, 1);
        assert_eq!(plan.deletes, vec![5]);
    }

    #[test]
    fn test_merge_plan_deletes_leading_and_trailing() {
        let local = vec![(1, json!({})), (4, json!({})), (9, json!({}))];
        let plan = merge_plan(local, vec![item(4, 1)]);

        assert_eq!(plan.deletes, vec![1, 9]);
        assert_eq!(plan.updates.len(), 1);
    }

    #[test]
    fn test_dedup_keeps_last_occurrence() {
        let items = vec![item(7, 1), item(2, 1), item(7, 2), item(7, 3)];
        let deduped = dedup_last(items);

        assert_eq!(deduped, vec![item(2, 1), item(7, 3)]);
    }

    #[test]
    fn test_reclassify_moved() {
        let mut plan = MergePlan {
            inserts: vec![item(2, 1), item(4, 1), item(6, 1)],
            ..MergePlan::default()
        };
        let existing: HashMap<PrimaryKey, Value> = [
            (4, json!({"id": 4, "v": 0})),
            (6, json!({"id": 6, "v": 1})),
        ]
        .into_iter()
        .collect();

        reclassify_moved(&mut plan, &existing);

        assert_eq!(plan.inserts, vec![item(2, 1)]);
        assert_eq!(plan.updates, vec![item(4, 1)]);
        assert_eq!(plan.unchanged, 1);
    }

    #[test]
    fn test_authority_from_scope() {
        assert_eq!(Authority::from_scope(None), Authority::Partial);
        assert!(!Authority::Partial.deletes());
        assert!(Authority::from_scope(Some(Filter::All)).deletes());
        assert!(Authority::Complete.deletes());
    }
}
