//! # Entity Store
//!
//! Typed access to one entity type in the shared `records` table.
//!
//! ```text
//! db.store::<Bill>()
//!     │
//!     ├── get(7)                 READ lock "bill" → SELECT … WHERE key = 7
//!     ├── query(&spec)           READ lock "bill" → filtered / sorted / limited
//!     ├── count(&filter)         READ lock "bill"
//!     ├── children::<Payment>(7) READ locks "bill" + "payment" → linked rows
//!     ├── upsert(&bill)          WRITE scope "bill" → notice "bill"
//!     ├── delete(7)              WRITE scope "bill" → notice "bill"
//!     └── subscribe(spec)        LiveQuery<Bill>
//! ```
//!
//! Reads wait for an in-progress reconciliation of the same type, so they
//! see the store either before or after a batch, never in between.
//! Direct `upsert`/`delete` bypass relationship linking.

use std::fmt;
use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use tracing::debug;

use finsync_core::{Entity, Filter, PrimaryKey, QuerySpec};

use crate::error::DbResult;
use crate::live::{LiveQuery, SnapshotRow};
use crate::pool::Database;
use crate::repository::records::RecordRepository;

/// Typed store for entity type `T`.
pub struct EntityStore<T: Entity> {
    db: Database,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> Clone for EntityStore<T> {
    fn clone(&self) -> Self {
        EntityStore {
            db: self.db.clone(),
            _entity: PhantomData,
        }
    }
}

impl<T: Entity> fmt::Debug for EntityStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityStore")
            .field("entity_type", &T::ENTITY_TYPE)
            .finish()
    }
}

impl<T: Entity> EntityStore<T> {
    pub fn new(db: Database) -> Self {
        EntityStore {
            db,
            _entity: PhantomData,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Fetches one record by primary key.
    pub async fn get(&self, key: PrimaryKey) -> DbResult<Option<T>> {
        let _guard = self.db.locks().read(T::ENTITY_TYPE).await;
        let mut conn = self.db.pool().acquire().await?;

        let row = RecordRepository::new(&mut *conn)
            .fetch_one(T::ENTITY_TYPE, key)
            .await?;

        row.map(|r| r.decode::<T>()).transpose()
    }

    /// Fetches records matching `spec`.
    pub async fn query(&self, spec: &QuerySpec) -> DbResult<Vec<T>> {
        let rows = self.query_rows(spec).await?;
        Ok(rows.into_iter().map(|r| r.record).collect())
    }

    pub(crate) async fn query_rows(&self, spec: &QuerySpec) -> DbResult<Vec<SnapshotRow<T>>> {
        let _guard = self.db.locks().read(T::ENTITY_TYPE).await;
        let mut conn = self.db.pool().acquire().await?;

        let stored = RecordRepository::new(&mut *conn)
            .fetch(T::ENTITY_TYPE, spec)
            .await?;

        stored
            .into_iter()
            .map(|row| {
                Ok(SnapshotRow {
                    key: row.primary_key,
                    body: row.value()?,
                    record: row.decode::<T>()?,
                })
            })
            .collect()
    }

    /// Counts records matching `filter`.
    pub async fn count(&self, filter: &Filter) -> DbResult<u64> {
        let _guard = self.db.locks().read(T::ENTITY_TYPE).await;
        let mut conn = self.db.pool().acquire().await?;

        let count = RecordRepository::new(&mut *conn)
            .count(T::ENTITY_TYPE, filter)
            .await?;

        Ok(count.max(0) as u64)
    }

    /// Inserts or replaces one record.
    pub async fn upsert(&self, record: &T) -> DbResult<()> {
        let body = serde_json::to_string(record)?;
        let key = record.primary_key();

        let mut scope = self.db.begin_write(T::ENTITY_TYPE).await?;
        RecordRepository::new(scope.conn())
            .upsert(T::ENTITY_TYPE, key, &body, Utc::now())
            .await?;
        scope.commit(&[T::ENTITY_TYPE]).await?;

        debug!(entity_type = T::ENTITY_TYPE, key, "Upserted record");
        Ok(())
    }

    /// Deletes one record and its relationship links.
    ///
    /// Returns false if no such record existed.
    pub async fn delete(&self, key: PrimaryKey) -> DbResult<bool> {
        let mut scope = self.db.begin_write(T::ENTITY_TYPE).await?;
        let deleted = RecordRepository::new(scope.conn())
            .delete(T::ENTITY_TYPE, key)
            .await?;

        if deleted {
            scope.commit(&[T::ENTITY_TYPE]).await?;
            debug!(entity_type = T::ENTITY_TYPE, key, "Deleted record");
        }
        Ok(deleted)
    }

    /// Records of type `C` attached to the parent `parent_key`.
    pub async fn children<C: Entity>(&self, parent_key: PrimaryKey) -> DbResult<Vec<C>> {
        let _guards = self
            .db
            .locks()
            .read_many(&[T::ENTITY_TYPE, C::ENTITY_TYPE])
            .await;
        let mut conn = self.db.pool().acquire().await?;

        let rows = RecordRepository::new(&mut *conn)
            .fetch_children(T::ENTITY_TYPE, parent_key, C::ENTITY_TYPE)
            .await?;

        rows.iter().map(|r| r.decode::<C>()).collect()
    }

    /// Starts a live query over `spec`.
    ///
    /// The subscription is registered before the initial snapshot is read,
    /// so no committed change can fall between the two.
    pub async fn subscribe(&self, spec: QuerySpec) -> DbResult<LiveQuery<T>> {
        spec.validate()?;

        let receiver = self.db.subscribe_changes();
        let snapshot = self.query_rows(&spec).await?;

        Ok(LiveQuery::new(self.clone(), spec, receiver, snapshot))
    }

    /// When this entity type was last written.
    pub async fn last_written(&self) -> DbResult<Option<DateTime<Utc>>> {
        self.db.last_written(T::ENTITY_TYPE).await
    }
}
