//! # Link Repository
//!
//! Relationship slots in the `record_links` table.
//!
//! ```text
//! (parent_type, parent_key, child_type)  ──►  { child_key, child_key, ... }
//!  ("account",  42,         "bill")      ──►  { 7, 9, 13 }
//! ```
//!
//! A slot is rewritten from the parent side when a parent is written and
//! per-membership from the child side when a child is written.

use std::collections::BTreeSet;

use sqlx::sqlite::SqliteConnection;

use finsync_core::PrimaryKey;

use crate::error::DbResult;

/// Link primitives over a borrowed connection.
pub struct LinkRepository<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> LinkRepository<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        LinkRepository { conn }
    }

    /// Child keys in one slot, ascending.
    pub async fn children(
        &mut self,
        parent_type: &str,
        parent_key: PrimaryKey,
        child_type: &str,
    ) -> DbResult<Vec<PrimaryKey>> {
        let keys = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT child_key FROM record_links
            WHERE parent_type = ?1 AND parent_key = ?2 AND child_type = ?3
            ORDER BY child_key ASC
            "#,
        )
        .bind(parent_type)
        .bind(parent_key)
        .bind(child_type)
        .fetch_all(&mut *self.conn)
        .await?;

        Ok(keys)
    }

    /// Parents of `parent_type` whose slot contains this child, ascending.
    pub async fn parents(
        &mut self,
        child_type: &str,
        child_key: PrimaryKey,
        parent_type: &str,
    ) -> DbResult<Vec<PrimaryKey>> {
        let keys = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT parent_key FROM record_links
            WHERE child_type = ?1 AND child_key = ?2 AND parent_type = ?3
            ORDER BY parent_key ASC
            "#,
        )
        .bind(child_type)
        .bind(child_key)
        .bind(parent_type)
        .fetch_all(&mut *self.conn)
        .await?;

        Ok(keys)
    }

    /// Makes the slot contain exactly `child_keys`.
    ///
    /// Returns the number of links added plus removed.
    pub async fn replace_children(
        &mut self,
        parent_type: &str,
        parent_key: PrimaryKey,
        child_type: &str,
        child_keys: &[PrimaryKey],
    ) -> DbResult<usize> {
        let existing: BTreeSet<PrimaryKey> = self
            .children(parent_type, parent_key, child_type)
            .await?
            .into_iter()
            .collect();
        let desired: BTreeSet<PrimaryKey> = child_keys.iter().copied().collect();

        let mut changed = 0;
        for &child_key in existing.difference(&desired) {
            self.remove(parent_type, parent_key, child_type, child_key).await?;
            changed += 1;
        }
        for &child_key in desired.difference(&existing) {
            self.add(parent_type, parent_key, child_type, child_key).await?;
            changed += 1;
        }

        Ok(changed)
    }

    /// Makes this child a member of exactly `parent_keys` slots of
    /// `parent_type`.
    ///
    /// Returns the number of links added plus removed.
    pub async fn replace_parents(
        &mut self,
        child_type: &str,
        child_key: PrimaryKey,
        parent_type: &str,
        parent_keys: &[PrimaryKey],
    ) -> DbResult<usize> {
        let existing: BTreeSet<PrimaryKey> = self
            .parents(child_type, child_key, parent_type)
            .await?
            .into_iter()
            .collect();
        let desired: BTreeSet<PrimaryKey> = parent_keys.iter().copied().collect();

        let mut changed = 0;
        for &parent_key in existing.difference(&desired) {
            self.remove(parent_type, parent_key, child_type, child_key).await?;
            changed += 1;
        }
        for &parent_key in desired.difference(&existing) {
            self.add(parent_type, parent_key, child_type, child_key).await?;
            changed += 1;
        }

        Ok(changed)
    }

    /// Removes every link in which the record is parent or child.
    pub async fn purge(&mut self, entity_type: &str, key: PrimaryKey) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM record_links
            WHERE (parent_type = ?1 AND parent_key = ?2)
               OR (child_type = ?1 AND child_key = ?2)
            "#,
        )
        .bind(entity_type)
        .bind(key)
        .execute(&mut *self.conn)
        .await?;

        Ok(result.rows_affected())
    }

    async fn add(
        &mut self,
        parent_type: &str,
        parent_key: PrimaryKey,
        child_type: &str,
        child_key: PrimaryKey,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO record_links (parent_type, parent_key, child_type, child_key)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(parent_type)
        .bind(parent_key)
        .bind(child_type)
        .bind(child_key)
        .execute(&mut *self.conn)
        .await?;

        Ok(())
    }

    async fn remove(
        &mut self,
        parent_type: &str,
        parent_key: PrimaryKey,
        child_type: &str,
        child_key: PrimaryKey,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            DELETE FROM record_links
            WHERE parent_type = ?1 AND parent_key = ?2 AND child_type = ?3 AND child_key = ?4
            "#,
        )
        .bind(parent_type)
        .bind(parent_key)
        .bind(child_type)
        .bind(child_key)
        .execute(&mut *self.conn)
        .await?;

        Ok(())
    }
}
