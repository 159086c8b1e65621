//! # Per-Entity-Type Locks
//!
//! One `RwLock<()>` per entity type, created on first use.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  "bill"    ──► RwLock  ◄── reconcile(bill) holds WRITE for the whole   │
//! │                            fetch → merge → link → commit              │
//! │                        ◄── store.query::<Bill>() waits, then READs     │
//! │                                                                         │
//! │  "goal"    ──► RwLock  ◄── reconcile(goal) runs at the same time       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Lock order: a task holding a type lock never waits for another type's
//! write lock. Writers hold exactly one type lock.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Shared map of entity type to its lock.
#[derive(Debug, Clone, Default)]
pub struct TypeLocks {
    locks: Arc<Mutex<HashMap<&'static str, Arc<RwLock<()>>>>>,
}

impl TypeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn handle(&self, entity_type: &'static str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(entity_type)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Shared access to one entity type.
    pub async fn read(&self, entity_type: &'static str) -> OwnedRwLockReadGuard<()> {
        self.handle(entity_type).await.read_owned().await
    }

    /// Exclusive access to one entity type.
    pub async fn write(&self, entity_type: &'static str) -> OwnedRwLockWriteGuard<()> {
        self.handle(entity_type).await.write_owned().await
    }

    /// Shared access to several types, acquired in name order.
    pub async fn read_many(&self, entity_types: &[&'static str]) -> Vec<OwnedRwLockReadGuard<()>> {
        let mut types = entity_types.to_vec();
        types.sort_unstable();
        types.dedup();

        let mut guards = Vec::with_capacity(types.len());
        for entity_type in types {
            guards.push(self.read(entity_type).await);
        }
        guards
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_writer_excludes_readers_of_same_type() {
        let locks = TypeLocks::new();
        let _write = locks.write("bill").await;

        let blocked = tokio::time::timeout(Duration::from_millis(50), locks.read("bill")).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn test_types_do_not_contend() {
        let locks = TypeLocks::new();
        let _bill = locks.write("bill").await;

        let goal = tokio::time::timeout(Duration::from_millis(50), locks.write("goal")).await;
        assert!(goal.is_ok());
    }

    #[tokio::test]
    async fn test_read_many_dedups() {
        let locks = TypeLocks::new();
        let guards = locks.read_many(&["goal", "bill", "goal"]).await;
        assert_eq!(guards.len(), 2);
    }
}
