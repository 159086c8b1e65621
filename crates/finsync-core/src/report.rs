//! # Reconcile Report
//!
//! Summary of one reconciliation pass, returned to the caller and surfaced
//! to host UIs through the generated TypeScript bindings.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::entity::PrimaryKey;

/// What a reconciliation pass did to one entity type.
///
/// Key lists are in ascending key order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ReconcileReport {
    /// Entity type the batch was applied to.
    pub entity_type: String,

    /// Keys written that did not exist locally.
    pub inserted: Vec<PrimaryKey>,

    /// Keys whose stored body changed.
    pub updated: Vec<PrimaryKey>,

    /// Records present in the batch whose stored body was already identical.
    pub unchanged: usize,

    /// Keys removed because an authoritative batch no longer contains them.
    pub deleted: Vec<PrimaryKey>,

    /// Remote records that failed to decode and were skipped.
    pub rejected: usize,

    /// Relationship links written or removed while linking.
    pub links_changed: usize,
}

impl ReconcileReport {
    pub fn new(entity_type: impl Into<String>) -> Self {
        ReconcileReport {
            entity_type: entity_type.into(),
            ..Default::default()
        }
    }

    /// True when the store was modified.
    pub fn has_changes(&self) -> bool {
        !self.inserted.is_empty()
            || !self.updated.is_empty()
            || !self.deleted.is_empty()
            || self.links_changed > 0
    }

    pub fn inserted_count(&self) -> usize {
        self.inserted.len()
    }

    pub fn updated_count(&self) -> usize {
        self.updated.len()
    }

    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }

    /// Number of batch records that were accepted (written or unchanged).
    pub fn accepted(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.unchanged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unchanged_only_is_not_a_change() {
        let mut report = ReconcileReport::new("bill");
        report.unchanged = 4;
        assert!(!report.has_changes());
        assert_eq!(report.accepted(), 4);

        report.deleted.push(9);
        assert!(report.has_changes());
    }
}
