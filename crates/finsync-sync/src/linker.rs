//! # Relationship Linker
//!
//! Dispatch table deciding which cached children belong to which parent.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │  (parent_type, child_type)        link function                     │
//! │  ─────────────────────────        ─────────────────────────────     │
//! │  ("account", "bill")       ───►   |a, b| b.account_id == a.id       │
//! │  ("bill", "payment")       ───►   |b, p| p.bill_id == b.id          │
//! │  ("bill", "attachment")    ───►   (not registered: no-op)           │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The linker is pure: it only computes matches. The reconciler persists
//! them as relationship slots in the store.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use finsync_core::{Entity, PrimaryKey};

/// A cached or freshly written record as seen by a link function.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkRecord {
    pub key: PrimaryKey,
    pub body: Value,
}

impl LinkRecord {
    pub fn new(key: PrimaryKey, body: Value) -> Self {
        LinkRecord { key, body }
    }
}

/// The children attached to one parent for one child type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipSlot {
    pub parent_type: &'static str,
    pub parent_key: PrimaryKey,
    pub child_type: &'static str,
    /// Ascending.
    pub child_keys: Vec<PrimaryKey>,
}

impl RelationshipSlot {
    pub fn is_empty(&self) -> bool {
        self.child_keys.is_empty()
    }
}

/// Matches a set of parents against a set of children, returning the
/// `(parent_key, child_key)` pairs that belong together.
type PairingFn = dyn Fn(&[LinkRecord], &[LinkRecord]) -> Vec<(PrimaryKey, PrimaryKey)> + Send + Sync;

/// Registry of link functions keyed by parent type, then child type.
#[derive(Default, Clone)]
pub struct RelationshipLinker {
    rules: HashMap<&'static str, HashMap<&'static str, Arc<PairingFn>>>,
}

impl fmt::Debug for RelationshipLinker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut pairs: Vec<(&str, &str)> = self
            .rules
            .iter()
            .flat_map(|(p, children)| children.keys().map(move |c| (*p, *c)))
            .collect();
        pairs.sort_unstable();
        f.debug_struct("RelationshipLinker")
            .field("pairs", &pairs)
            .finish()
    }
}

impl RelationshipLinker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a predicate over raw JSON bodies.
    ///
    /// Registering the same pair again replaces the previous function.
    pub fn register<F>(&mut self, parent_type: &'static str, child_type: &'static str, link_fn: F)
    where
        F: Fn(&Value, &Value) -> bool + Send + Sync + 'static,
    {
        let pairing = move |parents: &[LinkRecord], children: &[LinkRecord]| {
            let mut pairs = Vec::new();
            for parent in parents {
                for child in children {
                    if link_fn(&parent.body, &child.body) {
                        pairs.push((parent.key, child.key));
                    }
                }
            }
            pairs
        };

        debug!(parent_type, child_type, "Registered link function");
        self.rules
            .entry(parent_type)
            .or_default()
            .insert(child_type, Arc::new(pairing));
    }

    /// Registers a typed predicate.
    ///
    /// Each record is decoded once per match; records that do not decode as
    /// `P` or `C` never link.
    pub fn register_fn<P, C, F>(&mut self, link_fn: F)
    where
        P: Entity,
        C: Entity,
        F: Fn(&P, &C) -> bool + Send + Sync + 'static,
    {
        let pairing = move |parents: &[LinkRecord], children: &[LinkRecord]| {
            let parents: Vec<(PrimaryKey, P)> = decode_all(parents);
            let children: Vec<(PrimaryKey, C)> = decode_all(children);

            let mut pairs = Vec::new();
            for (parent_key, parent) in &parents {
                for (child_key, child) in &children {
                    if link_fn(parent, child) {
                        pairs.push((*parent_key, *child_key));
                    }
                }
            }
            pairs
        };

        debug!(
            parent_type = P::ENTITY_TYPE,
            child_type = C::ENTITY_TYPE,
            "Registered typed link function"
        );
        self.rules
            .entry(P::ENTITY_TYPE)
            .or_default()
            .insert(C::ENTITY_TYPE, Arc::new(pairing));
    }

    pub fn is_registered(&self, parent_type: &str, child_type: &str) -> bool {
        self.rule(parent_type, child_type).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Child types registered under `parent_type`, sorted.
    pub fn child_types_of(&self, parent_type: &str) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = self
            .rules
            .get(parent_type)
            .map(|children| children.keys().copied().collect())
            .unwrap_or_default();
        types.sort_unstable();
        types
    }

    /// Parent types registered over `child_type`, sorted.
    pub fn parent_types_of(&self, child_type: &str) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = self
            .rules
            .iter()
            .filter(|(_, children)| children.contains_key(child_type))
            .map(|(p, _)| *p)
            .collect();
        types.sort_unstable();
        types
    }

    /// Builds the slot of one parent from the candidate children.
    ///
    /// An unregistered pair yields an empty slot.
    pub fn link(
        &self,
        parent_type: &'static str,
        parent: &LinkRecord,
        child_type: &'static str,
        candidates: &[LinkRecord],
    ) -> RelationshipSlot {
        let mut child_keys: Vec<PrimaryKey> = self
            .pairs(parent_type, child_type, std::slice::from_ref(parent), candidates)
            .unwrap_or_default()
            .into_iter()
            .map(|(_, child_key)| child_key)
            .collect();
        child_keys.sort_unstable();
        child_keys.dedup();

        RelationshipSlot {
            parent_type,
            parent_key: parent.key,
            child_type,
            child_keys,
        }
    }

    /// Matching `(parent_key, child_key)` pairs, or `None` when the pair
    /// of types is not registered.
    pub fn pairs(
        &self,
        parent_type: &str,
        child_type: &str,
        parents: &[LinkRecord],
        children: &[LinkRecord],
    ) -> Option<Vec<(PrimaryKey, PrimaryKey)>> {
        let rule = self.rule(parent_type, child_type)?;

        if parents.is_empty() || children.is_empty() {
            return Some(Vec::new());
        }
        Some(rule(parents, children))
    }

    fn rule(&self, parent_type: &str, child_type: &str) -> Option<&Arc<PairingFn>> {
        self.rules.get(parent_type)?.get(child_type)
    }

    /// Groups pairs by parent key; every parent in `parents` gets an entry.
    pub fn children_by_parent(
        parents: &[LinkRecord],
        pairs: &[(PrimaryKey, PrimaryKey)],
    ) -> BTreeMap<PrimaryKey, Vec<PrimaryKey>> {
        let mut slots: BTreeMap<PrimaryKey, Vec<PrimaryKey>> =
            parents.iter().map(|p| (p.key, Vec::new())).collect();
        for (parent_key, child_key) in pairs {
            slots.entry(*parent_key).or_default().push(*child_key);
        }
        slots
    }

    /// Groups pairs by child key; every child in `children` gets an entry.
    pub fn parents_by_child(
        children: &[LinkRecord],
        pairs: &[(PrimaryKey, PrimaryKey)],
    ) -> BTreeMap<PrimaryKey, Vec<PrimaryKey>> {
        let mut memberships: BTreeMap<PrimaryKey, Vec<PrimaryKey>> =
            children.iter().map(|c| (c.key, Vec::new())).collect();
        for (parent_key, child_key) in pairs {
            memberships.entry(*child_key).or_default().push(*parent_key);
        }
        memberships
    }
}

fn decode_all<T: Entity>(records: &[LinkRecord]) -> Vec<(PrimaryKey, T)> {
    records
        .iter()
        .filter_map(|r| T::deserialize(&r.body).ok().map(|t| (r.key, t)))
        .collect()
}
