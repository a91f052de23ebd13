//! Copy-on-write three-level triple index.
//!
//! Every level sits behind an `Arc`, so cloning an index is O(1) and a write
//! only copies the path from the root to the touched leaf:
//!
//! ```text
//!   root ──Arc──► { k1 ──Arc──► { k2 ──Arc──► { k3 -> Triple } } }
//! ```
//!
//! `eav`/`aev` use [`ValueKey`] leaves; `vae` is keyed by entity id.

use crate::triple::Triple;
use std::collections::BTreeMap;
use std::sync::Arc;

pub(crate) type Leaf<K> = BTreeMap<K, Triple>;
type Mid<K> = BTreeMap<String, Arc<Leaf<K>>>;

#[derive(Debug, Clone)]
pub(crate) struct TripleIndex<K: Ord + Clone> {
    root: Arc<BTreeMap<String, Arc<Mid<K>>>>,
}

impl<K: Ord + Clone> Default for TripleIndex<K> {
    fn default() -> Self {
        Self {
            root: Arc::new(BTreeMap::new()),
        }
    }
}

impl<K: Ord + Clone> TripleIndex<K> {
    pub fn level(&self, k1: &str) -> Option<&Mid<K>> {
        self.root.get(k1).map(Arc::as_ref)
    }

    pub fn leaf(&self, k1: &str, k2: &str) -> Option<&Leaf<K>> {
        self.level(k1)?.get(k2).map(Arc::as_ref)
    }

    pub fn get(&self, k1: &str, k2: &str, k3: &K) -> Option<&Triple> {
        self.leaf(k1, k2)?.get(k3)
    }

    pub fn contains_top(&self, k1: &str) -> bool {
        self.root.contains_key(k1)
    }

    pub fn top_keys(&self) -> impl Iterator<Item = &String> {
        self.root.keys()
    }

    /// Every triple, in key order.
    pub fn triples(&self) -> impl Iterator<Item = &Triple> {
        self.root
            .values()
            .flat_map(|mid| mid.values())
            .flat_map(|leaf| leaf.values())
    }

    /// Triples under `k1`, in key order.
    pub fn triples_under(&self, k1: &str) -> impl Iterator<Item = &Triple> {
        self.level(k1)
            .into_iter()
            .flat_map(|mid| mid.values())
            .flat_map(|leaf| leaf.values())
    }

    fn leaf_mut(&mut self, k1: &str, k2: &str) -> &mut Leaf<K> {
        let root = Arc::make_mut(&mut self.root);
        let mid = Arc::make_mut(root.entry(k1.to_string()).or_default());
        Arc::make_mut(mid.entry(k2.to_string()).or_default())
    }

    pub fn insert(&mut self, k1: &str, k2: &str, k3: K, triple: Triple) {
        self.leaf_mut(k1, k2).insert(k3, triple);
    }

    /// Remove one triple, pruning emptied levels.
    pub fn remove(&mut self, k1: &str, k2: &str, k3: &K) -> Option<Triple> {
        self.get(k1, k2, k3)?;
        let root = Arc::make_mut(&mut self.root);
        let mid_arc = root.get_mut(k1)?;
        let mid = Arc::make_mut(mid_arc);
        let leaf = Arc::make_mut(mid.get_mut(k2)?);
        let removed = leaf.remove(k3);
        if leaf.is_empty() {
            mid.remove(k2);
        }
        if mid.is_empty() {
            root.remove(k1);
        }
        removed
    }

    /// Remove the whole `(k1, k2)` leaf.
    pub fn remove_leaf(&mut self, k1: &str, k2: &str) -> Option<Leaf<K>> {
        self.leaf(k1, k2)?;
        let root = Arc::make_mut(&mut self.root);
        let mid = Arc::make_mut(root.get_mut(k1)?);
        let removed = mid.remove(k2);
        if mid.is_empty() {
            root.remove(k1);
        }
        removed.map(|leaf| Arc::try_unwrap(leaf).unwrap_or_else(|shared| (*shared).clone()))
    }

    pub fn len(&self) -> usize {
        self.triples().count()
    }

    /// True when `other` shares the root allocation (no writes since clone).
    #[cfg(test)]
    pub fn shares_root_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.root, &other.root)
    }

    /// True when both indexes share the `k1` subtree.
    #[cfg(test)]
    pub fn shares_level_with(&self, other: &Self, k1: &str) -> bool {
        match (self.root.get(k1), other.root.get(k1)) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn t(e: &str, a: &str, v: i64) -> Triple {
        Triple::new(e, a, json!(v), 0)
    }

    #[test]
    fn test_clone_shares_untouched_subtrees() {
        let mut base: TripleIndex<i64> = TripleIndex::default();
        base.insert("e1", "a", 1, t("e1", "a", 1));
        base.insert("e2", "a", 2, t("e2", "a", 2));

        let mut next = base.clone();
        assert!(next.shares_root_with(&base));

        next.insert("e1", "a", 3, t("e1", "a", 3));
        assert!(!next.shares_root_with(&base));
        assert!(next.shares_level_with(&base, "e2"));
        assert!(!next.shares_level_with(&base, "e1"));

        assert_eq!(base.len(), 2);
        assert_eq!(next.len(), 3);
    }

    #[test]
    fn test_remove_prunes_empty_levels() {
        let mut idx: TripleIndex<i64> = TripleIndex::default();
        idx.insert("e1", "a", 1, t("e1", "a", 1));
        assert!(idx.remove("e1", "a", &1).is_some());
        assert!(!idx.contains_top("e1"));
        assert!(idx.remove("e1", "a", &1).is_none());
    }
}
