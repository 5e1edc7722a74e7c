//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Maildepot.
//
// Maildepot is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Maildepot is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Maildepot. If not, see <http://www.gnu.org/licenses/>.

//! The sorted id map underlying all search evaluation.
//!
//! An `OrderedSet` is used two ways: as the canonical uid→msn mapping of a
//! mailbox view, and inverted as msn→uid. For a live view the two orderings
//! are mutual inverses (the uid→msn mapping is a strict order isomorphism).
//!
//! Boolean merging consumes its right operand. The original implementation
//! mutated one tree in place and left the other in an unspecified state;
//! taking `other` by value makes the ownership transfer part of the
//! signature instead of a documentation footnote.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::iter::FromIterator;
use std::ops::Bound::Included;

/// Boolean merge modes for [`OrderedSet::merge`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOp {
    /// Keep only keys present in both operands.
    And,
    /// Keep keys present in either operand.
    Or,
    /// Symmetric difference. Merging a subset B into a universe A yields
    /// A − B, which is how NOT subtrees resolve.
    Not,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct OrderedSet<K, V> {
    inner: BTreeMap<K, V>,
}

impl<K: Ord + Copy, V: Copy> OrderedSet<K, V> {
    pub fn new() -> Self {
        OrderedSet {
            inner: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.inner.insert(key, value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner.remove(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key).copied()
    }

    pub fn first(&self) -> Option<(K, V)> {
        self.iter().next()
    }

    pub fn last(&self) -> Option<(K, V)> {
        self.inner.iter().next_back().map(|(&k, &v)| (k, v))
    }

    /// Iterate pairs in ascending key order.
    pub fn iter(&self) -> impl Iterator<Item = (K, V)> + '_ {
        self.inner.iter().map(|(&k, &v)| (k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        self.inner.keys().copied()
    }

    /// Copy of the subset whose keys fall in `lo..=hi`.
    pub fn filter_range(&self, lo: K, hi: K) -> Self {
        if hi < lo {
            return OrderedSet::new();
        }

        OrderedSet {
            inner: self
                .inner
                .range((Included(lo), Included(hi)))
                .map(|(&k, &v)| (k, v))
                .collect(),
        }
    }

    /// Merge `other` into `self` under `op`, consuming `other`.
    ///
    /// On key collisions the value already in `self` wins; merging never
    /// introduces duplicate keys.
    pub fn merge(&mut self, other: Self, op: MergeOp) {
        match op {
            MergeOp::And => {
                let keep = &other.inner;
                self.inner.retain(|k, _| keep.contains_key(k));
            },
            MergeOp::Or => {
                for (k, v) in other.inner {
                    self.inner.entry(k).or_insert(v);
                }
            },
            MergeOp::Not => {
                for (k, v) in other.inner {
                    if self.inner.remove(&k).is_none() {
                        self.inner.insert(k, v);
                    }
                }
            },
        }
    }
}

impl<K: Ord + Copy, V: Ord + Copy> OrderedSet<K, V> {
    /// Swap keys and values.
    ///
    /// Only meaningful when the values are distinct, as they are for the
    /// bijective uid↔msn maps.
    pub fn invert(&self) -> OrderedSet<V, K> {
        OrderedSet {
            inner: self.inner.iter().map(|(&k, &v)| (v, k)).collect(),
        }
    }
}

impl<K: Ord + Copy + Display, V: Copy> OrderedSet<K, V> {
    /// Join the keys with `sep`, e.g. for an `IN (...)` fragment or a
    /// SEARCH response line.
    pub fn join_keys(&self, sep: &str) -> String {
        let mut out = String::new();
        for (ix, k) in self.keys().enumerate() {
            if ix != 0 {
                out.push_str(sep);
            }
            out.push_str(&k.to_string());
        }
        out
    }
}

impl<K: Ord + Copy, V: Copy> Default for OrderedSet<K, V> {
    fn default() -> Self {
        OrderedSet::new()
    }
}

impl<K: Ord + Copy, V: Copy> FromIterator<(K, V)> for OrderedSet<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(it: I) -> Self {
        OrderedSet {
            inner: it.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    fn set(keys: &[u64]) -> OrderedSet<u64, u32> {
        keys.iter()
            .enumerate()
            .map(|(ix, &k)| (k, ix as u32 + 1))
            .collect()
    }

    #[test]
    fn and_intersects() {
        let mut a = set(&[1, 2, 3, 5]);
        a.merge(set(&[2, 3, 4]), MergeOp::And);
        assert_eq!(vec![2, 3], a.keys().collect::<Vec<_>>());
    }

    #[test]
    fn or_unions() {
        let mut a = set(&[1, 5]);
        a.merge(set(&[2, 5, 9]), MergeOp::Or);
        assert_eq!(vec![1, 2, 5, 9], a.keys().collect::<Vec<_>>());
    }

    #[test]
    fn not_against_universe_is_complement() {
        let mut universe = set(&[1, 2, 3, 4, 5]);
        universe.merge(set(&[2, 4]), MergeOp::Not);
        assert_eq!(vec![1, 3, 5], universe.keys().collect::<Vec<_>>());
    }

    #[test]
    fn filter_range_clamps() {
        let a = set(&[1, 3, 7, 9]);
        assert_eq!(
            vec![3, 7],
            a.filter_range(2, 8).keys().collect::<Vec<_>>()
        );
        assert!(a.filter_range(8, 2).is_empty());
    }

    #[test]
    fn invert_swaps() {
        let a = set(&[10, 20]);
        let inverted = a.invert();
        assert_eq!(Some(10), inverted.get(&1));
        assert_eq!(Some(20), inverted.get(&2));
    }

    #[test]
    fn join_keys_formats() {
        assert_eq!("1,3,7", set(&[1, 3, 7]).join_keys(","));
        assert_eq!("", set(&[]).join_keys(","));
    }

    fn arb_set() -> impl Strategy<Value = OrderedSet<u64, u32>> {
        proptest::collection::btree_map(0u64..64, 1u32..100, 0..32)
            .prop_map(|m| m.into_iter().collect())
    }

    proptest! {
        #[test]
        fn and_idempotent(a in arb_set()) {
            let mut merged = a.clone();
            merged.merge(a.clone(), MergeOp::And);
            prop_assert_eq!(a, merged);
        }

        #[test]
        fn or_with_empty_is_identity(a in arb_set()) {
            let mut merged = a.clone();
            merged.merge(OrderedSet::new(), MergeOp::Or);
            prop_assert_eq!(a, merged);
        }

        #[test]
        fn not_self_is_empty(a in arb_set()) {
            let mut merged = a.clone();
            merged.merge(a, MergeOp::Not);
            prop_assert!(merged.is_empty());
        }

        #[test]
        fn or_commutes_on_keys(a in arb_set(), b in arb_set()) {
            let mut ab = a.clone();
            ab.merge(b.clone(), MergeOp::Or);
            let mut ba = b;
            ba.merge(a, MergeOp::Or);
            prop_assert_eq!(
                ab.keys().collect::<Vec<_>>(),
                ba.keys().collect::<Vec<_>>()
            );
        }
    }
}
