//! Ordered index sets for CPUs and NUMA nodes.
//!
//! Both sets share one representation; the marker type only keeps CPU
//! indices and node indices from being mixed up at call sites.

use std::collections::BTreeSet;
use std::fmt;
use std::marker::PhantomData;

use serde::{Serialize, Serializer};

/// Marker for sets of logical CPU (PU) OS indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuIndex {}

/// Marker for sets of NUMA node OS indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeIndex {}

/// An ordered set of non-negative indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSet<K> {
    bits: BTreeSet<usize>,
    _kind: PhantomData<K>,
}

/// A set of CPUs.
pub type CpuSet = IndexSet<CpuIndex>;

/// A set of NUMA nodes.
pub type NodeSet = IndexSet<NodeIndex>;

impl<K> IndexSet<K> {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            bits: BTreeSet::new(),
            _kind: PhantomData,
        }
    }

    /// Creates a set holding a single index.
    #[must_use]
    pub fn single(index: usize) -> Self {
        let mut set = Self::new();
        set.insert(index);
        set
    }

    /// Adds an index. Returns `false` if it was already present.
    pub fn insert(&mut self, index: usize) -> bool {
        self.bits.insert(index)
    }

    /// Returns `true` if `index` is in the set.
    #[must_use]
    pub fn contains(&self, index: usize) -> bool {
        self.bits.contains(&index)
    }

    /// Lowest index in the set.
    #[must_use]
    pub fn first(&self) -> Option<usize> {
        self.bits.first().copied()
    }

    /// Number of indices in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// Returns `true` if the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Returns `true` if every index of `other` is also in `self`.
    #[must_use]
    pub fn includes(&self, other: &Self) -> bool {
        other.bits.is_subset(&self.bits)
    }

    /// Iterates indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter().copied()
    }

    /// Copies the indices into an ascending vector.
    #[must_use]
    pub fn to_vec(&self) -> Vec<usize> {
        self.iter().collect()
    }
}

impl<K> Default for IndexSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> FromIterator<usize> for IndexSet<K> {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Self {
            bits: iter.into_iter().collect(),
            _kind: PhantomData,
        }
    }
}

impl<K> Extend<usize> for IndexSet<K> {
    fn extend<I: IntoIterator<Item = usize>>(&mut self, iter: I) {
        self.bits.extend(iter);
    }
}

/// Renders as a comma-separated list, e.g. `0,1,3`.
impl<K> fmt::Display for IndexSet<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for index in &self.bits {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{index}")?;
        }
        Ok(())
    }
}

impl<K> Serialize for IndexSet<K> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.bits.iter())
    }
}
