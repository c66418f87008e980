//! Dependency Edges
//!
//! An edge records that a consumer read a dependency during one of its
//! computations. Every edge carries an ordinal drawn from a monotonic counter
//! the first time it is read in a generation, so that when several
//! dependencies of one consumer are dirtied together they are re-checked in
//! the order the consumer first read them, independent of map iteration order.

use smallvec::SmallVec;

use super::SignalId;

/// How the consumer observed the dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EdgeKind {
    /// Read the current value or async snapshot. Any observable change counts.
    Read,
    /// Awaited the settled value. Only settled value changes count.
    Wait,
}

/// Change counters of a node, as seen by the edges reading it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Versions {
    pub updated: u64,
    pub value: u64,
}

impl Versions {
    pub fn for_kind(self, kind: EdgeKind) -> u64 {
        match kind {
            EdgeKind::Read => self.updated,
            EdgeKind::Wait => self.value,
        }
    }
}

/// A dependency record, stored on the consumer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Edge {
    pub dep: SignalId,
    pub ordinal: u64,
    /// Dependency version at the time of the read.
    pub updated_at: u64,
    /// Consumer generation that established or refreshed the edge.
    pub consumed_at: u64,
    pub kind: EdgeKind,
}

impl Edge {
    /// Whether the dependency changed since this edge observed it.
    pub fn is_outdated(&self, versions: Versions) -> bool {
        self.updated_at != versions.for_kind(self.kind)
    }
}

/// Monotonic ordinal source.
#[derive(Debug, Default)]
pub(crate) struct Ordinals(u64);

impl Ordinals {
    pub fn next(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DirtyLink {
    pub ordinal: u64,
    pub dep: SignalId,
}

/// Ordinal-ordered list of the dependencies that may have changed.
///
/// The head is the earliest-read dependency; checks walk it front to back.
#[derive(Debug, Default)]
pub(crate) struct DirtyChain(SmallVec<[DirtyLink; 2]>);

impl DirtyChain {
    pub fn head(&self) -> Option<DirtyLink> {
        self.0.first().copied()
    }

    /// Replace the chain with a single link.
    pub fn reset(&mut self, link: DirtyLink) {
        self.0.clear();
        self.0.push(link);
    }

    /// Insert a link in ordinal order. Returns whether it became the new head.
    ///
    /// A dependency already in the chain is not inserted twice.
    pub fn insert(&mut self, link: DirtyLink) -> bool {
        if self.0.iter().any(|existing| existing.dep == link.dep) {
            return false;
        }
        let at = self
            .0
            .iter()
            .position(|existing| existing.ordinal > link.ordinal)
            .unwrap_or(self.0.len());
        self.0.insert(at, link);
        at == 0
    }

    /// Drop the link for `dep`, if present.
    pub fn remove(&mut self, dep: SignalId) {
        self.0.retain(|link| link.dep != dep);
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[cfg(test)]
    pub fn deps(&self) -> Vec<SignalId> {
        self.0.iter().map(|link| link.dep).collect()
    }
}
