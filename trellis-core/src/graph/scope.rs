//! Scope Tree
//!
//! Scopes hold context values and cache keyed derived signals. Each context
//! owns one bit of a 64-bit mask. A scope records the bits of the contexts it
//! introduces, and every derived definition accumulates the bits of the
//! contexts its signals read, directly or through dependencies.
//!
//! A derived signal is cached at the nearest scope, walking up from the
//! requesting one, whose introduced bits intersect the definition's mask, or
//! at the root if none does. A function that never reads a context only a
//! descendant overrides is therefore shared by every scope below the root.

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use super::{Graph, ScopeId, SignalId, Value};
use crate::error::Result;

/// Key of a context within the runtime.
pub(crate) type ContextKey = u32;

/// The mask bit owned by a context. Keys past 64 share bits, which only costs
/// some cache sharing.
pub(crate) fn context_bit(key: ContextKey) -> u64 {
    1 << (key % 64)
}

pub(crate) struct ScopeNode {
    pub parent: Option<ScopeId>,
    pub contexts: FxHashMap<ContextKey, Value>,

    /// Bits of the contexts this scope overrides.
    pub mask: u64,

    /// `(definition, argument hash)` to the signals cached under it.
    pub cache: FxHashMap<(u64, u64), SmallVec<[SignalId; 1]>>,

    /// Child scopes by the hash of the context values they introduce.
    pub children: FxHashMap<u64, ScopeId>,
    pub gc_candidates: Vec<SignalId>,
}

impl ScopeNode {
    pub fn new(parent: Option<ScopeId>) -> Self {
        Self {
            parent,
            contexts: FxHashMap::default(),
            mask: 0,
            cache: FxHashMap::default(),
            children: FxHashMap::default(),
            gc_candidates: Vec::new(),
        }
    }
}

impl Graph {
    /// The scope that should own a signal requested from `scope` with `mask`.
    pub fn owner_for(&self, scope: ScopeId, mask: u64) -> ScopeId {
        let mut current = Some(scope);
        while let Some(id) = current {
            let Some(node) = self.scopes.get(id) else {
                break;
            };
            if node.mask & mask != 0 {
                return id;
            }
            current = node.parent;
        }
        self.root
    }

    /// Look up a context value, walking up from `scope`.
    pub fn context_value(&self, scope: ScopeId, key: ContextKey) -> Option<Value> {
        let mut current = Some(scope);
        while let Some(id) = current {
            let node = self.scopes.get(id)?;
            if let Some(value) = node.contexts.get(&key) {
                return Some(value.clone());
            }
            current = node.parent;
        }
        None
    }

    /// Get or create the child of `parent` overriding `overrides`.
    ///
    /// `hash` fingerprints the override set; equal fingerprints reuse the child.
    pub fn child_scope(
        &mut self,
        parent: ScopeId,
        hash: u64,
        overrides: Vec<(ContextKey, Value)>,
    ) -> ScopeId {
        if let Some(child) = self.scopes.get(parent).and_then(|p| p.children.get(&hash)) {
            return *child;
        }
        let mut node = ScopeNode::new(Some(parent));
        for (key, value) in overrides {
            node.mask |= context_bit(key);
            node.contexts.insert(key, value);
        }
        let child = self.scopes.insert(node);
        if let Some(parent) = self.scopes.get_mut(parent) {
            parent.children.insert(hash, child);
        }
        tracing::trace!(?child, hash, "scope created");
        child
    }

    /// Record that `consumer` read context `key`, and return its value as seen from `scope`.
    pub fn read_context(
        &mut self,
        consumer: Option<SignalId>,
        scope: ScopeId,
        key: ContextKey,
    ) -> Result<Option<Value>> {
        let bit = context_bit(key);
        if let Some(node) = consumer.and_then(|id| self.nodes.get_mut(id)) {
            if let Some(def_mask) = &node.def_mask {
                def_mask.set(def_mask.get() | bit);
            }
            if node.ctx_mask & bit == 0 {
                node.ctx_mask |= bit;
                if let Some(consumer) = consumer {
                    self.promote(consumer)?;
                }
            }
        }
        Ok(self.context_value(scope, key))
    }

    /// Find the cached signal for `(def, hash)` in `owner` whose arguments match.
    pub fn lookup(
        &self,
        owner: ScopeId,
        def: u64,
        hash: u64,
        same_args: &dyn Fn(&Value) -> bool,
    ) -> Option<SignalId> {
        let bucket = self.scopes.get(owner)?.cache.get(&(def, hash))?;
        bucket.iter().copied().find(|id| {
            self.nodes
                .get(*id)
                .and_then(|node| node.cache.as_ref())
                .is_some_and(|entry| same_args(&entry.args))
        })
    }

    /// Put `id` into its owner's cache.
    pub fn cache_insert(&mut self, id: SignalId) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        let owner = node.owner;
        let Some(entry) = node.cache.as_mut() else {
            return;
        };
        entry.cached = true;
        let (def, hash) = (entry.def, entry.hash);
        let Some(scope) = self.scopes.get_mut(owner) else {
            return;
        };
        let bucket = scope.cache.entry((def, hash)).or_default();
        if !bucket.is_empty() {
            tracing::warn!(def, hash, "argument hash collision in scope cache");
        }
        bucket.push(id);
    }

    /// Take `id` out of its owner's cache.
    pub fn uncache(&mut self, id: SignalId) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        let owner = node.owner;
        let Some(entry) = node.cache.as_mut() else {
            return;
        };
        if !entry.cached {
            return;
        }
        entry.cached = false;
        let key = (entry.def, entry.hash);
        if let Some(scope) = self.scopes.get_mut(owner) {
            if let Some(bucket) = scope.cache.get_mut(&key) {
                bucket.retain(|cached| *cached != id);
                if bucket.is_empty() {
                    scope.cache.remove(&key);
                }
            }
        }
    }

    /// Move a cached node to the scope its context mask calls for.
    ///
    /// Consumers that found the node in its old scope are forced dirty so they
    /// look it up again. So are consumers sharing it from a scope that
    /// overrides a context the node reads now, even when the node stays put.
    pub fn promote(&mut self, id: SignalId) -> Result<()> {
        let Some(node) = self.nodes.get(id) else {
            return Ok(());
        };
        if !node.cache.as_ref().is_some_and(|entry| entry.cached) {
            return Ok(());
        }
        let mask = node.ctx_mask;
        let target = self.owner_for(node.scope, mask);
        let from = node.owner;
        let subs: SmallVec<[SignalId; 4]> = node.subs.keys().copied().collect();

        let moved = target != from;
        if moved {
            self.uncache(id);
            self.nodes[id].owner = target;
            self.cache_insert(id);
            tracing::trace!(?id, ?from, ?target, "promoted to context scope");
        }

        for sub in subs {
            let served = self
                .nodes
                .get(sub)
                .is_some_and(|consumer| self.owner_for(consumer.scope, mask) == target);
            if moved || !served {
                self.force_dirty(sub)?;
            }
        }
        Ok(())
    }

    /// Drop cache entries whose signals are still unwatched, then the child
    /// scopes left without any use. Returns how many signals were uncached.
    ///
    /// `entered` are the scopes currently on the context stack.
    pub fn sweep(&mut self, entered: &[ScopeId]) -> usize {
        self.queues.gc_scheduled = false;
        self.queues.gc_requested = false;
        let scopes: SmallVec<[ScopeId; 8]> = self.scopes.keys().collect();
        let mut removed = 0;

        for scope in scopes {
            let candidates = match self.scopes.get_mut(scope) {
                Some(node) => std::mem::take(&mut node.gc_candidates),
                None => continue,
            };
            for id in candidates {
                let Some(node) = self.nodes.get_mut(id) else {
                    continue;
                };
                if !node.gc_pending {
                    continue;
                }
                node.gc_pending = false;
                if node.watch_count > 0 {
                    continue;
                }
                self.uncache(id);
                removed += 1;
                self.maybe_free(id);
            }
        }
        let scopes_freed = self.sweep_scopes(entered);
        tracing::debug!(removed, scopes_freed, "gc sweep finished");
        removed
    }

    /// Free child scopes with no cache, no children, and no node or entered
    /// context referring to them. Leaves go first, so a chain of unused
    /// scopes is freed in one pass.
    fn sweep_scopes(&mut self, entered: &[ScopeId]) -> usize {
        let mut used: FxHashSet<ScopeId> = entered.iter().copied().collect();
        for node in self.nodes.values() {
            used.insert(node.scope);
            used.insert(node.owner);
        }
        let mut freed = 0;
        loop {
            let unused: SmallVec<[ScopeId; 8]> = self
                .scopes
                .iter()
                .filter(|(id, scope)| {
                    *id != self.root
                        && scope.children.is_empty()
                        && scope.cache.is_empty()
                        && scope.gc_candidates.is_empty()
                        && !used.contains(id)
                })
                .map(|(id, _)| id)
                .collect();
            if unused.is_empty() {
                return freed;
            }
            for id in unused {
                let Some(scope) = self.scopes.remove(id) else {
                    continue;
                };
                if let Some(parent) = scope.parent.and_then(|parent| self.scopes.get_mut(parent)) {
                    parent.children.retain(|_, child| *child != id);
                }
                tracing::trace!(scope = ?id, "scope freed");
                freed += 1;
            }
        }
    }
}
