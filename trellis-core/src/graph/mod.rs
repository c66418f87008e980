//! Dependency Graph
//!
//! This module implements the signal graph itself: the arena of nodes, the
//! edges between them, dirty propagation, the flush queues and the scope tree.
//! Nothing in here ever calls user code. Work that has to run user callbacks
//! (relay teardown, dropping closures that own handles) is parked on the graph
//! and picked up by the runtime once its borrow of the graph has ended.
//!
//! # Overview
//!
//! - Nodes live in a generational arena indexed by [`SignalId`].
//! - Each consumer keeps its incoming [`Edge`](edge::Edge)s keyed by dependency;
//!   each dependency keeps the set of its consumers (`subs`) with the consumer
//!   generation that read it. A `subs` entry whose generation no longer matches
//!   the consumer is stale and ignored during propagation.
//! - Liveness is explicit: a node is freed once no handle, consumer, watcher
//!   or scope cache refers to it. Freeing a node releases its own dependencies
//!   in turn.

mod dirty;
mod edge;
mod node;
mod scheduler;
mod scope;

pub(crate) use edge::EdgeKind;
pub(crate) use dirty::CheckStep;
pub(crate) use node::{
    ActivateFn, AsyncFn, Awaiter, CacheEntry, EqFn, ListenerFn, Node, NodeKind, Outcome, SyncFn,
    TaskFn, Value,
};
pub use node::{DirtyState, ScopeId, SignalId, SignalKind};
pub(crate) use scheduler::{Job, Queues, TaskSlot};
pub(crate) use scope::{ContextKey, ScopeNode};

use slab::Slab;
use slotmap::SlotMap;
use smallvec::SmallVec;

use edge::{Edge, Ordinals};
use crate::error::{Error, Result};
use crate::reactive::RelayHooks;
use crate::trace::{TraceBuffer, TraceEvent};

/// Counts describing the graph, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GraphStats {
    /// Live signals in the arena.
    pub signals: usize,
    /// Signals with a non-zero watch count.
    pub watched: usize,
    /// Scopes in the scope tree, including the root.
    pub scopes: usize,
    /// In-flight async tasks, stale ones included.
    pub tasks: usize,
}

/// The signal graph of one thread.
pub(crate) struct Graph {
    pub nodes: SlotMap<SignalId, Node>,
    pub scopes: SlotMap<ScopeId, ScopeNode>,
    pub root: ScopeId,
    pub ordinals: Ordinals,
    pub queues: Queues,
    pub tasks: Slab<TaskSlot>,
    pub trace: TraceBuffer,

    /// Nodes removed from the arena. Dropped after the graph borrow ends,
    /// since their closures may own handles.
    pub garbage: Vec<Node>,

    /// Relay hooks whose deactivation has to run outside the graph borrow.
    pub teardowns: Vec<RelayHooks>,
}

impl Graph {
    pub fn new() -> Self {
        let mut scopes = SlotMap::with_key();
        let root = scopes.insert(ScopeNode::new(None));
        Self {
            nodes: SlotMap::with_key(),
            scopes,
            root,
            ordinals: Ordinals::default(),
            queues: Queues::default(),
            tasks: Slab::new(),
            trace: TraceBuffer::default(),
            garbage: Vec::new(),
            teardowns: Vec::new(),
        }
    }

    /// Add a node to the arena.
    pub fn insert(&mut self, node: Node) -> SignalId {
        let kind = node.signal_kind();
        let id = self.nodes.insert(node);
        tracing::trace!(?id, ?kind, "signal created");
        self.trace.push(TraceEvent::Created {
            id: id.to_raw(),
            kind,
        });
        id
    }

    pub fn node(&self, id: SignalId) -> Result<&Node> {
        self.nodes.get(id).ok_or(Error::Released(id))
    }

    pub fn node_mut(&mut self, id: SignalId) -> Result<&mut Node> {
        self.nodes.get_mut(id).ok_or(Error::Released(id))
    }

    /// Record that `consumer` read `dep` during its current generation.
    ///
    /// The first read of a dependency in a generation draws a fresh ordinal;
    /// later reads in the same generation only refresh the observed version.
    pub fn track(&mut self, consumer: SignalId, dep: SignalId, kind: EdgeKind) -> Result<()> {
        if consumer == dep {
            return Err(Error::Cycle(dep));
        }
        let dep_node = self.node(dep)?;
        let versions = dep_node.versions();
        let dep_mask = dep_node.ctx_mask;

        let Some(node) = self.nodes.get_mut(consumer) else {
            return Err(Error::Released(consumer));
        };
        let generation = node.compute_count;
        let added = match node.deps.get_mut(&dep) {
            Some(edge) => {
                if edge.consumed_at != generation {
                    edge.ordinal = self.ordinals.next();
                    edge.consumed_at = generation;
                    edge.kind = kind;
                } else if kind == EdgeKind::Read {
                    // a plain read in the same generation is the stricter observation
                    edge.kind = EdgeKind::Read;
                }
                edge.updated_at = versions.for_kind(edge.kind);
                false
            }
            None => {
                node.deps.insert(
                    dep,
                    Edge {
                        dep,
                        ordinal: self.ordinals.next(),
                        updated_at: versions.for_kind(kind),
                        consumed_at: generation,
                        kind,
                    },
                );
                true
            }
        };
        let mask_grew = node.ctx_mask | dep_mask != node.ctx_mask;
        node.ctx_mask |= dep_mask;
        if let Some(def_mask) = &node.def_mask {
            def_mask.set(def_mask.get() | dep_mask);
        }
        let watched = node.watch_count > 0;

        if let Some(dep_node) = self.nodes.get_mut(dep) {
            dep_node.subs.insert(consumer, generation);
        }
        if added {
            self.trace.push(TraceEvent::Consumed {
                consumer: consumer.to_raw(),
                dep: dep.to_raw(),
            });
            if watched {
                self.watch(dep);
            }
        }
        if mask_grew {
            self.promote(consumer)?;
        }
        Ok(())
    }

    /// Drop the edges `id` did not read during its latest generation.
    pub fn prune(&mut self, id: SignalId) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        let generation = node.compute_count;
        let watched = node.watch_count > 0;
        let stale: SmallVec<[SignalId; 4]> = node
            .deps
            .values()
            .filter(|edge| edge.consumed_at != generation)
            .map(|edge| edge.dep)
            .collect();
        for dep in &stale {
            node.deps.shift_remove(dep);
            node.dirty.remove(*dep);
        }

        for dep in stale {
            tracing::trace!(consumer = ?id, ?dep, "pruned stale edge");
            if let Some(dep_node) = self.nodes.get_mut(dep) {
                dep_node.subs.shift_remove(&id);
            }
            if watched {
                self.queues.schedule_unwatch(dep, 1);
            } else {
                self.maybe_free(dep);
            }
        }
    }

    /// Add one watcher to `id`, watching its dependencies on the 0 -> 1 edge.
    pub fn watch(&mut self, id: SignalId) {
        let mut stack: SmallVec<[SignalId; 8]> = SmallVec::new();
        stack.push(id);
        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get_mut(id) else {
                continue;
            };
            node.watch_count += 1;
            if node.watch_count > 1 {
                continue;
            }
            node.gc_pending = false;
            stack.extend(node.deps.keys().copied());
            match node.kind {
                NodeKind::Watcher(_) => self.queues.schedule_pull(id),
                // relays activate and async nodes start on their first watch
                NodeKind::Relay(_) | NodeKind::Async(_) => self.queues.schedule_async_pull(id),
                _ => {}
            }
        }
    }

    /// Remove `count` watchers from `id`, tearing it down on the way to zero.
    pub fn unwatch(&mut self, id: SignalId, count: u32) {
        let mut stack: SmallVec<[(SignalId, u32); 8]> = SmallVec::new();
        stack.push((id, count));
        while let Some((id, count)) = stack.pop() {
            let Some(node) = self.nodes.get_mut(id) else {
                continue;
            };
            if node.watch_count == 0 {
                continue;
            }
            node.watch_count = node.watch_count.saturating_sub(count);
            if node.watch_count > 0 {
                continue;
            }
            stack.extend(node.deps.keys().map(|&dep| (dep, 1)));

            let mut settled_idle = false;
            if let Some(relay) = node.relay.as_mut() {
                if relay.active {
                    relay.active = false;
                    node.state = DirtyState::Dirty;
                    if let Some(hooks) = relay.hooks.take() {
                        self.teardowns.push(hooks);
                    }
                    // torn down before its first push
                    if let Some(slot) = node.async_slot.as_mut() {
                        settled_idle = std::mem::take(&mut slot.pending);
                    }
                }
            }
            if settled_idle {
                node.bump(false);
            }
            let cached = node.cache.as_ref().is_some_and(|entry| entry.cached);
            if settled_idle {
                if let Err(err) = self.dirty_consumers(id, &[]) {
                    tracing::debug!(?id, %err, "relay teardown left consumers as they were");
                }
            }

            if cached {
                self.mark_gc_candidate(id);
            } else {
                self.maybe_free(id);
            }
        }
    }

    /// Queue a cached node for the next idle sweep.
    pub fn mark_gc_candidate(&mut self, id: SignalId) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        if node.gc_pending || node.watch_count > 0 {
            return;
        }
        node.gc_pending = true;
        let owner = node.owner;
        if let Some(scope) = self.scopes.get_mut(owner) {
            scope.gc_candidates.push(id);
        }
        if !self.queues.gc_scheduled {
            self.queues.gc_scheduled = true;
            self.queues.gc_requested = true;
        }
    }

    /// Store a new value in a state node. Returns whether it changed.
    pub fn write(&mut self, id: SignalId, value: Value) -> Result<bool> {
        let node = self.node_mut(id)?;
        if let Some(Ok(old)) = &node.value {
            if (node.equals)(old, &value) {
                return Ok(false);
            }
        }
        node.value = Some(Ok(value));
        node.bump(true);
        let version = node.updated_count;
        tracing::trace!(?id, version, "state written");
        self.trace.push(TraceEvent::Updated {
            id: id.to_raw(),
            version,
        });
        self.dirty_consumers(id, &[])?;
        Ok(true)
    }

    pub fn retain_handle(&mut self, id: SignalId) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.handles += 1;
        }
    }

    pub fn release_handle(&mut self, id: SignalId) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.handles = node.handles.saturating_sub(1);
        }
        self.maybe_free(id);
    }

    /// Free `id` if nothing refers to it, then its dependencies in turn.
    pub fn maybe_free(&mut self, id: SignalId) {
        let mut stack: SmallVec<[SignalId; 8]> = SmallVec::new();
        stack.push(id);
        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            if !node.is_collectable() {
                let only_cached = node.handles == 0
                    && node.watch_count == 0
                    && node.subs.is_empty()
                    && !node.computing;
                if only_cached {
                    self.mark_gc_candidate(id);
                }
                continue;
            }
            let Some(node) = self.nodes.remove(id) else {
                continue;
            };
            for dep in node.deps.keys() {
                if let Some(dep_node) = self.nodes.get_mut(*dep) {
                    dep_node.subs.shift_remove(&id);
                    stack.push(*dep);
                }
            }
            tracing::trace!(?id, "signal released");
            self.trace.push(TraceEvent::Released { id: id.to_raw() });
            self.garbage.push(node);
        }
    }

    /// Whether any non-stale task is still running.
    pub fn has_live_tasks(&self) -> bool {
        self.tasks.iter().any(|(_, task)| !self.is_stale(task.signal, task.version))
    }

    pub fn is_stale(&self, id: SignalId, version: u64) -> bool {
        self.nodes
            .get(id)
            .and_then(|node| node.async_slot.as_ref())
            .map_or(true, |slot| slot.version != version)
    }

    pub fn stats(&self) -> GraphStats {
        GraphStats {
            signals: self.nodes.len(),
            watched: self
                .nodes
                .values()
                .filter(|node| node.watch_count > 0)
                .count(),
            scopes: self.scopes.len(),
            tasks: self.tasks.len(),
        }
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::rc::Rc;

    pub(crate) fn structural() -> EqFn {
        Rc::new(|a: &Value, b: &Value| {
            match (a.downcast_ref::<i32>(), b.downcast_ref::<i32>()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        })
    }

    pub(crate) fn state(graph: &mut Graph, value: i32) -> SignalId {
        let root = graph.root;
        let mut node = Node::new(NodeKind::State, structural(), root);
        node.value = Some(Ok(Rc::new(value) as Value));
        node.handles = 1;
        graph.insert(node)
    }

    pub(crate) fn computed(graph: &mut Graph) -> SignalId {
        let root = graph.root;
        let compute: SyncFn = Rc::new(|| -> Outcome { Ok(Rc::new(0) as Value) });
        let mut node = Node::new(NodeKind::Computed(compute), structural(), root);
        node.handles = 1;
        graph.insert(node)
    }

    /// Simulate a completed computation of `consumer` reading `deps`.
    pub(crate) fn compute(graph: &mut Graph, consumer: SignalId, deps: &[SignalId]) {
        graph.nodes[consumer].compute_count += 1;
        for dep in deps {
            graph.track(consumer, *dep, EdgeKind::Read).unwrap();
        }
        graph.prune(consumer);
        let node = &mut graph.nodes[consumer];
        node.value = Some(Ok(Rc::new(0) as Value));
        node.mark_clean();
    }

    #[test]
    fn add_and_release_nodes() {
        let mut graph = Graph::new();
        let a = state(&mut graph, 1);
        let b = state(&mut graph, 2);
        assert_eq!(graph.stats().signals, 2);

        graph.release_handle(a);
        assert_eq!(graph.stats().signals, 1);
        assert!(graph.node(a).is_err());
        assert!(graph.node(b).is_ok());
    }

    #[test]
    fn tracking_links_both_directions() {
        let mut graph = Graph::new();
        let source = state(&mut graph, 1);
        let derived = computed(&mut graph);
        compute(&mut graph, derived, &[source]);

        assert!(graph.nodes[derived].deps.contains_key(&source));
        assert_eq!(graph.nodes[source].subs.get(&derived), Some(&1));
    }

    #[test]
    fn self_reads_are_cycles() {
        let mut graph = Graph::new();
        let derived = computed(&mut graph);
        let err = graph.track(derived, derived, EdgeKind::Read).unwrap_err();
        assert_eq!(err, Error::Cycle(derived));
    }

    #[test]
    fn ordinals_follow_first_read_order() {
        let mut graph = Graph::new();
        let a = state(&mut graph, 1);
        let b = state(&mut graph, 2);
        let derived = computed(&mut graph);
        compute(&mut graph, derived, &[b, a, b]);

        let deps = &graph.nodes[derived].deps;
        assert!(deps[&b].ordinal < deps[&a].ordinal);
    }

    #[test]
    fn stale_edges_are_pruned() {
        let mut graph = Graph::new();
        let a = state(&mut graph, 1);
        let b = state(&mut graph, 2);
        let derived = computed(&mut graph);
        compute(&mut graph, derived, &[a, b]);
        compute(&mut graph, derived, &[b]);

        assert!(!graph.nodes[derived].deps.contains_key(&a));
        assert!(graph.nodes[a].subs.is_empty());
        assert_eq!(graph.nodes[b].subs.get(&derived), Some(&2));
    }

    #[test]
    fn released_consumers_free_their_dependencies() {
        let mut graph = Graph::new();
        let inner = computed(&mut graph);
        let outer = computed(&mut graph);
        compute(&mut graph, outer, &[inner]);

        // the edge keeps the inner node alive without a handle
        graph.release_handle(inner);
        assert!(graph.node(inner).is_ok());

        graph.release_handle(outer);
        assert_eq!(graph.stats().signals, 0);
        assert_eq!(graph.garbage.len(), 2);
    }

    #[test]
    fn equal_writes_do_not_bump() {
        let mut graph = Graph::new();
        let source = state(&mut graph, 1);
        let derived = computed(&mut graph);
        compute(&mut graph, derived, &[source]);

        assert_eq!(graph.write(source, Rc::new(1)), Ok(false));
        assert_eq!(graph.nodes[source].updated_count, 0);
        assert_eq!(graph.nodes[derived].state, DirtyState::Clean);

        assert_eq!(graph.write(source, Rc::new(2)), Ok(true));
        assert_eq!(graph.nodes[source].updated_count, 1);
        assert_eq!(graph.nodes[derived].state, DirtyState::MaybeDirty);
    }

    #[test]
    fn writes_into_the_running_consumer_are_cycles() {
        let mut graph = Graph::new();
        let source = state(&mut graph, 1);
        let derived = computed(&mut graph);
        compute(&mut graph, derived, &[source]);

        graph.nodes[derived].computing = true;
        assert_eq!(graph.write(source, Rc::new(2)), Err(Error::Cycle(derived)));
    }

    #[test]
    fn watch_counts_propagate_to_dependencies() {
        let mut graph = Graph::new();
        let source = state(&mut graph, 1);
        let derived = computed(&mut graph);
        compute(&mut graph, derived, &[source]);

        graph.watch(derived);
        graph.watch(derived);
        assert_eq!(graph.nodes[derived].watch_count, 2);
        assert_eq!(graph.nodes[source].watch_count, 1);

        graph.unwatch(derived, 2);
        assert_eq!(graph.nodes[derived].watch_count, 0);
        assert_eq!(graph.nodes[source].watch_count, 0);
    }
}
