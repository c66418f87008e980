//! Graph Nodes
//!
//! This module defines the node record stored in the signal arena for every
//! signal, whatever its flavor.

use std::any::Any;
use std::cell::Cell;
use std::rc::Rc;
use std::task::Waker;

use futures_util::future::LocalBoxFuture;
use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;
use serde::Serialize;
use slotmap::new_key_type;
use smallvec::SmallVec;

use super::edge::{DirtyChain, Edge, Versions};
use crate::error::Error;
use crate::reactive::{ListenerId, RelayHooks};

new_key_type! {
    /// Stable identifier of a signal in the runtime arena.
    ///
    /// Ids are generational: once a signal is freed its id never resolves to
    /// a later signal occupying the same slot.
    pub struct SignalId;

    /// Identifier of a scope in the scope tree.
    pub struct ScopeId;
}

impl SignalId {
    /// Raw integer form, used by trace events.
    pub fn to_raw(self) -> u64 {
        use slotmap::Key;
        self.data().as_ffi()
    }
}

/// A type-erased signal value.
pub(crate) type Value = Rc<dyn Any>;

/// The cached outcome of a derivation.
pub(crate) type Outcome = Result<Value, Error>;

pub(crate) type EqFn = Rc<dyn Fn(&Value, &Value) -> bool>;
pub(crate) type SyncFn = Rc<dyn Fn() -> Outcome>;
pub(crate) type AsyncFn = Rc<dyn Fn() -> LocalBoxFuture<'static, Outcome>>;
pub(crate) type TaskFn = Rc<dyn Fn(Value) -> LocalBoxFuture<'static, Outcome>>;
pub(crate) type ActivateFn = Rc<dyn Fn(SignalId) -> RelayHooks>;
pub(crate) type ListenerFn = Rc<dyn Fn()>;

/// The flavor of a signal, as reported by stats and trace events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SignalKind {
    /// A mutable leaf.
    State,
    /// A synchronous derivation.
    Computed,
    /// A root consumer that carries listeners.
    Watcher,
    /// A future-backed derivation.
    Async,
    /// A future-backed derivation run explicitly with arguments.
    Task,
    /// An externally activated source.
    Relay,
}

/// How a node produces its value.
pub(crate) enum NodeKind {
    State,
    Computed(SyncFn),
    Watcher(SyncFn),
    Async(AsyncFn),
    Task(TaskFn),
    Relay(ActivateFn),
}

impl NodeKind {
    pub fn signal_kind(&self) -> SignalKind {
        match self {
            NodeKind::State => SignalKind::State,
            NodeKind::Computed(_) => SignalKind::Computed,
            NodeKind::Watcher(_) => SignalKind::Watcher,
            NodeKind::Async(_) => SignalKind::Async,
            NodeKind::Task(_) => SignalKind::Task,
            NodeKind::Relay(_) => SignalKind::Relay,
        }
    }
}

/// Dirty state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyState {
    /// The node's value is up-to-date.
    Clean,

    /// One of its dependencies changed, but we have not yet verified if the
    /// actual input values are different. The dirty chain says which ones.
    MaybeDirty,

    /// The node definitely needs to recompute. Its inputs have changed.
    Dirty,

    /// An async node whose check is blocked on a dependency that is still
    /// resolving. It is re-checked once that dependency settles.
    Pending,
}

/// Someone suspended on an async node's next settlement.
pub(crate) struct Awaiter {
    /// The async consumer that is awaiting, if the await happens inside one.
    pub consumer: Option<SignalId>,
    pub waker: Waker,
}

/// Result state of an async, task or relay node.
pub(crate) struct AsyncSlot {
    pub pending: bool,
    pub value: Option<Value>,
    pub error: Option<Error>,
    /// Bumped every time a new run starts. Runs carrying an older version are stale.
    pub version: u64,
    pub awaiters: SmallVec<[Awaiter; 2]>,
    /// Async consumers parked in [`DirtyState::Pending`] on this node.
    pub gated: SmallVec<[SignalId; 2]>,
}

impl AsyncSlot {
    pub fn new(initial: Option<Value>) -> Self {
        Self {
            pending: false,
            value: initial,
            error: None,
            version: 0,
            awaiters: SmallVec::new(),
            gated: SmallVec::new(),
        }
    }
}

pub(crate) struct RelayState {
    pub active: bool,
    pub hooks: Option<RelayHooks>,
}

/// Where a derived node sits in its owner scope's cache.
pub(crate) struct CacheEntry {
    pub def: u64,
    pub hash: u64,
    pub args: Value,
    /// Whether the owner's cache currently holds this node.
    pub cached: bool,
}

/// A node in the signal graph.
pub(crate) struct Node {
    pub kind: NodeKind,

    /// Cached outcome. `None` until the first computation.
    pub value: Option<Outcome>,
    pub equals: EqFn,
    pub state: DirtyState,

    /// Incoming edges, one per dependency, in first-read order.
    pub deps: IndexMap<SignalId, Edge, FxBuildHasher>,

    /// Consumers reading this node, with the consumer generation of the read.
    pub subs: IndexMap<SignalId, u64, FxBuildHasher>,
    pub dirty: DirtyChain,

    pub watch_count: u32,

    /// Live typed handles pointing at this node.
    pub handles: u32,

    /// Computation generation. Edges stamped with an older one are stale.
    pub compute_count: u64,

    /// Bumped when the observable value (including async pending flags) changes.
    pub updated_count: u64,

    /// Bumped when the settled value changes. Equal to `updated_count` for sync nodes.
    pub value_count: u64,
    pub computing: bool,

    /// Scope whose contexts this node reads.
    pub scope: ScopeId,

    /// Scope whose cache owns this node.
    pub owner: ScopeId,
    pub cache: Option<CacheEntry>,

    /// Context bits read by this node, directly or through its dependencies.
    pub ctx_mask: u64,

    /// Mask shared by every node created from the same derived function.
    pub def_mask: Option<Rc<Cell<u64>>>,
    pub async_slot: Option<AsyncSlot>,
    pub relay: Option<RelayState>,
    pub listeners: IndexMap<ListenerId, ListenerFn, FxBuildHasher>,
    pub last_notified: u64,
    pub gc_pending: bool,
}

impl Node {
    /// Create a node of the given kind, owned by and reading from `scope`.
    pub fn new(kind: NodeKind, equals: EqFn, scope: ScopeId) -> Self {
        let state = match kind {
            NodeKind::State => DirtyState::Clean,
            // Start dirty to ensure first computation
            _ => DirtyState::Dirty,
        };
        let async_slot = match kind {
            NodeKind::Async(_) | NodeKind::Task(_) | NodeKind::Relay(_) => {
                Some(AsyncSlot::new(None))
            }
            _ => None,
        };
        let relay = match kind {
            NodeKind::Relay(_) => Some(RelayState {
                active: false,
                hooks: None,
            }),
            _ => None,
        };
        Self {
            kind,
            value: None,
            equals,
            state,
            deps: IndexMap::default(),
            subs: IndexMap::default(),
            dirty: DirtyChain::default(),
            watch_count: 0,
            handles: 0,
            compute_count: 0,
            updated_count: 0,
            value_count: 0,
            computing: false,
            scope,
            owner: scope,
            cache: None,
            ctx_mask: 0,
            def_mask: None,
            async_slot,
            relay,
            listeners: IndexMap::default(),
            last_notified: 0,
            gc_pending: false,
        }
    }

    pub fn signal_kind(&self) -> SignalKind {
        self.kind.signal_kind()
    }

    pub fn is_async(&self) -> bool {
        self.async_slot.is_some()
    }

    pub fn is_pending(&self) -> bool {
        self.async_slot.as_ref().is_some_and(|slot| slot.pending)
    }

    pub fn versions(&self) -> Versions {
        Versions {
            updated: self.updated_count,
            value: self.value_count,
        }
    }

    pub fn mark_clean(&mut self) {
        self.state = DirtyState::Clean;
        self.dirty.clear();
    }

    /// Mark the node as definitely dirty (needs recomputation).
    pub fn mark_dirty(&mut self) {
        self.state = DirtyState::Dirty;
        self.dirty.clear();
    }

    /// Record an observable change.
    pub fn bump(&mut self, value_changed: bool) {
        self.updated_count += 1;
        if value_changed {
            self.value_count += 1;
        }
    }

    /// Whether the node has nothing keeping it alive.
    pub fn is_collectable(&self) -> bool {
        self.handles == 0
            && self.watch_count == 0
            && self.subs.is_empty()
            && !self.computing
            && !self.cache.as_ref().is_some_and(|entry| entry.cached)
    }
}
