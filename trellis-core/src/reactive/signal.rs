//! State Signals
//!
//! A [`State`] is the mutable leaf of the graph. It holds a value and
//! tracks which computations depend on it.
//!
//! # How State Works
//!
//! 1. Reading a state inside a computation records an edge from the state
//!    to that computation.
//!
//! 2. Writing a value that differs from the current one (per the state's
//!    [`Equality`]) bumps its version and marks every live consumer
//!    MaybeDirty. Nothing recomputes until someone pulls; watched watchers
//!    are pulled by the next flush.
//!
//! 3. A write that compares equal is dropped entirely: no version bump, no
//!    dirtying, no recomputation.
//!
//! # Memory Layout
//!
//! Handles are a shared pointer to the node id. The node lives in the
//! runtime arena and is freed once the last handle and the last consumer
//! are gone.

use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::runtime::{self, with_graph};
use crate::error::Result;
use crate::graph::{EqFn, Node, NodeKind, SignalId, Value};
use crate::persist;

/// How a signal decides that a new value is the same as the old one.
pub enum Equality<T> {
    /// Equal only if it is the very same stored value, so every write or
    /// recomputation counts as a change.
    Reference,
    /// Compare with a plain function, `PartialEq::eq` by default.
    Structural(fn(&T, &T) -> bool),
    /// Compare with a closure.
    Custom(Rc<dyn Fn(&T, &T) -> bool>),
}

impl<T: PartialEq> Default for Equality<T> {
    fn default() -> Self {
        Equality::Structural(<T as PartialEq>::eq)
    }
}

impl<T> Clone for Equality<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Reference => Self::Reference,
            Self::Structural(eq) => Self::Structural(*eq),
            Self::Custom(eq) => Self::Custom(eq.clone()),
        }
    }
}

impl<T> Debug for Equality<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reference => f.write_str("Reference"),
            Self::Structural(_) => f.write_str("Structural"),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl<T: 'static> Equality<T> {
    pub fn custom(eq: impl Fn(&T, &T) -> bool + 'static) -> Self {
        Self::Custom(Rc::new(eq))
    }

    pub(crate) fn erase(self) -> EqFn {
        match self {
            Self::Reference => Rc::new(|a: &Value, b: &Value| Rc::ptr_eq(a, b)),
            Self::Structural(eq) => Rc::new(move |a: &Value, b: &Value| {
                match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
                    (Some(a), Some(b)) => eq(a, b),
                    _ => false,
                }
            }),
            Self::Custom(eq) => Rc::new(move |a: &Value, b: &Value| {
                match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
                    (Some(a), Some(b)) => eq(a, b),
                    _ => false,
                }
            }),
        }
    }
}

/// A counted reference to a node. The node's handle count drops with it.
pub(crate) struct Handle {
    id: SignalId,
}

impl Handle {
    /// Take over the reference created together with the node.
    pub fn adopt(id: SignalId) -> Rc<Self> {
        Rc::new(Self { id })
    }

    /// Add a new reference to an existing node.
    pub fn retain(id: SignalId) -> Rc<Self> {
        with_graph(|g| g.retain_handle(id));
        Rc::new(Self { id })
    }

    pub fn id(&self) -> SignalId {
        self.id
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        runtime::release(self.id);
    }
}

/// Insert a node owned by the current scope, with one handle reference.
pub(crate) fn insert_node(kind: NodeKind, equals: EqFn) -> Rc<Handle> {
    let scope = super::context::ReactiveContext::current_scope();
    let id = with_graph(|g| {
        let scope = scope.unwrap_or(g.root);
        let mut node = Node::new(kind, equals, scope);
        node.handles = 1;
        g.insert(node)
    });
    Handle::adopt(id)
}

/// A mutable leaf signal holding a value of type T.
///
/// # Example
///
/// ```rust,ignore
/// let count = State::new(0);
///
/// // Read the value
/// let value = count.get();
///
/// // Update the value (dirties consumers)
/// count.set(5);
/// ```
pub struct State<T> {
    handle: Rc<Handle>,
    persist: Option<WriteBack<T>>,
    _marker: PhantomData<T>,
}

/// Writes a changed value back to the store under the state's key.
type WriteBack<T> = Rc<dyn Fn(&T)>;

impl<T: Clone + 'static> State<T> {
    /// Create a new state with the given initial value.
    pub fn new(value: T) -> Self
    where
        T: PartialEq,
    {
        Self::with_equality(value, Equality::default())
    }

    pub fn with_equality(value: T, equality: Equality<T>) -> Self {
        let handle = insert_node(NodeKind::State, equality.erase());
        with_graph(|g| {
            if let Some(node) = g.nodes.get_mut(handle.id()) {
                node.value = Some(Ok(Rc::new(value) as Value));
            }
        });
        Self {
            handle,
            persist: None,
            _marker: PhantomData,
        }
    }

    /// A state backed by the installed store.
    ///
    /// The initial value is read from `key` if present and decodable, else
    /// `default` is used. Every change is written back. Without a store this
    /// is a plain state.
    pub fn persisted(key: impl Into<String>, default: T) -> Self
    where
        T: PartialEq + Serialize + DeserializeOwned,
    {
        let key: Rc<str> = Rc::from(key.into());
        let initial = runtime::store()
            .and_then(|store| persist::load(store.as_ref(), &key))
            .unwrap_or(default);
        let mut state = Self::new(initial);
        state.persist = Some(Rc::new(move |value: &T| {
            if let Some(store) = runtime::store() {
                persist::save(store.as_ref(), &key, value);
            }
        }));
        state
    }

    pub fn id(&self) -> SignalId {
        self.handle.id()
    }

    /// Get the current value.
    ///
    /// If called within a computation, this also records the read.
    pub fn get(&self) -> T {
        match self.try_get() {
            Ok(value) => value,
            Err(err) => panic!("failed to read state: {err}"),
        }
    }

    pub fn try_get(&self) -> Result<T> {
        runtime::track(self.id(), crate::graph::EdgeKind::Read)?;
        self.get_untracked()
    }

    /// Get the current value without recording a dependency.
    pub fn get_untracked(&self) -> Result<T> {
        runtime::downcast(&runtime::value(self.id())?)
    }

    /// Set a new value and dirty consumers if it changed.
    ///
    /// # Panics
    ///
    /// Panics if the write dirties a computation that is currently running,
    /// i.e. a computation writes a state it has already read.
    pub fn set(&self, value: T) {
        if let Err(err) = self.try_set(value) {
            panic!("state write rejected: {err}");
        }
    }

    /// Like [`set`](Self::set), returning the protocol violation instead of panicking.
    ///
    /// Returns whether the value changed.
    pub fn try_set(&self, value: T) -> Result<bool> {
        let value = Rc::new(value);
        let changed = with_graph(|g| g.write(self.id(), value.clone() as Value))?;
        if let (true, Some(write_back)) = (changed, &self.persist) {
            write_back(&*value);
        }
        Ok(changed)
    }

    /// Update the value using a function of the current one.
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        let next = match self.get_untracked() {
            Ok(current) => f(&current),
            Err(err) => panic!("failed to read state: {err}"),
        };
        self.set(next);
    }
}

impl<T> Clone for State<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            persist: self.persist.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Clone + Debug + 'static> Debug for State<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("id", &self.id())
            .field("value", &self.get_untracked())
            .finish()
    }
}
