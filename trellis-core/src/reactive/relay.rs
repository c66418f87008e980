//! Relays
//!
//! A [`Relay`] bridges an external push source (a socket, a timer, a
//! subscription) into the graph. Its activation callback runs when the relay
//! gains its first watcher and receives a [`RelaySetter`] to push values
//! through. The [`RelayHooks`] it returns are called when a dependency read
//! during activation changes, and when the last watcher goes away.
//!
//! An unwatched relay is never activated. Reading one returns whatever was
//! last pushed, or an idle snapshot.

use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use super::async_result::{self, AsyncResult, Wait};
use super::runtime::with_graph;
use super::signal::{insert_node, Equality, Handle};
use crate::error::{Error, Result};
use crate::graph::{ActivateFn, NodeKind, SignalId, Value};

/// Callbacks returned by a relay's activation.
#[derive(Default)]
pub struct RelayHooks {
    pub(crate) update: Option<Rc<dyn Fn()>>,
    deactivate: Option<Box<dyn FnOnce()>>,
}

impl RelayHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called when a dependency read during activation (or a previous update)
    /// changes. Reads inside `f` become the relay's new dependencies.
    ///
    /// Without an update hook the relay is deactivated and activated again.
    pub fn on_update(mut self, f: impl Fn() + 'static) -> Self {
        self.update = Some(Rc::new(f));
        self
    }

    /// Called once when the relay loses its last watcher.
    pub fn on_deactivate(mut self, f: impl FnOnce() + 'static) -> Self {
        self.deactivate = Some(Box::new(f));
        self
    }

    pub(crate) fn deactivate(self) {
        if let Some(f) = self.deactivate {
            f();
        }
    }
}

impl fmt::Debug for RelayHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayHooks")
            .field("update", &self.update.is_some())
            .field("deactivate", &self.deactivate.is_some())
            .finish()
    }
}

/// Pushes values into an active relay.
pub struct RelaySetter<T> {
    id: SignalId,
    _marker: PhantomData<T>,
}

impl<T: 'static> RelaySetter<T> {
    fn new(id: SignalId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// Settle the relay with `value`.
    ///
    /// Ignored once the relay has been deactivated or released.
    ///
    /// # Panics
    ///
    /// Panics if the push dirties a computation that is currently running.
    pub fn set(&self, value: T) {
        self.push(Ok(Rc::new(value) as Value));
    }

    /// Settle the relay with an error.
    pub fn set_error(&self, error: Error) {
        self.push(Err(error));
    }

    fn push(&self, outcome: Result<Value>) {
        let id = self.id;
        let pushed = with_graph(|g| {
            let active = g
                .nodes
                .get(id)
                .and_then(|node| node.relay.as_ref())
                .is_some_and(|relay| relay.active);
            if !active {
                return Ok(false);
            }
            g.resolve(id, outcome).map(|()| true)
        });
        match pushed {
            Ok(true) => {}
            Ok(false) => tracing::debug!(?id, "ignoring push into an inactive relay"),
            Err(err) => panic!("relay push rejected: {err}"),
        }
    }
}

impl<T> Clone for RelaySetter<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for RelaySetter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelaySetter").field("id", &self.id).finish()
    }
}

/// A signal fed by an external source while it is watched.
///
/// # Example
///
/// ```rust,ignore
/// let ticks = Relay::new(|set: RelaySetter<u64>| {
///     let timer = Timer::every(Duration::from_secs(1), move |n| set.set(n));
///     RelayHooks::new().on_deactivate(move || timer.cancel())
/// });
/// ```
pub struct Relay<T> {
    handle: Rc<Handle>,
    _marker: PhantomData<T>,
}

impl<T: Clone + 'static> Relay<T> {
    pub fn new(activate: impl Fn(RelaySetter<T>) -> RelayHooks + 'static) -> Self
    where
        T: PartialEq,
    {
        Self::with_equality(activate, Equality::default())
    }

    pub fn with_equality(
        activate: impl Fn(RelaySetter<T>) -> RelayHooks + 'static,
        equality: Equality<T>,
    ) -> Self {
        let activate: ActivateFn = Rc::new(move |id| activate(RelaySetter::new(id)));
        Self {
            handle: insert_node(NodeKind::Relay(activate), equality.erase()),
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> SignalId {
        self.handle.id()
    }

    /// The last pushed value. Pending while an active relay has not pushed yet.
    pub fn get(&self) -> AsyncResult<T> {
        async_result::read(self.id()).unwrap_or_else(|error| AsyncResult {
            value: None,
            error: Some(error),
            pending: false,
        })
    }

    /// Wait for the first push after activation.
    pub fn wait(&self) -> Wait<T> {
        Wait::new(self.handle.clone())
    }

    pub fn is_active(&self) -> bool {
        with_graph(|g| {
            g.nodes
                .get(self.id())
                .and_then(|node| node.relay.as_ref())
                .is_some_and(|relay| relay.active)
        })
    }
}

impl<T> Clone for Relay<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Relay<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay").field("id", &self.handle.id()).finish()
    }
}
