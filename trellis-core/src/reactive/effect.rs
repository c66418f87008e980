//! Watcher Implementation
//!
//! A Watcher is a root consumer: a derivation nobody else reads, used to
//! attach external listeners to the graph.
//!
//! # How Watchers Work
//!
//! 1. Attaching the first listener watches the watcher, which recursively
//!    watches everything it reads and queues it for a pull.
//!
//! 2. When any dependency changes, the watched watcher is pulled by the next
//!    flush. If its value changed it queues its listeners.
//!
//! 3. Listeners run in the batch phase, after every async derivation has
//!    settled, once per flush no matter how many writes led up to it.
//!
//! 4. Dropping the last listener unwatches the subgraph at the next flush,
//!    tearing down relays that nothing else watches.
//!
//! # Differences from Computed
//!
//! - Watchers are pulled by the flush loop; computeds only when read.
//! - By default a watcher notifies on every rerun, since its function is
//!   often a side effect returning `()`.

use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use super::listener::{self, ListenOptions, ListenerHandle};
use super::runtime::{self, with_graph};
use super::signal::{insert_node, Equality, Handle};
use crate::error::Result;
use crate::graph::{ListenerFn, NodeKind, Outcome, SignalId, SyncFn, Value};

/// A root consumer that external listeners attach to.
///
/// # Example
///
/// ```rust,ignore
/// let count = State::new(0);
///
/// let watcher = Watcher::new(move || count.get());
/// let _listener = watcher.listen(
///     |value| println!("Count is: {value:?}"),
///     ListenOptions::default(),
/// );
///
/// count.set(5);
/// Runtime::settled().await; // Prints: "Count is: Ok(5)"
/// ```
pub struct Watcher<T> {
    handle: Rc<Handle>,
    _marker: PhantomData<T>,
}

impl<T: Clone + 'static> Watcher<T> {
    /// Create a watcher that notifies on every rerun.
    pub fn new(f: impl Fn() -> T + 'static) -> Self {
        Self::with_equality(move || Ok(f()), Equality::Reference)
    }

    pub fn with_equality(f: impl Fn() -> Result<T> + 'static, equality: Equality<T>) -> Self {
        let compute: SyncFn =
            Rc::new(move || -> Outcome { f().map(|value| Rc::new(value) as Value) });
        Self {
            handle: insert_node(NodeKind::Watcher(compute), equality.erase()),
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> SignalId {
        self.handle.id()
    }

    /// Bring the watcher up to date and return its value.
    pub fn get(&self) -> Result<T> {
        runtime::check(self.id())?;
        runtime::downcast(&runtime::value(self.id())?)
    }

    /// Attach a listener, called with the watcher's value whenever it changes.
    ///
    /// The watcher is computed by the next flush (or right away with
    /// `immediate`); that first computation does not notify.
    pub fn listen(
        &self,
        callback: impl Fn(Result<T>) + 'static,
        options: ListenOptions,
    ) -> ListenerHandle {
        let id = self.id();
        let listener: ListenerFn = Rc::new(move || {
            let value = runtime::value(id).and_then(|value| runtime::downcast::<T>(&value));
            callback(value);
        });
        listener::attach(self.handle.clone(), listener, options)
    }

    /// Number of listeners currently attached.
    pub fn listener_count(&self) -> usize {
        with_graph(|g| g.nodes.get(self.id()).map_or(0, |node| node.listeners.len()))
    }
}

impl<T> Clone for Watcher<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Watcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher").field("id", &self.handle.id()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::State;
    use crate::Runtime;
    use std::cell::RefCell;

    #[tokio::test]
    async fn listeners_fire_after_changes() {
        let count = State::new(0);
        let watcher = Watcher::new({
            let count = count.clone();
            move || count.get()
        });
        let seen = Rc::new(RefCell::new(Vec::new()));
        let _listener = watcher.listen(
            {
                let seen = seen.clone();
                move |value| seen.borrow_mut().push(value.unwrap())
            },
            ListenOptions::default(),
        );

        Runtime::settled().await;
        assert!(seen.borrow().is_empty());

        count.set(1);
        Runtime::settled().await;
        assert_eq!(*seen.borrow(), vec![1]);
    }

    #[tokio::test]
    async fn immediate_listeners_run_on_attach() {
        let count = State::new(3);
        let watcher = Watcher::new({
            let count = count.clone();
            move || count.get() * 2
        });
        let seen = Rc::new(RefCell::new(Vec::new()));
        let _listener = watcher.listen(
            {
                let seen = seen.clone();
                move |value| seen.borrow_mut().push(value.unwrap())
            },
            ListenOptions { immediate: true },
        );
        assert_eq!(*seen.borrow(), vec![6]);

        // the flush after attaching must not repeat the immediate call
        Runtime::settled().await;
        assert_eq!(*seen.borrow(), vec![6]);
    }

    #[tokio::test]
    async fn structural_watchers_skip_equal_values() {
        let count = State::new(1);
        let watcher = Watcher::with_equality(
            {
                let count = count.clone();
                move || Ok(count.get() % 2)
            },
            Equality::default(),
        );
        let calls = Rc::new(RefCell::new(0));
        let _listener = watcher.listen(
            {
                let calls = calls.clone();
                move |_| *calls.borrow_mut() += 1
            },
            ListenOptions::default(),
        );
        Runtime::settled().await;

        count.set(3);
        Runtime::settled().await;
        assert_eq!(*calls.borrow(), 0);

        count.set(4);
        Runtime::settled().await;
        assert_eq!(*calls.borrow(), 1);
    }

    #[tokio::test]
    async fn dropping_the_listener_unwatches() {
        let count = State::new(0);
        let watcher = Watcher::new({
            let count = count.clone();
            move || count.get()
        });
        let listener = watcher.listen(|_| {}, ListenOptions::default());
        Runtime::settled().await;
        assert_eq!(watcher.listener_count(), 1);
        assert_eq!(Runtime::stats().watched, 2);

        drop(listener);
        Runtime::settled().await;
        assert_eq!(watcher.listener_count(), 0);
        assert_eq!(Runtime::stats().watched, 0);
    }
}
