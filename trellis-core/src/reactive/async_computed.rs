//! Async Computeds
//!
//! Future-backed derivations. The future is created inside a tracked context
//! and polled by the runtime; every signal it reads, before or after an
//! await point, becomes a dependency of the async signal.
//!
//! When a dependency changes, a watched async signal starts a new run in the
//! next flush; an unwatched one starts it on the next read. Runs are
//! versioned: a run that finishes after a newer one started is discarded.

use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::marker::PhantomData;
use std::rc::Rc;

use futures_util::future::LocalBoxFuture;

use super::async_result::{self, AsyncResult, ReadyResult, Wait};
use super::runtime::with_graph;
use super::scope::{mark_unobserved, Definition};
use super::signal::{insert_node, Equality, Handle};
use crate::error::Result;
use crate::graph::{AsyncFn, EqFn, NodeKind, Outcome, SignalId, Value};

fn async_fn<T, Fut>(f: impl Fn() -> Fut + 'static) -> AsyncFn
where
    T: 'static,
    Fut: Future<Output = Result<T>> + 'static,
{
    Rc::new(move || -> LocalBoxFuture<'static, Outcome> {
        let future = f();
        Box::pin(async move { future.await.map(|value| Rc::new(value) as Value) })
    })
}

/// An async derivation.
///
/// # Example
///
/// ```rust,ignore
/// let user_id = State::new(1);
/// let profile = AsyncComputed::new(move || {
///     let id = user_id.get();
///     async move { fetch_profile(id).await }
/// });
///
/// let snapshot = profile.get(); // pending on first read
/// let profile = profile.wait().await?;
/// ```
pub struct AsyncComputed<T> {
    handle: Rc<Handle>,
    _marker: PhantomData<T>,
}

impl<T: Clone + 'static> AsyncComputed<T> {
    pub fn new<Fut>(f: impl Fn() -> Fut + 'static) -> Self
    where
        T: PartialEq,
        Fut: Future<Output = Result<T>> + 'static,
    {
        Self::with_equality(f, Equality::default())
    }

    pub fn with_equality<Fut>(f: impl Fn() -> Fut + 'static, equality: Equality<T>) -> Self
    where
        Fut: Future<Output = Result<T>> + 'static,
    {
        Self {
            handle: insert_node(NodeKind::Async(async_fn(f)), equality.erase()),
            _marker: PhantomData,
        }
    }

    /// Give the signal an initial value, served until the first run resolves.
    pub fn with_initial(self, initial: T) -> ReadyAsyncComputed<T> {
        with_graph(|g| {
            if let Some(slot) = g.nodes.get_mut(self.id()).and_then(|n| n.async_slot.as_mut()) {
                if slot.value.is_none() {
                    slot.value = Some(Rc::new(initial.clone()) as Value);
                }
            }
        });
        ReadyAsyncComputed {
            inner: self,
            initial: Rc::new(initial),
        }
    }

    pub(crate) fn from_id(id: SignalId) -> Self {
        Self {
            handle: Handle::retain(id),
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> SignalId {
        self.handle.id()
    }

    /// The current snapshot, starting a run if the signal is out of date.
    pub fn get(&self) -> AsyncResult<T> {
        match async_result::read(self.id()) {
            Ok(result) => result,
            Err(error) => AsyncResult {
                value: None,
                error: Some(error),
                pending: false,
            },
        }
    }

    /// Wait for the signal to settle and return its outcome.
    pub fn wait(&self) -> Wait<T> {
        Wait::new(self.handle.clone())
    }
}

impl<T> Clone for AsyncComputed<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for AsyncComputed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncComputed")
            .field("id", &self.handle.id())
            .finish()
    }
}

/// An async derivation that always has a value to serve.
pub struct ReadyAsyncComputed<T> {
    inner: AsyncComputed<T>,
    initial: Rc<T>,
}

impl<T: Clone + 'static> ReadyAsyncComputed<T> {
    pub fn with_initial<Fut>(initial: T, f: impl Fn() -> Fut + 'static) -> Self
    where
        T: PartialEq,
        Fut: Future<Output = Result<T>> + 'static,
    {
        AsyncComputed::new(f).with_initial(initial)
    }

    pub fn id(&self) -> SignalId {
        self.inner.id()
    }

    pub fn get(&self) -> ReadyResult<T> {
        let result = self.inner.get();
        ReadyResult {
            value: result.value.unwrap_or_else(|| T::clone(&self.initial)),
            error: result.error,
            pending: result.pending,
        }
    }

    pub fn wait(&self) -> Wait<T> {
        self.inner.wait()
    }
}

impl<T> Clone for ReadyAsyncComputed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            initial: self.initial.clone(),
        }
    }
}

type AsyncBody<A, T> = Rc<dyn Fn(&A) -> LocalBoxFuture<'static, Result<T>>>;

/// An async derivation cached per argument value, like [`Derived`](super::Derived).
pub struct AsyncDerived<A, T> {
    inner: Rc<AsyncDerivedInner<A, T>>,
}

struct AsyncDerivedInner<A, T> {
    def: Definition<A>,
    compute: AsyncBody<A, T>,
    equality: Equality<T>,
}

impl<A: Clone + 'static, T: Clone + 'static> AsyncDerived<A, T> {
    pub fn new<Fut>(f: impl Fn(&A) -> Fut + 'static) -> Self
    where
        A: Hash + Eq,
        T: PartialEq,
        Fut: Future<Output = Result<T>> + 'static,
    {
        Self::build(Definition::hashed(), f, Equality::default())
    }

    pub fn with_equality<Fut>(f: impl Fn(&A) -> Fut + 'static, equality: Equality<T>) -> Self
    where
        A: Hash + Eq,
        Fut: Future<Output = Result<T>> + 'static,
    {
        Self::build(Definition::hashed(), f, equality)
    }

    /// Identify calls by `key(args)` alone.
    pub fn with_key<Fut>(
        key: impl Fn(&A) -> u64 + 'static,
        f: impl Fn(&A) -> Fut + 'static,
    ) -> Self
    where
        T: PartialEq,
        Fut: Future<Output = Result<T>> + 'static,
    {
        Self::build(Definition::keyed(key), f, Equality::default())
    }

    fn build<Fut>(
        def: Definition<A>,
        f: impl Fn(&A) -> Fut + 'static,
        equality: Equality<T>,
    ) -> Self
    where
        Fut: Future<Output = Result<T>> + 'static,
    {
        let compute: AsyncBody<A, T> =
            Rc::new(move |args: &A| -> LocalBoxFuture<'static, Result<T>> { Box::pin(f(args)) });
        Self {
            inner: Rc::new(AsyncDerivedInner {
                def,
                compute,
                equality,
            }),
        }
    }

    fn node_for(&self) -> impl Fn(A) -> (NodeKind, EqFn) + '_ {
        let inner = &self.inner;
        move |args| {
            let compute = inner.compute.clone();
            let f = async_fn(move || compute(&args));
            (NodeKind::Async(f), inner.equality.clone().erase())
        }
    }

    pub fn get(&self, args: A) -> AsyncResult<T> {
        let id = self.inner.def.resolve_fresh(&args, self.node_for());
        let result = async_result::read(id);
        mark_unobserved(id);
        result.unwrap_or_else(|error| AsyncResult {
            value: None,
            error: Some(error),
            pending: false,
        })
    }

    /// Wait for the signal for `args` to settle. Starts its run right away.
    pub fn wait(&self, args: A) -> Wait<T> {
        Wait::new(Handle::retain(self.inner.def.resolve_fresh(&args, self.node_for())))
    }

    pub fn signal(&self, args: A) -> AsyncComputed<T> {
        AsyncComputed::from_id(self.inner.def.resolve(&args, self.node_for()))
    }

    pub fn is_cached(&self, args: &A) -> bool {
        self.inner.def.find(args).is_some()
    }
}

impl<A, T> Clone for AsyncDerived<A, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}
