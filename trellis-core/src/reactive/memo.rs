//! Computed Implementation
//!
//! A [`Computed`] is a cached derived value that re-evaluates only when its
//! dependencies change. A [`Derived`] is the keyed form: one cached signal per
//! argument value, stored in the scope tree.
//!
//! # How Computeds Work
//!
//! 1. On first access, the computed runs its function and caches the outcome.
//!
//! 2. When accessed again, if no dependencies have changed, the cached value
//!    is returned.
//!
//! 3. When a dependency changes, the computed is marked MaybeDirty.
//!
//! 4. On next access, it re-checks its dirty dependencies in the order it
//!    first read them.
//!
//! 5. If one of them really changed, recompute. Otherwise, mark clean and
//!    return the cache.
//!
//! # Why This Matters
//!
//! This "lazy" approach avoids unnecessary recomputation:
//!
//! - A state changes
//! - 10 computeds depend on it
//! - Only the computeds actually read will recompute
//! - Computeds that are never read stay dirty (no wasted work)
//!
//! # Errors
//!
//! A failed computation is cached like a value. Reading it again returns the
//! same error until a dependency changes.

use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::rc::Rc;

use super::runtime;
use super::scope::{mark_unobserved, Definition};
use super::signal::{insert_node, Equality, Handle};
use crate::error::Result;
use crate::graph::{EqFn, NodeKind, Outcome, SignalId, SyncFn, Value};

fn sync_fn<T: 'static>(f: impl Fn() -> Result<T> + 'static) -> SyncFn {
    Rc::new(move || -> Outcome { f().map(|value| Rc::new(value) as Value) })
}

/// A cached derived value that recomputes only when dependencies change.
///
/// # Example
///
/// ```rust,ignore
/// let count = State::new(0);
/// let double = Computed::new(move || count.get() * 2);
///
/// assert_eq!(double.get(), 0);
/// ```
pub struct Computed<T> {
    handle: Rc<Handle>,
    _marker: PhantomData<T>,
}

impl<T: Clone + 'static> Computed<T> {
    /// Create a computed from an infallible function.
    ///
    /// The computation is not run immediately. It runs on first access.
    pub fn new(f: impl Fn() -> T + 'static) -> Self
    where
        T: PartialEq,
    {
        Self::with_equality(move || Ok(f()), Equality::default())
    }

    /// Create a computed whose function can fail.
    pub fn try_new(f: impl Fn() -> Result<T> + 'static) -> Self
    where
        T: PartialEq,
    {
        Self::with_equality(f, Equality::default())
    }

    pub fn with_equality(f: impl Fn() -> Result<T> + 'static, equality: Equality<T>) -> Self {
        Self {
            handle: insert_node(NodeKind::Computed(sync_fn(f)), equality.erase()),
            _marker: PhantomData,
        }
    }

    /// Wrap an existing node.
    pub(crate) fn from_id(id: SignalId) -> Self {
        Self {
            handle: Handle::retain(id),
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> SignalId {
        self.handle.id()
    }

    /// Get the current value, recomputing if necessary.
    ///
    /// # Panics
    ///
    /// Panics if the computation failed or forms a cycle. Use
    /// [`try_get`](Self::try_get) to handle those.
    pub fn get(&self) -> T {
        match self.try_get() {
            Ok(value) => value,
            Err(err) => panic!("computed signal failed: {err}"),
        }
    }

    pub fn try_get(&self) -> Result<T> {
        read_sync(self.id())
    }

    /// Bring the value up to date without recording a dependency.
    pub fn get_untracked(&self) -> Result<T> {
        runtime::check(self.id())?;
        runtime::downcast(&runtime::value(self.id())?)
    }
}

fn read_sync<T: Clone + 'static>(id: SignalId) -> Result<T> {
    runtime::read(id)?;
    runtime::downcast(&runtime::value(id)?)
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed").field("id", &self.handle.id()).finish()
    }
}

/// A derived function cached per argument value.
///
/// Each distinct argument gets its own signal, created on first call and
/// cached in the scope tree. Calls with equal arguments from the same scope
/// (or from any scope, if the function reads no context a scope overrides)
/// share that signal.
///
/// # Example
///
/// ```rust,ignore
/// let items = State::new(vec![1, 2, 3]);
/// let nth = Derived::new(move |index: &usize| Ok(items.get()[*index]));
///
/// assert_eq!(nth.get(1), 2);
/// ```
pub struct Derived<A, T> {
    inner: Rc<DerivedInner<A, T>>,
}

struct DerivedInner<A, T> {
    def: Definition<A>,
    compute: Rc<dyn Fn(&A) -> Result<T>>,
    equality: Equality<T>,
}

impl<A: Clone + 'static, T: Clone + 'static> Derived<A, T> {
    pub fn new(f: impl Fn(&A) -> Result<T> + 'static) -> Self
    where
        A: Hash + Eq,
        T: PartialEq,
    {
        Self::build(Definition::hashed(), Rc::new(f), Equality::default())
    }

    /// Identify calls by `key(args)` alone instead of hashing and comparing
    /// the arguments.
    pub fn with_key(
        key: impl Fn(&A) -> u64 + 'static,
        f: impl Fn(&A) -> Result<T> + 'static,
    ) -> Self
    where
        T: PartialEq,
    {
        Self::build(Definition::keyed(key), Rc::new(f), Equality::default())
    }

    pub fn with_equality(f: impl Fn(&A) -> Result<T> + 'static, equality: Equality<T>) -> Self
    where
        A: Hash + Eq,
    {
        Self::build(Definition::hashed(), Rc::new(f), equality)
    }

    fn build(
        def: Definition<A>,
        compute: Rc<dyn Fn(&A) -> Result<T>>,
        equality: Equality<T>,
    ) -> Self {
        Self {
            inner: Rc::new(DerivedInner {
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
            let f = sync_fn(move || compute(&args));
            (NodeKind::Computed(f), inner.equality.clone().erase())
        }
    }

    /// Get the value for `args`.
    ///
    /// # Panics
    ///
    /// Panics if the computation failed or forms a cycle.
    pub fn get(&self, args: A) -> T {
        match self.try_get(args) {
            Ok(value) => value,
            Err(err) => panic!("derived signal failed: {err}"),
        }
    }

    pub fn try_get(&self, args: A) -> Result<T> {
        let id = self.inner.def.resolve_fresh(&args, self.node_for());
        let value = read_sync(id);
        mark_unobserved(id);
        value
    }

    /// A handle to the signal for `args`. The handle keeps the signal alive
    /// even after a GC sweep drops it from the scope cache.
    pub fn signal(&self, args: A) -> Computed<T> {
        Computed::from_id(self.inner.def.resolve(&args, self.node_for()))
    }

    /// Whether a signal for `args` is cached for the current scope.
    pub fn is_cached(&self, args: &A) -> bool {
        self.inner.def.find(args).is_some()
    }
}

impl<A, T> Clone for Derived<A, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::reactive::{untracked, with_contexts, Context, State};
    use std::cell::Cell;

    fn counter() -> Rc<Cell<u32>> {
        Rc::new(Cell::new(0))
    }

    #[test]
    fn computed_caches_value() {
        let count = State::new(5);
        let runs = counter();
        let doubled = Computed::new({
            let (count, runs) = (count.clone(), runs.clone());
            move || {
                runs.set(runs.get() + 1);
                count.get() * 2
            }
        });

        assert_eq!(doubled.get(), 10);
        assert_eq!(doubled.get(), 10);
        assert_eq!(runs.get(), 1);

        count.set(6);
        assert_eq!(doubled.get(), 12);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn unchanged_intermediate_values_stop_recomputation() {
        let count = State::new(1);
        let parity = Computed::new({
            let count = count.clone();
            move || count.get() % 2
        });
        let runs = counter();
        let label = Computed::new({
            let (parity, runs) = (parity.clone(), runs.clone());
            move || {
                runs.set(runs.get() + 1);
                if parity.get() == 0 { "even" } else { "odd" }
            }
        });

        assert_eq!(label.get(), "odd");
        count.set(3);
        assert_eq!(label.get(), "odd");
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn errors_are_cached_until_inputs_change() {
        let divisor = State::new(0);
        let runs = counter();
        let quotient = Computed::try_new({
            let (divisor, runs) = (divisor.clone(), runs.clone());
            move || {
                runs.set(runs.get() + 1);
                match divisor.get() {
                    0 => Err(Error::msg("division by zero")),
                    d => Ok(10 / d),
                }
            }
        });

        assert_eq!(quotient.try_get(), Err(Error::msg("division by zero")));
        assert!(quotient.try_get().is_err());
        assert_eq!(runs.get(), 1);

        divisor.set(2);
        assert_eq!(quotient.try_get(), Ok(5));
    }

    #[test]
    fn dependencies_follow_the_latest_run() {
        let flag = State::new(true);
        let a = State::new(1);
        let b = State::new(2);
        let runs = counter();
        let pick = Computed::new({
            let (flag, a, b, runs) = (flag.clone(), a.clone(), b.clone(), runs.clone());
            move || {
                runs.set(runs.get() + 1);
                if flag.get() { a.get() } else { b.get() }
            }
        });

        assert_eq!(pick.get(), 1);
        flag.set(false);
        assert_eq!(pick.get(), 2);

        // `a` is no longer a dependency
        a.set(10);
        assert_eq!(pick.get(), 2);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn untracked_reads_do_not_subscribe() {
        let a = State::new(1);
        let b = State::new(1);
        let sum = Computed::new({
            let (a, b) = (a.clone(), b.clone());
            move || a.get() + untracked(|| b.get())
        });

        assert_eq!(sum.get(), 2);
        b.set(5);
        assert_eq!(sum.get(), 2);
        a.set(2);
        assert_eq!(sum.get(), 7);
    }

    #[test]
    fn derived_memoizes_per_argument() {
        let runs = counter();
        let square = Derived::new({
            let runs = runs.clone();
            move |n: &u32| {
                runs.set(runs.get() + 1);
                Ok(n * n)
            }
        });

        assert_eq!(square.get(3), 9);
        assert_eq!(square.get(3), 9);
        assert_eq!(runs.get(), 1);
        assert_eq!(square.get(4), 16);
        assert_eq!(runs.get(), 2);
        assert!(square.is_cached(&3));
        assert!(!square.is_cached(&5));
    }

    #[test]
    fn derived_signals_are_shared_by_handle() {
        let square = Derived::new(|n: &u32| Ok(n * n));
        let a = square.signal(2);
        let b = square.signal(2);
        assert_eq!(a.id(), b.id());
        assert_eq!(a.get(), 4);
    }

    #[test]
    fn context_reads_split_the_cache_by_scope() {
        let unit = Context::new("m");
        let runs = counter();
        let length = Derived::new({
            let (unit, runs) = (unit.clone(), runs.clone());
            move |n: &u32| {
                runs.set(runs.get() + 1);
                Ok(format!("{n}{}", unit.get()))
            }
        });

        assert_eq!(length.get(3), "3m");
        let scoped = with_contexts([unit.provide("ft")], || length.get(3));
        assert_eq!(scoped, "3ft");
        assert_eq!(length.get(3), "3m");
        assert_eq!(runs.get(), 2);
    }
}
