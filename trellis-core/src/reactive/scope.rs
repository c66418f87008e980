//! Contexts and Keyed Definitions
//!
//! A [`Context`] is an inheritable value looked up through the scope tree.
//! [`with_contexts`] runs a callback in a child scope that overrides some
//! contexts; keyed derivations created or read inside it resolve against
//! that scope.
//!
//! Keyed derivations ([`Derived`](super::Derived),
//! [`AsyncDerived`](super::AsyncDerived)) share a [`Definition`]: a stable id,
//! an argument fingerprint, and the context mask accumulated by every signal
//! created from it. The mask decides which scope owns each signal.

use std::cell::Cell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use rustc_hash::FxHasher;

use super::context::ReactiveContext;
use super::runtime::{self, with_graph};
use crate::graph::{CacheEntry, ContextKey, EqFn, Node, NodeKind, SignalId, Value};

/// An inheritable value, read from the nearest scope that provides it.
///
/// # Example
///
/// ```rust,ignore
/// let locale = Context::new(String::from("en"));
///
/// let greeting = Derived::new(move |name: &String| {
///     Ok(format!("{} ({})", name, locale.get()))
/// });
///
/// with_contexts([locale.provide("fr".into())], || greeting.get("Ana".into()));
/// ```
pub struct Context<T> {
    key: ContextKey,
    default: Rc<T>,
}

impl<T: Clone + 'static> Context<T> {
    pub fn new(default: T) -> Self {
        static KEYS: AtomicU32 = AtomicU32::new(0);
        Self {
            key: KEYS.fetch_add(1, Ordering::Relaxed),
            default: Rc::new(default),
        }
    }

    /// Read the value visible from the current scope.
    ///
    /// Inside a derivation this records the read, so the derivation is owned
    /// by a scope that provides this context.
    pub fn get(&self) -> T {
        let consumer = ReactiveContext::current_consumer();
        let scope = ReactiveContext::current_scope();
        let value = with_graph(|g| {
            let scope = scope.unwrap_or(g.root);
            g.read_context(consumer, scope, self.key)
        });
        match value {
            Ok(Some(value)) => value
                .downcast_ref::<T>()
                .cloned()
                .unwrap_or_else(|| T::clone(&self.default)),
            Ok(None) => T::clone(&self.default),
            Err(err) => {
                tracing::debug!(key = self.key, %err, "context read did not promote cleanly");
                T::clone(&self.default)
            }
        }
    }

    /// An override of this context, for [`with_contexts`].
    pub fn provide(&self, value: T) -> ContextValue
    where
        T: Hash,
    {
        let mut hasher = FxHasher::default();
        value.hash(&mut hasher);
        ContextValue {
            key: self.key,
            hash: hasher.finish(),
            value: Rc::new(value),
        }
    }
}

impl<T> Clone for Context<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            default: self.default.clone(),
        }
    }
}

impl<T> fmt::Debug for Context<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context").field("key", &self.key).finish()
    }
}

/// A context override produced by [`Context::provide`].
pub struct ContextValue {
    key: ContextKey,
    hash: u64,
    value: Value,
}

impl fmt::Debug for ContextValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextValue")
            .field("key", &self.key)
            .field("hash", &self.hash)
            .finish()
    }
}

/// Run `f` in a child of the current scope that overrides `values`.
///
/// Entering with the same overrides again reuses the same child scope, and
/// with it every derivation cached there.
pub fn with_contexts<R>(
    values: impl IntoIterator<Item = ContextValue>,
    f: impl FnOnce() -> R,
) -> R {
    let mut values: Vec<ContextValue> = values.into_iter().collect();
    values.sort_by_key(|value| value.key);

    let mut hasher = FxHasher::default();
    for value in &values {
        value.key.hash(&mut hasher);
        value.hash.hash(&mut hasher);
    }
    let hash = hasher.finish();
    let overrides = values.into_iter().map(|value| (value.key, value.value)).collect();

    let parent = ReactiveContext::current_scope();
    let child = with_graph(|g| {
        let parent = parent.unwrap_or(g.root);
        g.child_scope(parent, hash, overrides)
    });
    let _cx = ReactiveContext::in_scope(child);
    f()
}

/// Wraps a value so it is fingerprinted by identity instead of by content.
///
/// Useful for derivation arguments that are not `Hash`, or that are
/// expensive to hash.
pub struct ByIdentity<T>(pub Rc<T>);

impl<T> ByIdentity<T> {
    pub fn new(value: T) -> Self {
        Self(Rc::new(value))
    }
}

impl<T> Clone for ByIdentity<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> PartialEq for ByIdentity<T> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl<T> Eq for ByIdentity<T> {}

impl<T> Hash for ByIdentity<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Rc::as_ptr(&self.0), state);
    }
}

impl<T> std::ops::Deref for ByIdentity<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: fmt::Debug> fmt::Debug for ByIdentity<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ByIdentity").field(&self.0).finish()
    }
}

type Fingerprint<A> = Rc<dyn Fn(&A) -> u64>;
type SameArgs<A> = Rc<dyn Fn(&A, &A) -> bool>;

/// Identity and cache bookkeeping shared by every signal of one keyed derivation.
pub(crate) struct Definition<A> {
    id: u64,
    mask: Rc<Cell<u64>>,
    fingerprint: Fingerprint<A>,
    same_args: SameArgs<A>,
}

impl<A: Clone + 'static> Definition<A> {
    /// Fingerprint arguments structurally.
    pub fn hashed() -> Self
    where
        A: Hash + Eq,
    {
        Self::new(
            Rc::new(|args: &A| {
                let mut hasher = FxHasher::default();
                args.hash(&mut hasher);
                hasher.finish()
            }),
            Rc::new(|a: &A, b: &A| a == b),
        )
    }

    /// Identify arguments by a caller-supplied key only.
    pub fn keyed(key: impl Fn(&A) -> u64 + 'static) -> Self {
        Self::new(Rc::new(key), Rc::new(|_: &A, _: &A| true))
    }

    fn new(fingerprint: Fingerprint<A>, same_args: SameArgs<A>) -> Self {
        static IDS: AtomicU64 = AtomicU64::new(0);
        Self {
            id: IDS.fetch_add(1, Ordering::Relaxed),
            mask: Rc::new(Cell::new(0)),
            fingerprint,
            same_args,
        }
    }

    /// The cached signal for `args` as seen from the current scope, if any.
    pub fn find(&self, args: &A) -> Option<SignalId> {
        let hash = (self.fingerprint)(args);
        let scope = ReactiveContext::current_scope();
        with_graph(|g| {
            let scope = scope.unwrap_or(g.root);
            let owner = g.owner_for(scope, self.mask.get());
            g.lookup(owner, self.id, hash, &|cached| self.matches(cached, args))
        })
    }

    /// The signal for `args`, creating and caching it on a miss.
    pub fn resolve(&self, args: &A, make: impl FnOnce(A) -> (NodeKind, EqFn)) -> SignalId {
        if let Some(id) = self.find(args) {
            return id;
        }
        let hash = (self.fingerprint)(args);
        let scope = ReactiveContext::current_scope();
        let (kind, equals) = make(args.clone());
        with_graph(|g| {
            let scope = scope.unwrap_or(g.root);
            let mask = self.mask.get();
            let mut node = Node::new(kind, equals, scope);
            node.owner = g.owner_for(scope, mask);
            node.ctx_mask = mask;
            node.def_mask = Some(self.mask.clone());
            node.cache = Some(CacheEntry {
                def: self.id,
                hash,
                args: Rc::new(args.clone()),
                cached: false,
            });
            let id = g.insert(node);
            g.cache_insert(id);
            tracing::trace!(?id, def = self.id, hash, "keyed signal created");
            id
        })
    }

    /// The signal for `args`, brought up to date for the current scope.
    ///
    /// A signal shared with an ancestor scope can start reading a context the
    /// current scope overrides while it is checked. It then no longer serves
    /// this scope, and the call moves on to the signal cached for it.
    pub fn resolve_fresh(&self, args: &A, make: impl Fn(A) -> (NodeKind, EqFn)) -> SignalId {
        loop {
            let id = self.resolve(args, &make);
            // a failed check is reported again by the read that follows
            if runtime::check(id).is_err() || self.serves(id) {
                return id;
            }
            tracing::trace!(?id, def = self.id, "shared signal outgrown by the requesting scope");
            mark_unobserved(id);
        }
    }

    /// Whether `id` is owned by the scope the current scope resolves to.
    fn serves(&self, id: SignalId) -> bool {
        let scope = ReactiveContext::current_scope();
        with_graph(|g| {
            let scope = scope.unwrap_or(g.root);
            let owner = g.owner_for(scope, self.mask.get());
            g.nodes.get(id).map_or(true, |node| node.owner == owner)
        })
    }

    fn matches(&self, cached: &Value, args: &A) -> bool {
        cached
            .downcast_ref::<A>()
            .is_some_and(|cached| (self.same_args)(cached, args))
    }
}

/// After a read outside any derivation, leave the keyed signal to the cache GC.
pub(crate) fn mark_unobserved(id: SignalId) {
    if ReactiveContext::current_consumer().is_none() {
        with_graph(|g| g.maybe_free(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Outcome, SyncFn};
    use crate::reactive::signal::Equality;
    use crate::Runtime;

    fn constant(_: u32) -> (NodeKind, EqFn) {
        let compute: SyncFn = Rc::new(|| -> Outcome { Ok(Rc::new(0u32) as Value) });
        (NodeKind::Computed(compute), Equality::<u32>::default().erase())
    }

    #[test]
    fn providing_the_same_values_reuses_the_scope() {
        let theme = Context::new("light");
        let first = with_contexts([theme.provide("dark")], ReactiveContext::current_scope);
        let second = with_contexts([theme.provide("dark")], ReactiveContext::current_scope);
        let other = with_contexts([theme.provide("blue")], ReactiveContext::current_scope);
        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(Runtime::stats().scopes, 3);
    }

    #[test]
    fn unused_scopes_are_freed_by_the_sweep() {
        let theme = Context::new("light");
        let before = Runtime::stats().scopes;
        with_contexts([theme.provide("dark")], || {
            Runtime::run_gc();
            assert_eq!(Runtime::stats().scopes, before + 1);
            assert_eq!(theme.get(), "dark");
        });
        Runtime::run_gc();
        assert_eq!(Runtime::stats().scopes, before);
    }

    #[test]
    fn contexts_fall_back_to_their_default() {
        let theme = Context::new("light");
        assert_eq!(theme.get(), "light");
        with_contexts([theme.provide("dark")], || {
            assert_eq!(theme.get(), "dark");
            with_contexts([], || assert_eq!(theme.get(), "dark"));
        });
        assert_eq!(theme.get(), "light");
    }

    #[test]
    fn override_order_does_not_matter() {
        let a = Context::new(0);
        let b = Context::new(0);
        let first = with_contexts([a.provide(1), b.provide(2)], ReactiveContext::current_scope);
        let second = with_contexts([b.provide(2), a.provide(1)], ReactiveContext::current_scope);
        assert_eq!(first, second);
    }

    #[test]
    fn definitions_resolve_to_one_signal_per_argument() {
        let def = Definition::<u32>::hashed();
        let one = def.resolve(&1, constant);
        assert_eq!(def.resolve(&1, constant), one);
        assert_ne!(def.resolve(&2, constant), one);
        assert_eq!(def.find(&1), Some(one));
        assert_eq!(def.find(&3), None);
    }

    #[test]
    fn unmasked_definitions_are_shared_across_scopes() {
        let theme = Context::new(0);
        let def = Definition::<u32>::hashed();
        let root = def.resolve(&1, constant);
        let scoped = with_contexts([theme.provide(1)], || def.resolve(&1, constant));
        assert_eq!(root, scoped);
    }

    #[test]
    fn custom_keys_ignore_argument_equality() {
        let def = Definition::<ByIdentity<String>>::keyed(|args| args.len() as u64);
        let id = def.resolve(&ByIdentity::new("ab".into()), |_| constant(0));
        assert_eq!(def.find(&ByIdentity::new("cd".into())), Some(id));
    }

    #[test]
    fn by_identity_compares_pointers() {
        let a = ByIdentity::new(vec![1]);
        let b = ByIdentity::new(vec![1]);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_eq!(*a, vec![1]);
    }
}
