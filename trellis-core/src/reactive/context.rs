//! Reactive Context
//!
//! The reactive context tracks which computation is currently running and
//! which scope it runs in. This enables automatic dependency tracking: when a
//! signal is read, the current consumer gets an edge to it, and keyed
//! derivations and context reads resolve against the current scope.
//!
//! # Implementation
//!
//! We use a thread-local stack. Entering a computation (a derived run, an
//! async poll, a relay hook) pushes an entry; dropping the guard pops it.
//! Entries are saved and restored around every entry into user code, so a
//! future suspended at an await point never leaves its entry behind.
//!
//! This design supports nested reactive contexts (e.g., a computed that reads
//! from another computed that has to recompute first).

use std::cell::RefCell;

use crate::graph::{ScopeId, SignalId};

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<ContextEntry>> = const { RefCell::new(Vec::new()) };
}

/// An entry in the reactive context stack.
#[derive(Debug, Clone, Copy)]
struct ContextEntry {
    /// The computation that reads are tracked against, if any.
    consumer: Option<SignalId>,
    /// The scope derivations and contexts resolve against. `None` means the root.
    scope: Option<ScopeId>,
}

/// Guard that pops the context when dropped.
///
/// This ensures the context stack is properly maintained even if
/// the computation panics.
pub(crate) struct ReactiveContext {
    consumer: Option<SignalId>,
}

impl ReactiveContext {
    /// Enter a computation. Reads are tracked against `consumer` until the
    /// guard is dropped.
    pub fn enter(consumer: Option<SignalId>, scope: Option<ScopeId>) -> Self {
        CONTEXT_STACK.with(|stack| {
            stack.borrow_mut().push(ContextEntry { consumer, scope });
        });
        Self { consumer }
    }

    /// Keep the current scope but stop tracking reads.
    pub fn untracked() -> Self {
        Self::enter(None, Self::current_scope())
    }

    /// Keep the current consumer but switch to `scope`.
    pub fn in_scope(scope: ScopeId) -> Self {
        Self::enter(Self::current_consumer(), Some(scope))
    }

    /// Whether reads are currently being tracked.
    pub fn is_active() -> bool {
        Self::current_consumer().is_some()
    }

    pub fn current_consumer() -> Option<SignalId> {
        CONTEXT_STACK.with(|stack| stack.borrow().last().and_then(|entry| entry.consumer))
    }

    pub fn current_scope() -> Option<ScopeId> {
        CONTEXT_STACK.with(|stack| stack.borrow().last().and_then(|entry| entry.scope))
    }

    /// Every scope on the stack, outermost first.
    pub fn entered_scopes() -> Vec<ScopeId> {
        CONTEXT_STACK.with(|stack| stack.borrow().iter().filter_map(|entry| entry.scope).collect())
    }
}

impl Drop for ReactiveContext {
    fn drop(&mut self) {
        let _ = CONTEXT_STACK.try_with(|stack| {
            let popped = stack.borrow_mut().pop();

            // Verify we're popping the right context.
            if let Some(entry) = popped {
                debug_assert_eq!(
                    entry.consumer, self.consumer,
                    "ReactiveContext mismatch: expected {:?}, got {:?}",
                    self.consumer, entry.consumer
                );
            }
        });
    }
}

/// Run `f` without tracking any reads it makes.
///
/// ```rust,ignore
/// let total = Computed::new(move || {
///     // `limit` changes do not recompute `total`
///     let limit = untracked(|| limit.get());
///     items.get().iter().take(limit).sum::<u32>()
/// });
/// ```
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    let _cx = ReactiveContext::untracked();
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn ids() -> (SignalId, SignalId, ScopeId) {
        let mut signals: SlotMap<SignalId, ()> = SlotMap::with_key();
        let mut scopes: SlotMap<ScopeId, ()> = SlotMap::with_key();
        (signals.insert(()), signals.insert(()), scopes.insert(()))
    }

    #[test]
    fn context_tracks_consumer() {
        let (id, _, scope) = ids();

        assert!(!ReactiveContext::is_active());
        assert!(ReactiveContext::current_consumer().is_none());

        {
            let _ctx = ReactiveContext::enter(Some(id), Some(scope));

            assert!(ReactiveContext::is_active());
            assert_eq!(ReactiveContext::current_consumer(), Some(id));
            assert_eq!(ReactiveContext::current_scope(), Some(scope));
        }

        // Context should be cleaned up after drop
        assert!(!ReactiveContext::is_active());
        assert!(ReactiveContext::current_scope().is_none());
    }

    #[test]
    fn nested_contexts() {
        let (id1, id2, _) = ids();

        {
            let _ctx1 = ReactiveContext::enter(Some(id1), None);
            assert_eq!(ReactiveContext::current_consumer(), Some(id1));

            {
                let _ctx2 = ReactiveContext::enter(Some(id2), None);
                assert_eq!(ReactiveContext::current_consumer(), Some(id2));
            }

            // After inner context drops, outer should be current
            assert_eq!(ReactiveContext::current_consumer(), Some(id1));
        }

        assert!(ReactiveContext::current_consumer().is_none());
    }

    #[test]
    fn untracked_keeps_the_scope() {
        let (id, _, scope) = ids();
        let _ctx = ReactiveContext::enter(Some(id), Some(scope));

        untracked(|| {
            assert!(!ReactiveContext::is_active());
            assert_eq!(ReactiveContext::current_scope(), Some(scope));
        });
        assert!(ReactiveContext::is_active());
    }

    #[test]
    fn in_scope_keeps_the_consumer() {
        let (id, _, scope) = ids();
        let _ctx = ReactiveContext::enter(Some(id), None);
        let _scoped = ReactiveContext::in_scope(scope);

        assert_eq!(ReactiveContext::current_consumer(), Some(id));
        assert_eq!(ReactiveContext::current_scope(), Some(scope));
    }
}
