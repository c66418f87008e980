//! Reactive Primitives
//!
//! This module implements the typed surface of the signal graph: states,
//! computeds, async derivations, tasks, relays, watchers and contexts.
//!
//! # Concepts
//!
//! ## States
//!
//! A [`State`] is a container for mutable values. When a state is read within
//! a tracking context (a computed, an async computed, a watcher), the state
//! registers that context as a consumer. Writing a different value dirties
//! every consumer.
//!
//! ## Computeds
//!
//! A [`Computed`] is a derived value that caches its result. It re-evaluates
//! only when one of its dependencies really changed, and only when read.
//! [`Derived`] caches one computed per argument value.
//!
//! ## Async Derivations
//!
//! [`AsyncComputed`] wraps a future. Reading it returns an [`AsyncResult`]
//! snapshot; awaiting [`wait`](AsyncComputed::wait) suspends until it
//! settles. A [`Task`] is the explicitly run variant, a [`Relay`] the
//! push-driven one.
//!
//! ## Watchers
//!
//! A [`Watcher`] is the root that external listeners attach to. Watching a
//! watcher keeps its subgraph live: watched nodes are pulled by the flush
//! loop, unwatched ones stay lazy and become garbage-collectable.
//!
//! # Implementation Notes
//!
//! The reactive system uses a thread-local tracking context to automatically
//! detect dependencies. When a signal is read, we check if there is an active
//! tracking context and, if so, register the dependency. The graph itself
//! lives in a thread-local runtime; see [`Runtime`].

mod async_computed;
mod async_result;
mod context;
mod effect;
mod flush;
mod listener;
mod memo;
mod relay;
mod runtime;
mod scope;
mod signal;
mod task;

pub use async_computed::{AsyncComputed, AsyncDerived, ReadyAsyncComputed};
pub use async_result::{AsyncResult, AsyncState, ReadyResult, Wait};
pub use context::untracked;
pub use effect::Watcher;
pub use listener::{ListenOptions, ListenerHandle, ListenerId};
pub use memo::{Computed, Derived};
pub use relay::{Relay, RelayHooks, RelaySetter};
pub use runtime::{Runtime, RuntimeBuilder};
pub use scope::{with_contexts, ByIdentity, Context, ContextValue};
pub use signal::{Equality, State};
pub use task::Task;
