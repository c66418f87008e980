//! Trellis Core
//!
//! This crate provides the signal graph engine of the Trellis incremental
//! computation runtime. It implements:
//!
//! - Reactive primitives (states, computeds, watchers)
//! - Async derivations with staleness detection, tasks and relays
//! - Scoped contexts with per-scope caches of keyed derivations
//! - Watch-count driven liveness and idle-time garbage collection
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: Typed signal handles, dependency tracking and the runtime
//! - `graph`: The untyped signal graph, dirty propagation and scope tree
//! - `host`: Where the runtime schedules flushes and idle work
//! - `persist`: Storage for persisted states
//! - `trace`: Structured graph events for external tooling
//!
//! Every thread has its own runtime. Handles are `!Send`, and all graph
//! access happens on the thread that created the signal.
//!
//! # Example
//!
//! ```rust,ignore
//! use trellis_core::{Computed, ListenOptions, Runtime, State, Watcher};
//!
//! // Create a state
//! let count = State::new(0);
//!
//! // Create a derived value
//! let doubled = Computed::new({
//!     let count = count.clone();
//!     move || count.get() * 2
//! });
//!
//! // Watch it
//! let watcher = Watcher::new(move || doubled.get());
//! let _listener = watcher.listen(
//!     |value| println!("Doubled: {value:?}"),
//!     ListenOptions::default(),
//! );
//!
//! // Update the state and let the graph settle
//! count.set(5);
//! Runtime::settled().await; // prints "Doubled: Ok(10)"
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod host;
pub mod persist;
pub mod reactive;
pub mod trace;

pub use config::RuntimeConfig;
pub use error::{ConfigError, Error, PersistError, Result};
pub use graph::{DirtyState, GraphStats, ScopeId, SignalId, SignalKind};
pub use host::{DeferredHost, Host, TokioHost};
pub use persist::{MemoryStore, Store};
pub use reactive::{
    untracked, with_contexts, AsyncComputed, AsyncDerived, AsyncResult, AsyncState, ByIdentity,
    Computed, Context, ContextValue, Derived, Equality, ListenOptions, ListenerHandle, ListenerId,
    ReadyAsyncComputed, ReadyResult, Relay, RelayHooks, RelaySetter, Runtime, RuntimeBuilder,
    State, Task, Wait, Watcher,
};
pub use trace::{RecordingTracer, TraceEvent, Tracer};
