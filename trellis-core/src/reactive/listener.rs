//! Listener types for watchers.
//!
//! A listener is an external callback attached to a [`Watcher`](super::Watcher).
//! Each attached listener holds one watch on the watcher, so the watched
//! subgraph stays live exactly as long as someone is listening.

use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::runtime::{self, with_graph};
use super::signal::Handle;
use crate::graph::ListenerFn;

/// Unique identifier for a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Generate a new unique listener ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Options for [`Watcher::listen`](super::Watcher::listen).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Compute the watcher right away and call the listener once with the
    /// current value before returning.
    pub immediate: bool,
}

/// Keeps a listener attached. Dropping it detaches the listener and releases
/// its watch at the next flush.
#[must_use = "the listener is detached when the handle is dropped"]
pub struct ListenerHandle {
    watcher: Rc<Handle>,
    id: ListenerId,
}

impl ListenerHandle {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Detach the listener now.
    pub fn detach(self) {}
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        let watcher = self.watcher.id();
        let id = self.id;
        with_graph(|g| {
            let Some(node) = g.nodes.get_mut(watcher) else {
                return;
            };
            if node.listeners.shift_remove(&id).is_some() {
                g.queues.schedule_unwatch(watcher, 1);
            }
        });
    }
}

/// Attach `listener` to the watcher behind `watcher` and watch it.
pub(crate) fn attach(
    watcher: Rc<Handle>,
    listener: ListenerFn,
    options: ListenOptions,
) -> ListenerHandle {
    let id = ListenerId::new();
    let signal = watcher.id();
    with_graph(|g| {
        let Some(node) = g.nodes.get_mut(signal) else {
            return;
        };
        if node.watch_count == 0 {
            // the next pull only establishes the baseline
            node.last_notified = 0;
        }
        node.listeners.insert(id, listener.clone());
        g.watch(signal);
    });
    tracing::trace!(watcher = ?signal, listener = ?id, "listener attached");

    if options.immediate {
        if let Err(err) = runtime::check(signal) {
            tracing::debug!(watcher = ?signal, %err, "immediate watcher check failed");
        }
        with_graph(|g| {
            if let Some(node) = g.nodes.get_mut(signal) {
                node.last_notified = node.updated_count;
            }
        });
        listener();
    }
    ListenerHandle { watcher, id }
}
