//! Flush Queues
//!
//! Mutations never recompute anything eagerly. They drop work into the typed
//! queues below and ask for a flush; the flush loop in
//! [`reactive::flush`](crate::reactive) drains them in two phases:
//!
//! 1. Pull phase, repeated until quiet: start async recomputations
//!    (`async_pulls`), then resolve watchers (`pulls`).
//! 2. Batch phase, once nothing is left to pull and no live task is running:
//!    apply queued unwatch counts, run listener callbacks, flush the tracer.
//!
//! Both pull queues are insertion-ordered sets, so a signal dirtied by several
//! writes in the same turn is pulled once.

use std::rc::Rc;

use futures_util::future::LocalBoxFuture;
use indexmap::{IndexMap, IndexSet};
use rustc_hash::FxBuildHasher;
use smallvec::SmallVec;

use super::node::{ActivateFn, AsyncFn, ListenerFn, Outcome, SyncFn, TaskFn};
use super::{Graph, NodeKind, ScopeId, SignalId};
use crate::error::{Error, Result};
use crate::trace::TraceEvent;

/// Work waiting for the next flush.
#[derive(Default)]
pub(crate) struct Queues {
    pub pulls: IndexSet<SignalId, FxBuildHasher>,
    pub async_pulls: IndexSet<SignalId, FxBuildHasher>,
    pub unwatch: IndexMap<SignalId, u32, FxBuildHasher>,
    pub listeners: Vec<ListenerFn>,

    /// Set when a flush has been requested and has not run yet.
    pub flush_requested: bool,

    /// Set when an async node settled since the flush loop last looked.
    pub resolved: bool,

    /// A sweep is pending for the next idle period.
    pub gc_scheduled: bool,

    /// A sweep was scheduled but not yet handed to the host.
    pub gc_requested: bool,
}

/// One pull round's worth of work.
pub(crate) struct PullRound {
    pub async_pulls: Vec<SignalId>,
    pub pulls: Vec<SignalId>,
}

impl PullRound {
    pub fn is_empty(&self) -> bool {
        self.async_pulls.is_empty() && self.pulls.is_empty()
    }
}

/// The batch phase's worth of work.
pub(crate) struct Batch {
    pub unwatch: Vec<(SignalId, u32)>,
    pub listeners: Vec<ListenerFn>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.unwatch.is_empty() && self.listeners.is_empty()
    }
}

impl Queues {
    pub fn schedule_pull(&mut self, id: SignalId) {
        self.pulls.insert(id);
        self.flush_requested = true;
    }

    pub fn schedule_async_pull(&mut self, id: SignalId) {
        self.async_pulls.insert(id);
        self.flush_requested = true;
    }

    pub fn schedule_unwatch(&mut self, id: SignalId, count: u32) {
        *self.unwatch.entry(id).or_insert(0) += count;
        self.flush_requested = true;
    }

    pub fn schedule_listeners(&mut self, listeners: impl IntoIterator<Item = ListenerFn>) {
        self.listeners.extend(listeners);
        self.flush_requested = true;
    }

    pub fn take_round(&mut self) -> PullRound {
        PullRound {
            async_pulls: self.async_pulls.drain(..).collect(),
            pulls: self.pulls.drain(..).collect(),
        }
    }

    pub fn take_batch(&mut self) -> Batch {
        Batch {
            unwatch: self.unwatch.drain(..).collect(),
            listeners: std::mem::take(&mut self.listeners),
        }
    }

    /// Whether anything at all is queued.
    pub fn has_work(&self) -> bool {
        !self.pulls.is_empty()
            || !self.async_pulls.is_empty()
            || !self.unwatch.is_empty()
            || !self.listeners.is_empty()
            || self.resolved
    }
}

/// An in-flight async computation.
pub(crate) struct TaskSlot {
    pub signal: SignalId,
    pub version: u64,

    /// Whether reads during polls are tracked against `signal`.
    pub tracked: bool,

    /// Taken out while the task is being polled.
    pub future: Option<LocalBoxFuture<'static, Outcome>>,
}

/// The user code a run has to execute, handed out by [`Graph::begin_run`].
pub(crate) enum Job {
    Sync(SyncFn),
    Async(AsyncFn, u64),
    /// A relay's update hook; `None` when it has to be re-activated instead.
    Update(Option<Rc<dyn Fn()>>),
}

impl Graph {
    /// Open a new generation of `id` and hand out what to run.
    pub fn begin_run(&mut self, id: SignalId) -> Result<(Job, ScopeId)> {
        let node = self.node_mut(id)?;
        let job = match &node.kind {
            NodeKind::Computed(f) | NodeKind::Watcher(f) => Job::Sync(f.clone()),
            NodeKind::Async(f) => {
                let f = f.clone();
                let Some(slot) = node.async_slot.as_mut() else {
                    return Err(Error::msg("async signal without a result slot"));
                };
                slot.version += 1;
                Job::Async(f, slot.version)
            }
            NodeKind::Relay(_) => Job::Update(
                node.relay
                    .as_ref()
                    .and_then(|relay| relay.hooks.as_ref())
                    .and_then(|hooks| hooks.update.clone()),
            ),
            NodeKind::State | NodeKind::Task(_) => {
                return Err(Error::msg("signal cannot be recomputed on pull"));
            }
        };
        node.computing = true;
        node.compute_count += 1;
        node.mark_clean();
        tracing::trace!(?id, generation = node.compute_count, "recomputing");
        Ok((job, node.scope))
    }

    /// Store the outcome of a synchronous run, keeping the old value when equal.
    pub fn finish_sync(&mut self, id: SignalId, outcome: Outcome) -> Result<()> {
        let node = self.node_mut(id)?;
        node.computing = false;
        let changed = match (&node.value, &outcome) {
            (Some(Ok(old)), Ok(new)) => !(node.equals)(old, new),
            (Some(Err(old)), Err(new)) => old != new,
            _ => true,
        };
        if changed {
            node.value = Some(outcome);
            node.bump(true);
            let version = node.updated_count;
            self.trace.push(TraceEvent::Updated {
                id: id.to_raw(),
                version,
            });
        }
        self.prune(id);
        Ok(())
    }

    /// Start an explicit run of a task. Runs are untracked.
    pub fn begin_task(&mut self, id: SignalId) -> Result<(TaskFn, u64, ScopeId)> {
        let node = self.node_mut(id)?;
        let NodeKind::Task(f) = &node.kind else {
            return Err(Error::msg("signal is not a task"));
        };
        let f = f.clone();
        let scope = node.scope;
        let Some(slot) = node.async_slot.as_mut() else {
            return Err(Error::msg("task without a result slot"));
        };
        slot.version += 1;
        let version = slot.version;
        node.compute_count += 1;
        Ok((f, version, scope))
    }

    /// Mark a relay active and open the generation its activation reads into.
    pub fn begin_activate(&mut self, id: SignalId) -> Result<(ActivateFn, ScopeId)> {
        let node = self.node_mut(id)?;
        let NodeKind::Relay(activate) = &node.kind else {
            return Err(Error::msg("signal is not a relay"));
        };
        let activate = activate.clone();
        if let Some(relay) = node.relay.as_mut() {
            relay.active = true;
        }
        node.computing = true;
        node.compute_count += 1;
        node.mark_clean();
        let scope = node.scope;
        let unset = node
            .async_slot
            .as_ref()
            .is_some_and(|slot| slot.value.is_none() && slot.error.is_none());
        tracing::trace!(?id, "activating relay");
        if unset {
            self.mark_pending(id)?;
        }
        Ok((activate, scope))
    }

    /// Close a relay activation or update.
    pub fn finish_relay(&mut self, id: SignalId, hooks: Option<crate::reactive::RelayHooks>) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.computing = false;
            if let (Some(relay), Some(hooks)) = (node.relay.as_mut(), hooks) {
                relay.hooks = Some(hooks);
            }
        }
        self.prune(id);
    }

    fn awaiting_consumers(&self, id: SignalId) -> SmallVec<[SignalId; 4]> {
        self.nodes
            .get(id)
            .and_then(|node| node.async_slot.as_ref())
            .map(|slot| slot.awaiters.iter().filter_map(|a| a.consumer).collect())
            .unwrap_or_default()
    }

    /// Flag an async node as pending. Snapshot readers see the change;
    /// consumers suspended on the node do not.
    pub fn mark_pending(&mut self, id: SignalId) -> Result<()> {
        let skip = self.awaiting_consumers(id);
        let Some(node) = self.nodes.get_mut(id) else {
            return Ok(());
        };
        let Some(slot) = node.async_slot.as_mut() else {
            return Ok(());
        };
        if slot.pending {
            return Ok(());
        }
        slot.pending = true;
        node.bump(false);
        self.dirty_consumers(id, &skip)
    }

    /// Settle an async node with the outcome of its latest run.
    ///
    /// Awaiters are woken, consumers gated on the node are re-checked, and
    /// the flush loop is told that something resolved.
    pub fn resolve(&mut self, id: SignalId, outcome: Outcome) -> Result<()> {
        let skip = self.awaiting_consumers(id);
        let Some(node) = self.nodes.get_mut(id) else {
            return Ok(());
        };
        let equals = node.equals.clone();
        let Some(slot) = node.async_slot.as_mut() else {
            return Ok(());
        };
        let was_pending = std::mem::replace(&mut slot.pending, false);
        let value_changed = match outcome {
            Ok(value) => {
                let same = slot.error.is_none()
                    && slot.value.as_ref().is_some_and(|old| equals(old, &value));
                slot.error = None;
                if !same {
                    slot.value = Some(value);
                }
                !same
            }
            Err(error) => {
                let same = slot.error.as_ref() == Some(&error);
                slot.error = Some(error);
                !same
            }
        };
        let awaiters = std::mem::take(&mut slot.awaiters);

        let mut result = Ok(());
        if value_changed || was_pending {
            node.bump(value_changed);
            let version = node.updated_count;
            self.trace.push(TraceEvent::Updated {
                id: id.to_raw(),
                version,
            });
            result = self.dirty_consumers(id, &skip);
        }
        tracing::trace!(?id, value_changed, awaiters = awaiters.len(), "async resolved");
        for awaiter in awaiters {
            awaiter.waker.wake();
        }
        self.release_gated(id);
        self.queues.resolved = true;
        self.queues.flush_requested = true;
        result
    }
}
