//! Dirty Propagation
//!
//! Writes push invalidation down the graph; reads pull values back up.
//!
//! # How Propagation Works
//!
//! A changed node walks its live consumers. A Clean consumer becomes
//! MaybeDirty with the triggering edge as the head of its dirty chain and
//! propagates further. A consumer that is already MaybeDirty or Pending only
//! gets the edge inserted into its chain, unless the edge was read earlier
//! than the current head: a Pending consumer then goes back to MaybeDirty and
//! propagates again, since the dependency its in-flight run was gated on is
//! no longer the first one to check.
//!
//! # How Checking Works
//!
//! Pulling a MaybeDirty node walks its chain in ordinal order. Each chained
//! dependency is brought up to date first, then its versions are compared
//! with what the edge last saw. The first real change makes the node Dirty;
//! if nothing changed the node goes back to Clean without running. The walk
//! is driven step by step by the runtime, since bringing a dependency up to
//! date may run user code.

use super::edge::DirtyLink;
use super::{DirtyState, EdgeKind, Graph, NodeKind, SignalId};
use crate::error::{Error, Result};
use smallvec::SmallVec;

/// What the runtime has to do next to bring a node up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CheckStep {
    /// The node is as fresh as it can get without waiting.
    Done,
    /// Bring this dependency up to date, then ask again.
    CheckDep(SignalId),
    /// Run the node's computation (or a relay's update hook).
    Run,
    /// Activate a watched relay.
    Activate,
}

impl Graph {
    /// Walk the consumers of `id` after one of its versions moved.
    ///
    /// Consumers in `skip` are left alone; they are suspended on `id` and
    /// refresh their edge when they resume.
    pub fn dirty_consumers(&mut self, id: SignalId, skip: &[SignalId]) -> Result<()> {
        let subs: SmallVec<[(SignalId, u64); 8]> = match self.nodes.get(id) {
            Some(node) => node.subs.iter().map(|(sub, at)| (*sub, *at)).collect(),
            None => return Ok(()),
        };

        for (sub_id, consumed_at) in subs {
            if skip.contains(&sub_id) {
                continue;
            }
            let Some(sub) = self.nodes.get_mut(sub_id) else {
                continue;
            };
            if sub.compute_count != consumed_at {
                continue;
            }
            let Some(edge) = sub.deps.get(&id) else {
                continue;
            };
            let link = DirtyLink {
                ordinal: edge.ordinal,
                dep: id,
            };

            match sub.state {
                DirtyState::Clean => {
                    if sub.computing {
                        return Err(Error::Cycle(sub_id));
                    }
                    sub.state = DirtyState::MaybeDirty;
                    sub.dirty.reset(link);
                    self.propagate(sub_id)?;
                }
                DirtyState::MaybeDirty => {
                    sub.dirty.insert(link);
                }
                DirtyState::Pending => {
                    if sub.dirty.insert(link) {
                        sub.state = DirtyState::MaybeDirty;
                        self.propagate(sub_id)?;
                    }
                }
                DirtyState::Dirty => {}
            }
        }
        Ok(())
    }

    /// Schedule `id` if it is a watched root or async node, then dirty its consumers.
    pub fn propagate(&mut self, id: SignalId) -> Result<()> {
        let Some(node) = self.nodes.get(id) else {
            return Ok(());
        };
        if node.computing {
            return Err(Error::Cycle(id));
        }
        if node.watch_count > 0 {
            match node.kind {
                NodeKind::Watcher(_) => self.queues.schedule_pull(id),
                NodeKind::Relay(_) | NodeKind::Async(_) => self.queues.schedule_async_pull(id),
                _ => {}
            }
        }
        self.dirty_consumers(id, &[])
    }

    /// Invalidate `id` without diffing its dependencies.
    ///
    /// The node recomputes on its next pull whatever its chain would say.
    pub fn force_dirty(&mut self, id: SignalId) -> Result<()> {
        let Some(node) = self.nodes.get_mut(id) else {
            return Ok(());
        };
        if node.computing {
            return Ok(());
        }
        let previous = node.state;
        node.mark_dirty();
        tracing::trace!(?id, ?previous, "forced dirty");
        if previous == DirtyState::Clean {
            self.propagate(id)?;
        }
        Ok(())
    }

    /// Decide the next step for pulling `id`.
    pub fn next_check_step(&mut self, id: SignalId) -> Result<CheckStep> {
        loop {
            let Some(node) = self.nodes.get_mut(id) else {
                return Err(Error::Released(id));
            };
            if node.computing {
                return Err(Error::Cycle(id));
            }

            // relays do not diff their dependencies, any invalidation reaches the update hook
            if let Some(relay) = node.relay.as_ref() {
                let active = relay.active;
                return Ok(match node.state {
                    _ if !active && node.watch_count > 0 => CheckStep::Activate,
                    DirtyState::MaybeDirty | DirtyState::Dirty if active => CheckStep::Run,
                    _ => {
                        if !active {
                            node.mark_clean();
                        }
                        CheckStep::Done
                    }
                });
            }

            match node.state {
                DirtyState::Clean | DirtyState::Pending => return Ok(CheckStep::Done),
                DirtyState::Dirty => {
                    if matches!(node.kind, NodeKind::State | NodeKind::Task(_)) {
                        // states never get dirty, tasks only run when asked to
                        node.mark_clean();
                        return Ok(CheckStep::Done);
                    }
                    return Ok(CheckStep::Run);
                }
                DirtyState::MaybeDirty => {}
            }

            let Some(link) = node.dirty.head() else {
                node.mark_clean();
                return Ok(CheckStep::Done);
            };
            let Some(edge) = node.deps.get(&link.dep).copied() else {
                node.dirty.remove(link.dep);
                continue;
            };
            let is_async = node.is_async();

            let Some(dep) = self.nodes.get(link.dep) else {
                // a freed dependency can only have been replaced
                self.nodes[id].mark_dirty();
                continue;
            };
            if matches!(dep.state, DirtyState::MaybeDirty | DirtyState::Dirty)
                && !matches!(dep.kind, NodeKind::State | NodeKind::Task(_))
            {
                return Ok(CheckStep::CheckDep(link.dep));
            }
            let versions = dep.versions();
            let dep_pending = dep.is_pending();

            if edge.is_outdated(versions) {
                self.nodes[id].mark_dirty();
                continue;
            }
            if is_async && edge.kind == EdgeKind::Wait && dep_pending {
                self.gate(id, link.dep);
                return Ok(CheckStep::Done);
            }
            self.nodes[id].dirty.remove(link.dep);
        }
    }

    /// Park the async node `id` until `dep` settles.
    fn gate(&mut self, id: SignalId, dep: SignalId) {
        self.nodes[id].state = DirtyState::Pending;
        if let Some(slot) = self.nodes.get_mut(dep).and_then(|n| n.async_slot.as_mut()) {
            if !slot.gated.contains(&id) {
                slot.gated.push(id);
            }
        }
        tracing::trace!(?id, ?dep, "gated on pending dependency");
    }

    /// Release the consumers gated on `id` so their chains are re-checked.
    pub fn release_gated(&mut self, id: SignalId) {
        let gated = match self.nodes.get_mut(id).and_then(|n| n.async_slot.as_mut()) {
            Some(slot) => std::mem::take(&mut slot.gated),
            None => return,
        };
        for consumer in gated {
            let Some(node) = self.nodes.get_mut(consumer) else {
                continue;
            };
            if node.state != DirtyState::Pending {
                continue;
            }
            node.state = DirtyState::MaybeDirty;
            // top-level waiters have to look again, nothing else will wake them
            if let Some(slot) = node.async_slot.as_mut() {
                for awaiter in std::mem::take(&mut slot.awaiters) {
                    awaiter.waker.wake();
                }
            }
            if node.watch_count > 0 {
                self.queues.schedule_async_pull(consumer);
            }
        }
    }
}
