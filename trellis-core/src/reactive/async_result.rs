//! Async Results
//!
//! Snapshots of async signals and the future that waits for them to settle.
//!
//! Reading an async signal never blocks: [`AsyncResult`] says whether a run
//! is in flight and what the last settled outcome was. Awaiting
//! [`wait`](super::AsyncComputed::wait) suspends until the signal settles;
//! inside another async derivation that await subscribes to settled value
//! changes only, so the outer run is not repeated just because the inner one
//! went pending and came back with the same value.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use super::context::ReactiveContext;
use super::runtime::{self, with_graph, with_runtime};
use super::signal::Handle;
use crate::error::{Error, Result};
use crate::graph::{Awaiter, DirtyState, EdgeKind, SignalId};

/// Where an async signal stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncState {
    /// Never settled and nothing in flight.
    Idle,
    /// A run is in flight.
    Pending,
    /// The last run produced a value.
    Ready,
    /// The last run failed.
    Failed,
}

/// A snapshot of an async signal.
#[derive(Clone)]
pub struct AsyncResult<T> {
    pub(crate) value: Option<T>,
    pub(crate) error: Option<Error>,
    pub(crate) pending: bool,
}

impl<T> AsyncResult<T> {
    /// Whether a run is in flight. The previous outcome stays readable meanwhile.
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Whether the last settled run produced a value.
    pub fn is_ready(&self) -> bool {
        self.error.is_none() && self.value.is_some()
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn state(&self) -> AsyncState {
        match (self.pending, &self.error, &self.value) {
            (true, _, _) => AsyncState::Pending,
            (false, Some(_), _) => AsyncState::Failed,
            (false, None, Some(_)) => AsyncState::Ready,
            (false, None, None) => AsyncState::Idle,
        }
    }

    /// The latest value, kept across later failures and pending runs.
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// The settled outcome, or `None` if nothing has settled yet.
    pub fn into_result(self) -> Option<Result<T>> {
        match (self.error, self.value) {
            (Some(error), _) => Some(Err(error)),
            (None, Some(value)) => Some(Ok(value)),
            (None, None) => None,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for AsyncResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncResult")
            .field("state", &self.state())
            .field("value", &self.value)
            .field("error", &self.error)
            .finish()
    }
}

/// A snapshot of an async signal that was given an initial value, so a
/// value is always present.
#[derive(Clone)]
pub struct ReadyResult<T> {
    pub(crate) value: T,
    pub(crate) error: Option<Error>,
    pub(crate) pending: bool,
}

impl<T> ReadyResult<T> {
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The latest value, or the initial one if nothing resolved yet.
    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

impl<T: fmt::Debug> fmt::Debug for ReadyResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadyResult")
            .field("pending", &self.pending)
            .field("value", &self.value)
            .field("error", &self.error)
            .finish()
    }
}

/// Copy the result slot of `id` out of the graph.
pub(crate) fn snapshot<T: Clone + 'static>(id: SignalId) -> Result<AsyncResult<T>> {
    with_graph(|g| {
        let node = g.node(id)?;
        let Some(slot) = node.async_slot.as_ref() else {
            return Err(Error::msg("signal is not async"));
        };
        let value = match &slot.value {
            Some(value) => Some(runtime::downcast::<T>(value)?),
            None => None,
        };
        Ok(AsyncResult {
            value,
            error: slot.error.clone(),
            pending: slot.pending || node.state == DirtyState::Pending,
        })
    })
}

/// Check `id`, record a snapshot read and return the snapshot.
pub(crate) fn read<T: Clone + 'static>(id: SignalId) -> Result<AsyncResult<T>> {
    runtime::read(id)?;
    snapshot(id)
}

/// Future returned by `wait()`. Resolves with the settled outcome of an
/// async signal, starting or driving its run as needed.
#[must_use = "futures do nothing unless polled"]
pub struct Wait<T> {
    id: SignalId,
    handle: Rc<Handle>,
    _marker: PhantomData<T>,
}

impl<T> Wait<T> {
    pub(crate) fn new(handle: Rc<Handle>) -> Self {
        Self {
            id: handle.id(),
            handle,
            _marker: PhantomData,
        }
    }
}

impl<T> Unpin for Wait<T> {}

impl<T: Clone + 'static> Future for Wait<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<T>> {
        let id = self.id;
        runtime::drive_woken();
        if let Err(err) = runtime::check(id) {
            return Poll::Ready(Err(err));
        }
        if let Err(err) = runtime::track(id, EdgeKind::Wait) {
            return Poll::Ready(Err(err));
        }

        let consumer = ReactiveContext::current_consumer();
        let settled = with_graph(|g| {
            let node = g.node_mut(id)?;
            let gated = node.state == DirtyState::Pending;
            let Some(slot) = node.async_slot.as_mut() else {
                return Err(Error::msg("signal is not async"));
            };
            if !slot.pending && !gated {
                if let Some(error) = &slot.error {
                    return Ok(Some(Err(error.clone())));
                }
                if let Some(value) = &slot.value {
                    return Ok(Some(runtime::downcast::<T>(value)));
                }
            }
            if !slot.awaiters.iter().any(|a| a.waker.will_wake(cx.waker())) {
                slot.awaiters.push(Awaiter {
                    consumer,
                    waker: cx.waker().clone(),
                });
            }
            Ok(None)
        });
        match settled {
            Ok(Some(outcome)) => Poll::Ready(outcome),
            Ok(None) => {
                // outside a task nobody else drives the runtime's own futures
                if consumer.is_none() && !runtime::is_polling() {
                    let missed = with_runtime(|rt| {
                        rt.wake.register(cx.waker());
                        !rt.wake.is_empty()
                    });
                    if missed {
                        cx.waker().wake_by_ref();
                    }
                }
                Poll::Pending
            }
            Err(err) => Poll::Ready(Err(err)),
        }
    }
}

impl<T> fmt::Debug for Wait<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wait").field("id", &self.handle.id()).finish()
    }
}
