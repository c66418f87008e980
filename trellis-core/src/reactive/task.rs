//! Async Tasks
//!
//! A [`Task`] is an async signal that only runs when asked to, with
//! arguments supplied at run time. Reads during a run are not tracked, so a
//! task never reruns by itself. Starting a new run supersedes the one in
//! flight: the older run keeps going but its result is discarded.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::rc::Rc;

use futures_util::future::LocalBoxFuture;

use super::async_result::{self, AsyncResult, Wait};
use super::context::ReactiveContext;
use super::runtime::{self, with_graph};
use super::signal::{insert_node, Equality, Handle};
use crate::error::{Error, Result};
use crate::graph::{NodeKind, Outcome, SignalId, TaskFn, Value};

/// An explicitly run async operation.
///
/// # Example
///
/// ```rust,ignore
/// let save = Task::new(|draft: String| async move { api::save(draft).await });
///
/// save.run("hello".into());
/// let saved = save.wait().await?;
/// ```
pub struct Task<A, T> {
    handle: Rc<Handle>,
    _marker: PhantomData<(A, T)>,
}

impl<A: Clone + 'static, T: Clone + 'static> Task<A, T> {
    pub fn new<Fut>(f: impl Fn(A) -> Fut + 'static) -> Self
    where
        T: PartialEq,
        Fut: Future<Output = Result<T>> + 'static,
    {
        Self::with_equality(f, Equality::default())
    }

    pub fn with_equality<Fut>(f: impl Fn(A) -> Fut + 'static, equality: Equality<T>) -> Self
    where
        Fut: Future<Output = Result<T>> + 'static,
    {
        let run: TaskFn = Rc::new(move |args: Value| -> LocalBoxFuture<'static, Outcome> {
            let Some(args) = args.downcast_ref::<A>().cloned() else {
                return Box::pin(async {
                    Err(Error::msg("task arguments have an unexpected type"))
                });
            };
            let future = f(args);
            Box::pin(async move { future.await.map(|value| Rc::new(value) as Value) })
        });
        Self {
            handle: insert_node(NodeKind::Task(run), equality.erase()),
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> SignalId {
        self.handle.id()
    }

    /// Start a run with `args`, superseding any run in flight.
    pub fn run(&self, args: A) {
        let id = self.id();
        let (f, version, scope) = match with_graph(|g| g.begin_task(id)) {
            Ok(started) => started,
            Err(err) => {
                tracing::debug!(?id, %err, "task run not started");
                return;
            }
        };
        tracing::trace!(?id, version, "task run started");
        let future = {
            let _cx = ReactiveContext::enter(None, Some(scope));
            f(Rc::new(args) as Value)
        };
        runtime::spawn(id, version, false, future);
    }

    /// The snapshot of the latest run.
    pub fn get(&self) -> AsyncResult<T> {
        async_result::read(self.id()).unwrap_or_else(|error| AsyncResult {
            value: None,
            error: Some(error),
            pending: false,
        })
    }

    /// Wait for the latest run to settle. Pends until a run is started.
    pub fn wait(&self) -> Wait<T> {
        Wait::new(self.handle.clone())
    }
}

impl<A, T> Clone for Task<A, T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, T> fmt::Debug for Task<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("id", &self.handle.id()).finish()
    }
}
