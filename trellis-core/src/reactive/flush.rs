//! Flush Loop
//!
//! The single cooperative loop that settles the graph. It is non-reentrant:
//! a second caller of [`settled`] waits for the running flush and then looks
//! again.
//!
//! # How a Flush Runs
//!
//! 1. Poll woken tasks.
//! 2. Drain async pulls (start async recomputation, activate relays), then
//!    sync pulls (resolve watched watchers, queueing their listeners). Yield
//!    one turn so continuations scheduled meanwhile can run, and repeat.
//! 3. When the pull queues are empty and nothing resolved during the last
//!    turn, wait for live tasks if there are any.
//! 4. Otherwise run the batch: queued unwatches (with relay teardown),
//!    listener callbacks, the tracer flush. Listeners may write state, so go
//!    back to 1 until a whole pass finds no work.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use super::runtime::{self, check, drive_woken, flush_trace, with_graph, with_runtime};
use crate::graph::SignalId;

/// Yield to the executor once.
struct YieldNow(bool);

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.0 {
            return Poll::Ready(());
        }
        self.0 = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// Resolves once any task has been woken.
struct Woken;

impl Future for Woken {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        with_runtime(|rt| {
            if !rt.wake.is_empty() {
                return Poll::Ready(());
            }
            rt.wake.register(cx.waker());
            // a wake may have landed between the check and the registration
            if rt.wake.is_empty() {
                Poll::Pending
            } else {
                Poll::Ready(())
            }
        })
    }
}

/// Resolves once the running flush has finished.
struct FlushDone;

impl Future for FlushDone {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        with_runtime(|rt| {
            if !rt.flush.running.get() {
                return Poll::Ready(());
            }
            rt.flush.waiters.borrow_mut().push(cx.waker().clone());
            Poll::Pending
        })
    }
}

struct Running;

impl Running {
    fn begin() -> Self {
        with_runtime(|rt| {
            rt.flush.running.set(true);
            rt.flush.scheduled.set(false);
        });
        Running
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        with_runtime(|rt| {
            rt.flush.running.set(false);
            for waiter in rt.flush.waiters.take() {
                waiter.wake();
            }
        });
    }
}

fn pull_async(id: SignalId) {
    if let Err(err) = check(id) {
        tracing::debug!(?id, %err, "async pull failed");
    }
}

/// Bring a watched watcher up to date and queue its listeners if it changed.
fn pull_watcher(id: SignalId) {
    if let Err(err) = check(id) {
        tracing::debug!(?id, %err, "watcher pull failed");
    }
    with_graph(|g| {
        let Some(node) = g.nodes.get_mut(id) else {
            return;
        };
        if node.watch_count == 0 || node.updated_count == node.last_notified {
            return;
        }
        let first = node.last_notified == 0;
        node.last_notified = node.updated_count;
        // the first computation after attaching only sets the baseline
        if !first {
            let listeners: Vec<_> = node.listeners.values().cloned().collect();
            g.queues.schedule_listeners(listeners);
        }
    });
}

pub(crate) async fn settled() {
    while with_runtime(|rt| rt.flush.running.get()) {
        FlushDone.await;
    }
    let _running = Running::begin();
    let max_rounds = runtime::config().max_settle_rounds;
    let mut rounds = 0;

    loop {
        rounds += 1;
        if rounds > max_rounds {
            tracing::warn!(max_rounds, "graph did not settle, giving up");
            break;
        }
        drive_woken();

        let round = with_graph(|g| {
            g.queues.flush_requested = false;
            g.queues.take_round()
        });
        if !round.is_empty() {
            for id in round.async_pulls {
                pull_async(id);
            }
            for id in round.pulls {
                pull_watcher(id);
            }
            YieldNow(false).await;
            continue;
        }

        if with_graph(|g| std::mem::take(&mut g.queues.resolved)) {
            YieldNow(false).await;
            continue;
        }
        if with_graph(|g| g.has_live_tasks()) {
            Woken.await;
            continue;
        }

        let batch = with_graph(|g| g.queues.take_batch());
        if batch.is_empty() {
            flush_trace();
            if with_graph(|g| g.queues.has_work()) {
                continue;
            }
            break;
        }
        tracing::trace!(
            unwatch = batch.unwatch.len(),
            listeners = batch.listeners.len(),
            "running batch"
        );
        with_graph(|g| {
            for (id, count) in batch.unwatch {
                g.unwatch(id, count);
            }
        });
        for listener in batch.listeners {
            listener();
        }
        flush_trace();
    }
    with_graph(|g| g.queues.flush_requested = false);
}
