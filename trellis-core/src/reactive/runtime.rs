//! Reactive Runtime
//!
//! The runtime is the central coordinator that connects the typed handles to
//! the signal graph. It owns the graph of the current thread, brings nodes
//! up to date on demand, and polls async derivations.
//!
//! # How It Works
//!
//! 1. Every typed handle refers to a node in the thread's [`Graph`]. All
//!    graph access goes through [`with_graph`], which never holds the borrow
//!    while user code runs.
//!
//! 2. Reading a signal first checks it: the graph says what to do next
//!    (check a dependency, run the node, activate a relay) and the runtime
//!    does it outside the borrow, then asks again until the node is fresh.
//!
//! 3. Async derivations are plain futures kept in a task slab. They are
//!    polled by the runtime with a waker that pushes the task key onto a wake
//!    queue, and driven from [`Runtime::settled`] or from `wait()` futures.
//!
//! 4. Work that must not run inside the graph borrow (dropping freed nodes,
//!    relay teardown, handing GC and flushes to the host) is drained right
//!    after each borrow ends.
//!
//! # Thread Safety
//!
//! One runtime per thread. Handles are `!Send`; the only state shared with
//! other threads is the wake queue, since wakers may be called from anywhere.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use futures_util::future::LocalBoxFuture;
use futures_util::task::{waker, ArcWake};
use parking_lot::Mutex;

use super::context::ReactiveContext;
use super::flush;
use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::graph::{
    CheckStep, EdgeKind, Graph, GraphStats, Job, Outcome, SignalId, TaskSlot, Value,
};
use crate::host::{DeferredHost, Host};
use crate::persist::Store;
use crate::trace::Tracer;

/// Task keys woken since the runtime last drove its tasks.
#[derive(Default)]
pub(crate) struct WakeQueue {
    woken: Mutex<VecDeque<usize>>,
    drivers: Mutex<Vec<Waker>>,
}

impl WakeQueue {
    fn push(&self, key: usize) {
        self.woken.lock().push_back(key);
        let drivers = std::mem::take(&mut *self.drivers.lock());
        for driver in drivers {
            driver.wake();
        }
    }

    pub fn pop(&self) -> Option<usize> {
        self.woken.lock().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.woken.lock().is_empty()
    }

    /// Ask to be woken the next time any task is.
    pub fn register(&self, waker: &Waker) {
        let mut drivers = self.drivers.lock();
        if !drivers.iter().any(|driver| driver.will_wake(waker)) {
            drivers.push(waker.clone());
        }
    }
}

struct TaskWaker {
    key: usize,
    queue: Arc<WakeQueue>,
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.queue.push(arc_self.key);
    }
}

struct Services {
    config: RuntimeConfig,
    host: Rc<dyn Host>,
    store: Option<Rc<dyn Store>>,
    tracer: Option<Rc<dyn Tracer>>,
}

/// Flush loop bookkeeping.
#[derive(Default)]
pub(crate) struct FlushState {
    pub running: Cell<bool>,
    /// A flush has been handed to the host and has not started yet.
    pub scheduled: Cell<bool>,
    /// Callers of `settled()` waiting for the running flush to end.
    pub waiters: RefCell<Vec<Waker>>,
}

pub(crate) struct RuntimeState {
    graph: RefCell<Graph>,
    services: RefCell<Services>,
    released: RefCell<Vec<SignalId>>,
    draining: Cell<bool>,
    polling: Cell<u32>,
    pub wake: Arc<WakeQueue>,
    pub flush: FlushState,
}

thread_local! {
    static RUNTIME: RuntimeState = RuntimeState::new();
}

/// Resets a flag when dropped, so a panicking callback cannot wedge the runtime.
struct FlagGuard<'a>(&'a Cell<bool>);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl RuntimeState {
    fn new() -> Self {
        Self {
            graph: RefCell::new(Graph::new()),
            services: RefCell::new(Services {
                config: RuntimeConfig::default(),
                host: Rc::new(DeferredHost::new()),
                store: None,
                tracer: None,
            }),
            released: RefCell::new(Vec::new()),
            draining: Cell::new(false),
            polling: Cell::new(0),
            wake: Arc::new(WakeQueue::default()),
            flush: FlushState::default(),
        }
    }

    fn host(&self) -> Rc<dyn Host> {
        self.services.borrow().host.clone()
    }

    /// Work deferred until the graph borrow has ended.
    fn after_borrow(&self) {
        if self.draining.replace(true) {
            return;
        }
        let _draining = FlagGuard(&self.draining);
        loop {
            let Ok(mut graph) = self.graph.try_borrow_mut() else {
                return;
            };
            for id in self.released.take() {
                graph.release_handle(id);
            }
            let garbage = std::mem::take(&mut graph.garbage);
            let teardowns = std::mem::take(&mut graph.teardowns);
            let gc_requested = std::mem::take(&mut graph.queues.gc_requested);
            let flush_wanted = graph.queues.flush_requested;
            drop(graph);

            let quiet = garbage.is_empty() && teardowns.is_empty() && !gc_requested;
            drop(garbage);
            for hooks in teardowns {
                hooks.deactivate();
            }
            if gc_requested {
                self.host().run_when_idle(Box::new(|| {
                    Runtime::run_gc();
                }));
            }
            if flush_wanted && !self.flush.scheduled.get() && !self.flush.running.get() {
                self.flush.scheduled.set(true);
                self.host().run_soon(Box::pin(flush::settled()));
            }
            if quiet && self.released.borrow().is_empty() {
                return;
            }
        }
    }
}

/// Run `f` with exclusive access to the thread's graph.
///
/// `f` must not call back into user code.
pub(crate) fn with_graph<R>(f: impl FnOnce(&mut Graph) -> R) -> R {
    RUNTIME.with(|rt| {
        let result = f(&mut rt.graph.borrow_mut());
        rt.after_borrow();
        result
    })
}

pub(crate) fn with_runtime<R>(f: impl FnOnce(&RuntimeState) -> R) -> R {
    RUNTIME.with(f)
}

/// Drop one handle reference to `id`. Safe to call from inside the graph
/// borrow: the release is queued and applied once the borrow ends.
pub(crate) fn release(id: SignalId) {
    let _ = RUNTIME.try_with(|rt| {
        rt.released.borrow_mut().push(id);
        if rt.graph.try_borrow_mut().is_ok() {
            rt.after_borrow();
        }
    });
}

pub(crate) fn config() -> RuntimeConfig {
    RUNTIME.with(|rt| rt.services.borrow().config.clone())
}

pub(crate) fn store() -> Option<Rc<dyn Store>> {
    RUNTIME.with(|rt| rt.services.borrow().store.clone())
}

/// Hand buffered trace events to the installed tracer.
pub(crate) fn flush_trace() {
    let Some(tracer) = RUNTIME.with(|rt| rt.services.borrow().tracer.clone()) else {
        return;
    };
    let (events, dropped) = with_graph(|g| g.trace.take());
    if dropped > 0 {
        tracing::debug!(dropped, "trace buffer overflowed");
    }
    if !events.is_empty() {
        tracer.record(&events);
    }
}

/// Bring `id` up to date.
pub(crate) fn check(id: SignalId) -> Result<()> {
    loop {
        match with_graph(|g| g.next_check_step(id))? {
            CheckStep::Done => return Ok(()),
            CheckStep::CheckDep(dep) => check(dep)?,
            CheckStep::Run => run(id)?,
            CheckStep::Activate => activate_relay(id)?,
        }
    }
}

fn run(id: SignalId) -> Result<()> {
    let (job, scope) = with_graph(|g| g.begin_run(id))?;
    match job {
        Job::Sync(compute) => {
            let outcome = {
                let _cx = ReactiveContext::enter(Some(id), Some(scope));
                compute()
            };
            with_graph(|g| g.finish_sync(id, outcome))
        }
        Job::Async(compute, version) => {
            let future = {
                let _cx = ReactiveContext::enter(Some(id), Some(scope));
                compute()
            };
            spawn(id, version, true, future);
            Ok(())
        }
        Job::Update(Some(update)) => {
            {
                let _cx = ReactiveContext::enter(Some(id), Some(scope));
                update();
            }
            with_graph(|g| g.finish_relay(id, None));
            Ok(())
        }
        Job::Update(None) => {
            // without an update hook the relay starts over
            let hooks = with_graph(|g| {
                let node = g.nodes.get_mut(id)?;
                node.computing = false;
                node.relay.as_mut()?.hooks.take()
            });
            if let Some(hooks) = hooks {
                hooks.deactivate();
            }
            activate_relay(id)
        }
    }
}

fn activate_relay(id: SignalId) -> Result<()> {
    let (activate, scope) = with_graph(|g| g.begin_activate(id))?;
    let hooks = {
        let _cx = ReactiveContext::enter(Some(id), Some(scope));
        activate(id)
    };
    with_graph(|g| g.finish_relay(id, Some(hooks)));
    Ok(())
}

/// Register a fresh run of `id` and poll it once.
pub(crate) fn spawn(
    id: SignalId,
    version: u64,
    tracked: bool,
    future: LocalBoxFuture<'static, Outcome>,
) {
    let key = with_graph(|g| {
        if let Some(node) = g.nodes.get_mut(id) {
            node.computing = false;
        }
        g.tasks.insert(TaskSlot {
            signal: id,
            version,
            tracked,
            future: None,
        })
    });
    poll_task(key, Some(future));
}

struct Polling;

impl Polling {
    fn enter() -> Self {
        RUNTIME.with(|rt| rt.polling.set(rt.polling.get() + 1));
        Polling
    }
}

impl Drop for Polling {
    fn drop(&mut self) {
        let _ = RUNTIME.try_with(|rt| rt.polling.set(rt.polling.get().saturating_sub(1)));
    }
}

fn poll_task(key: usize, fresh: Option<LocalBoxFuture<'static, Outcome>>) {
    let taken = with_graph(|g| {
        let slot = g.tasks.get_mut(key)?;
        let future = fresh.or_else(|| slot.future.take())?;
        let (signal, version, tracked) = (slot.signal, slot.version, slot.tracked);
        let live = !g.is_stale(signal, version);
        let consumer = (tracked && live).then_some(signal);
        let scope = g.nodes.get(signal).map(|node| node.scope);
        if let Some(node) = consumer.and_then(|id| g.nodes.get_mut(id)) {
            node.computing = true;
        }
        Some((future, signal, version, live, consumer, scope))
    });
    let Some((mut future, signal, version, live, consumer, scope)) = taken else {
        return;
    };

    let queue = RUNTIME.with(|rt| rt.wake.clone());
    let waker = waker(Arc::new(TaskWaker { key, queue }));
    let mut cx = Context::from_waker(&waker);
    let poll = {
        let _polling = Polling::enter();
        let _cx = ReactiveContext::enter(consumer, scope);
        future.as_mut().poll(&mut cx)
    };

    with_graph(|g| {
        if let Some(node) = consumer.and_then(|id| g.nodes.get_mut(id)) {
            node.computing = false;
        }
        match poll {
            Poll::Pending => {
                if let Some(slot) = g.tasks.get_mut(key) {
                    slot.future = Some(future);
                }
                if live && !g.is_stale(signal, version) {
                    if let Err(err) = g.mark_pending(signal) {
                        tracing::debug!(?signal, %err, "pending state did not propagate");
                    }
                }
            }
            Poll::Ready(outcome) => {
                if g.tasks.contains(key) {
                    g.tasks.remove(key);
                }
                if !live || g.is_stale(signal, version) {
                    tracing::debug!(?signal, version, "discarding stale async result");
                    return;
                }
                if consumer.is_some() {
                    g.prune(signal);
                }
                if let Err(err) = g.resolve(signal, outcome) {
                    tracing::debug!(?signal, %err, "async result did not propagate");
                }
            }
        }
    });
}

/// Whether a task is being polled further up the stack.
pub(crate) fn is_polling() -> bool {
    RUNTIME.with(|rt| rt.polling.get() > 0)
}

/// Poll every woken task. Does nothing while a task is being polled.
pub(crate) fn drive_woken() -> usize {
    if is_polling() {
        return 0;
    }
    let mut polled = 0;
    while let Some(key) = RUNTIME.with(|rt| rt.wake.pop()) {
        poll_task(key, None);
        polled += 1;
    }
    polled
}

/// Record a read of `id` against the current consumer, if any.
pub(crate) fn track(id: SignalId, kind: EdgeKind) -> Result<()> {
    match ReactiveContext::current_consumer() {
        Some(consumer) => with_graph(|g| g.track(consumer, id, kind)),
        None => Ok(()),
    }
}

/// Check `id` and record a plain read of it.
pub(crate) fn read(id: SignalId) -> Result<()> {
    check(id)?;
    track(id, EdgeKind::Read)
}

/// The cached outcome of a synchronous node.
pub(crate) fn value(id: SignalId) -> Result<Value> {
    with_graph(|g| match &g.node(id)?.value {
        Some(Ok(value)) => Ok(value.clone()),
        Some(Err(err)) => Err(err.clone()),
        None => Err(Error::msg("signal has not produced a value")),
    })
}

pub(crate) fn downcast<T: Clone + 'static>(value: &Value) -> Result<T> {
    value
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| Error::msg("signal value has an unexpected type"))
}

/// The signal runtime of the current thread.
///
/// # Example
///
/// ```rust,ignore
/// Runtime::builder()
///     .config(RuntimeConfig::from_json(r#"{ "gc_idle_delay_ms": 10 }"#)?)
///     .store(Rc::new(MemoryStore::new()))
///     .install();
///
/// count.set(5);
/// Runtime::settled().await;
/// ```
pub struct Runtime;

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// Wait until no recomputation, async work or listener run is pending.
    pub async fn settled() {
        flush::settled().await
    }

    /// Sweep scope caches now. Returns how many signals were uncached.
    pub fn run_gc() -> usize {
        let entered = ReactiveContext::entered_scopes();
        with_graph(|g| g.sweep(&entered))
    }

    /// Run idle work buffered by the host, such as pending GC sweeps.
    pub fn run_idle() -> usize {
        let host = RUNTIME.with(|rt| rt.host());
        host.drain_idle()
    }

    pub fn stats() -> GraphStats {
        with_graph(|g| g.stats())
    }

    pub fn config() -> RuntimeConfig {
        config()
    }

    /// Check if we're inside a tracked computation.
    pub fn is_tracking() -> bool {
        ReactiveContext::is_active()
    }
}

/// Installs configuration and collaborators into the thread's runtime.
#[derive(Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    host: Option<Rc<dyn Host>>,
    store: Option<Rc<dyn Store>>,
    tracer: Option<Rc<dyn Tracer>>,
}

impl RuntimeBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn host(mut self, host: Rc<dyn Host>) -> Self {
        self.host = Some(host);
        self
    }

    /// Use a [`TokioHost`](crate::TokioHost) built from the configured idle delay.
    pub fn tokio_host(mut self) -> Self {
        self.host = Some(Rc::new(crate::host::TokioHost::from_config(&self.config)));
        self
    }

    pub fn store(mut self, store: Rc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn tracer(mut self, tracer: Rc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Replace the current thread's collaborators. Existing signals are kept.
    pub fn install(self) {
        RUNTIME.with(|rt| {
            rt.graph
                .borrow_mut()
                .trace
                .configure(self.tracer.is_some(), self.config.trace_buffer_limit);
            tracing::debug!(config = ?self.config, "runtime installed");
            *rt.services.borrow_mut() = Services {
                config: self.config,
                host: self.host.unwrap_or_else(|| Rc::new(DeferredHost::new())),
                store: self.store,
                tracer: self.tracer,
            };
        });
    }
}
