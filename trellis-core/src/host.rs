//! Host Scheduling
//!
//! The runtime never spawns anything on its own. It asks a [`Host`] to run
//! the flush loop "soon" and GC sweeps "when idle".
//!
//! - [`DeferredHost`] (the default) leaves flushing to whoever awaits
//!   [`Runtime::settled`](crate::Runtime::settled) and buffers idle work until
//!   [`Runtime::run_idle`](crate::Runtime::run_idle).
//! - [`TokioHost`] spawns the flush on the current `LocalSet` and runs idle
//!   work after a fixed delay.

use std::cell::RefCell;
use std::time::Duration;

use futures_util::future::LocalBoxFuture;

use crate::config::RuntimeConfig;

/// Scheduling primitives the runtime depends on.
pub trait Host {
    /// Run a flush soon, after the current synchronous work.
    fn run_soon(&self, task: LocalBoxFuture<'static, ()>);

    /// Run low-priority work once the host is idle.
    fn run_when_idle(&self, task: Box<dyn FnOnce()>);

    /// Run buffered idle work now. Returns how many callbacks ran.
    fn drain_idle(&self) -> usize {
        0
    }
}

/// A host that never runs anything by itself.
#[derive(Default)]
pub struct DeferredHost {
    idle: RefCell<Vec<Box<dyn FnOnce()>>>,
}

impl DeferredHost {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Host for DeferredHost {
    fn run_soon(&self, task: LocalBoxFuture<'static, ()>) {
        // flushes run when someone awaits `settled()`
        drop(task);
    }

    fn run_when_idle(&self, task: Box<dyn FnOnce()>) {
        self.idle.borrow_mut().push(task);
    }

    fn drain_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            let tasks = std::mem::take(&mut *self.idle.borrow_mut());
            if tasks.is_empty() {
                return ran;
            }
            ran += tasks.len();
            for task in tasks {
                task();
            }
        }
    }
}

/// A host backed by the tokio current-thread runtime.
///
/// Must be used from within a [`tokio::task::LocalSet`].
#[derive(Debug, Clone)]
pub struct TokioHost {
    idle_delay: Duration,
}

impl TokioHost {
    pub fn new(idle_delay: Duration) -> Self {
        Self { idle_delay }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(config.gc_idle_delay())
    }
}

impl Host for TokioHost {
    fn run_soon(&self, task: LocalBoxFuture<'static, ()>) {
        tokio::task::spawn_local(task);
    }

    fn run_when_idle(&self, task: Box<dyn FnOnce()>) {
        let delay = self.idle_delay;
        tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            task();
        });
    }
}
