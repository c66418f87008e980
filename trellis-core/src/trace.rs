//! Tracer Sink
//!
//! Structured lifecycle events for observability tooling. Events are
//! buffered in the graph only while a [`Tracer`] is installed, and handed to
//! it in the batch phase of each flush. Nothing here affects correctness: a
//! full buffer drops its oldest events.

use std::cell::RefCell;
use std::collections::VecDeque;

use serde::Serialize;

use crate::graph::SignalKind;

/// A lifecycle event of one signal.
///
/// Ids are the raw form of [`SignalId`](crate::SignalId), stable for the
/// lifetime of the signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    Created { id: u64, kind: SignalKind },
    /// `consumer` read `dep` for the first time.
    Consumed { consumer: u64, dep: u64 },
    /// The signal's observable value changed.
    Updated { id: u64, version: u64 },
    Released { id: u64 },
}

/// Receives batches of trace events.
pub trait Tracer {
    fn record(&self, events: &[TraceEvent]);
}

/// A tracer that keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: RefCell<Vec<TraceEvent>>,
}

impl RecordingTracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of everything recorded so far.
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.borrow().clone()
    }

    /// Render the recorded events as a JSON array.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&*self.events.borrow())
    }

    pub fn clear(&self) {
        self.events.borrow_mut().clear();
    }
}

impl Tracer for RecordingTracer {
    fn record(&self, events: &[TraceEvent]) {
        self.events.borrow_mut().extend_from_slice(events);
    }
}

/// Bounded event buffer held by the graph.
#[derive(Debug)]
pub(crate) struct TraceBuffer {
    enabled: bool,
    limit: usize,
    events: VecDeque<TraceEvent>,
    dropped: u64,
}

impl Default for TraceBuffer {
    fn default() -> Self {
        Self {
            enabled: false,
            limit: 4_096,
            events: VecDeque::new(),
            dropped: 0,
        }
    }
}

impl TraceBuffer {
    pub fn configure(&mut self, enabled: bool, limit: usize) {
        self.enabled = enabled;
        self.limit = limit.max(1);
        if !enabled {
            self.events.clear();
        }
    }

    pub fn push(&mut self, event: TraceEvent) {
        if !self.enabled {
            return;
        }
        if self.events.len() >= self.limit {
            self.events.pop_front();
            self.dropped += 1;
        }
        self.events.push_back(event);
    }

    /// Drain the buffer, reporting how many events were dropped since the last drain.
    pub fn take(&mut self) -> (Vec<TraceEvent>, u64) {
        let dropped = std::mem::take(&mut self.dropped);
        (self.events.drain(..).collect(), dropped)
    }
}
