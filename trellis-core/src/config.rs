//! Runtime Configuration
//!
//! Tunables for the flush loop, GC scheduling and the tracer buffer. They can
//! be built in code or loaded from a JSON document:
//!
//! ```rust,ignore
//! let config = RuntimeConfig::from_json(r#"{ "gc_idle_delay_ms": 10 }"#)?;
//! Runtime::builder().config(config).install();
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Configuration for the thread's signal runtime.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Delay used by timer-based hosts before running an idle GC sweep.
    pub gc_idle_delay_ms: u64,

    /// Upper bound on flush rounds within one `settled()` call.
    ///
    /// Listeners that keep writing state could otherwise keep the loop alive forever.
    pub max_settle_rounds: usize,

    /// Maximum number of buffered trace events between flushes.
    pub trace_buffer_limit: usize,
}

impl RuntimeConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(source: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(source)?)
    }

    /// The idle delay as a [`Duration`].
    pub fn gc_idle_delay(&self) -> Duration {
        Duration::from_millis(self.gc_idle_delay_ms)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            gc_idle_delay_ms: 50,
            max_settle_rounds: 10_000,
            trace_buffer_limit: 4_096,
        }
    }
}
