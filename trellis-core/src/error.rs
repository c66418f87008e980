//! Error types for the signal graph.
//!
//! [`Error`] is cloneable because failed outcomes are cached in the graph just
//! like successful values: a derivation that failed keeps returning the same
//! error until one of its dependencies changes.

use std::fmt;
use std::sync::Arc;

use crate::graph::SignalId;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by reads, writes and derivations.
#[derive(Clone, thiserror::Error)]
pub enum Error {
    /// A signal was dirtied or pulled while it was the active consumer.
    ///
    /// This is a protocol violation. The offending computation is never retried.
    #[error("signal {0:?} was dirtied or re-entered while it was the active consumer")]
    Cycle(SignalId),

    /// The signal was released before it could be read.
    #[error("signal {0:?} has been released")]
    Released(SignalId),

    /// A derivation failed with an underlying error.
    #[error("{0}")]
    Compute(Arc<dyn std::error::Error + Send + Sync>),

    /// A derivation failed with a plain message.
    #[error("{0}")]
    Message(Arc<str>),
}

impl Error {
    /// Wrap any error produced inside a derivation.
    pub fn compute<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Compute(Arc::new(err))
    }

    /// Build an error from a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(Arc::from(message.into()))
    }

    /// Whether this error is a protocol violation rather than a compute failure.
    pub fn is_cycle(&self) -> bool {
        matches!(self, Self::Cycle(_))
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cycle(id) => f.debug_tuple("Cycle").field(id).finish(),
            Self::Released(id) => f.debug_tuple("Released").field(id).finish(),
            Self::Compute(err) => f.debug_tuple("Compute").field(&err.to_string()).finish(),
            Self::Message(msg) => f.debug_tuple("Message").field(msg).finish(),
        }
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Cycle(a), Self::Cycle(b)) => a == b,
            (Self::Released(a), Self::Released(b)) => a == b,
            (Self::Compute(a), Self::Compute(b)) => Arc::ptr_eq(a, b),
            (Self::Message(a), Self::Message(b)) => a == b,
            _ => false,
        }
    }
}

/// Failure to load a [`RuntimeConfig`](crate::RuntimeConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The document was not valid JSON or did not match the schema.
    #[error("invalid runtime config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure inside a persistence [`Store`](crate::Store).
///
/// These never reach callers of the graph: the runtime logs and drops them.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// Encoding a value to MessagePack failed.
    #[error("failed to encode persisted value: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Decoding a stored value failed.
    #[error("failed to decode persisted value: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// The backing store rejected the operation.
    #[error("store failure: {0}")]
    Store(String),
}
