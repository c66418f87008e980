//! Persistence
//!
//! An optional key/value [`Store`] that state signals created with
//! [`State::persisted`](crate::State::persisted) read their initial value
//! from and write every change to. Values are encoded as MessagePack.
//!
//! Persistence is best effort. Store and codec failures are logged at
//! `debug` and otherwise ignored; they never change what the graph computes.

use std::cell::RefCell;

use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::PersistError;

/// A key/value store holding encoded values.
pub trait Store {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistError>;
    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), PersistError>;
}

/// An in-memory [`Store`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RefCell<FxHashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.borrow().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistError> {
        Ok(self.entries.borrow().get(key).cloned())
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), PersistError> {
        self.entries.borrow_mut().insert(key.to_owned(), value);
        Ok(())
    }
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, PersistError> {
    Ok(rmp_serde::to_vec(value)?)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, PersistError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Read and decode `key`, treating any failure as a missing value.
pub(crate) fn load<T: DeserializeOwned>(store: &dyn Store, key: &str) -> Option<T> {
    let loaded = store
        .get(key)
        .and_then(|bytes| bytes.map(|bytes| decode(&bytes)).transpose());
    match loaded {
        Ok(value) => value,
        Err(err) => {
            tracing::debug!(key, %err, "ignoring unreadable persisted value");
            None
        }
    }
}

/// Encode and write `value` under `key`, dropping any failure.
pub(crate) fn save<T: Serialize>(store: &dyn Store, key: &str, value: &T) {
    if let Err(err) = encode(value).and_then(|bytes| store.set(key, bytes)) {
        tracing::debug!(key, %err, "dropping failed persistence write");
    }
}
