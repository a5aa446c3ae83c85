//! Owned shared state of the bridge
//!
//! The credential and the broker connection parameters are the only contended
//! mutable structures. Each sits behind its own lock; nothing holds both.

pub mod credential;
pub mod topics;

pub use credential::{Credential, TokenStore};
pub use topics::{TopicError, TopicSet};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

/// Value paired with the version it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("state changed concurrently: expected version {expected}, found {actual}")]
pub struct StaleVersion {
    pub expected: u64,
    pub actual: u64,
}

/// Lock-guarded cell with atomic read and compare-and-swap style update
#[derive(Debug)]
pub struct SharedState<T> {
    inner: RwLock<Versioned<T>>,
}

impl<T: Clone> SharedState<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(Versioned { version: 0, value }),
        }
    }

    /// Copy of the current value
    pub fn load(&self) -> T {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .value
            .clone()
    }

    /// Copy of the current value with its version
    pub fn snapshot(&self) -> Versioned<T> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the value unconditionally, returning the new version
    pub fn store(&self, value: T) -> u64 {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        guard.version += 1;
        guard.value = value;
        guard.version
    }

    /// Mutate in place under the write lock
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        guard.version += 1;
        f(&mut guard.value)
    }

    /// Replace the value only if nobody wrote since `expected` was read
    pub fn compare_and_swap(&self, expected: u64, value: T) -> Result<u64, StaleVersion> {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if guard.version != expected {
            return Err(StaleVersion {
                expected,
                actual: guard.version,
            });
        }
        guard.version += 1;
        guard.value = value;
        Ok(guard.version)
    }
}

/// Broker URL, credentials and the topic filters to subscribe
#[derive(Clone, Default, PartialEq, Eq)]
pub struct BrokerConnectionParams {
    pub url: String,
    pub username: String,
    pub password: String,
    pub topics: TopicSet,
}

impl fmt::Debug for BrokerConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConnectionParams")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"***")
            .field("topics", &self.topics)
            .finish()
    }
}

/// Backend identity of the running bridge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    /// Profile object that carries the bridge's properties and controls
    pub object_id: String,
}

/// Process-wide auto-provisioning switch
#[derive(Debug, Default)]
pub struct AutoProvision(AtomicBool);

impl AutoProvision {
    pub fn new(enabled: bool) -> Self {
        Self(AtomicBool::new(enabled))
    }

    pub fn enabled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::Release);
    }
}
