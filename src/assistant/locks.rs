//! Per-object serialization
//!
//! Multi-step operations on the same array object take a lock keyed on the
//! object's identity. The guard releases on drop, so every exit path
//! (including `?`) unlocks.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// Entries beyond this count trigger a sweep of unused locks
const PRUNE_THRESHOLD: usize = 1024;

/// Identity of a lockable array object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    Volume(String),
    Host { system_id: String, host: String },
    LcMap(String),
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockKey::Volume(name) => write!(f, "volume:{}", name),
            LockKey::Host { system_id, host } => write!(f, "host:{}:{}", system_id, host),
            LockKey::LcMap(id) => write!(f, "lcmap:{}", id),
        }
    }
}

/// Held while the keyed object is being worked on
#[derive(Debug)]
pub struct ObjectGuard {
    key: LockKey,
    _guard: OwnedMutexGuard<()>,
}

impl ObjectGuard {
    pub fn key(&self) -> &LockKey {
        &self.key
    }
}

impl Drop for ObjectGuard {
    fn drop(&mut self) {
        trace!("Released {}", self.key);
    }
}

/// Table of keyed async locks
#[derive(Debug, Default)]
pub struct ObjectLocks {
    locks: DashMap<LockKey, Arc<Mutex<()>>>,
}

impl ObjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and take the lock on `key`
    pub async fn lock(&self, key: LockKey) -> ObjectGuard {
        if self.locks.len() > PRUNE_THRESHOLD {
            self.prune();
        }
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        trace!("Acquired {}", key);
        ObjectGuard { key, _guard: guard }
    }

    /// Drop entries nobody holds or waits on
    pub fn prune(&self) {
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
