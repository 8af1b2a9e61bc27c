//! Per-entity exclusive sections.
//!
//! An operation names every job, printer and spool it will touch and
//! acquires them together: either all keys are free and become held, or the
//! caller waits. Taking the whole set in one step means two operations can
//! never hold parts of each other's sets, so there is no lock ordering to
//! get wrong.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex};

use crate::error::{EngineError, EngineResult};
use crate::model::{JobId, PrinterId, SpoolId};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Job(JobId),
    Printer(PrinterId),
    Spool(SpoolId),
}

impl From<&JobId> for EntityKey {
    fn from(id: &JobId) -> Self {
        EntityKey::Job(id.clone())
    }
}

impl From<&PrinterId> for EntityKey {
    fn from(id: &PrinterId) -> Self {
        EntityKey::Printer(id.clone())
    }
}

impl From<&SpoolId> for EntityKey {
    fn from(id: &SpoolId) -> Self {
        EntityKey::Spool(id.clone())
    }
}

#[derive(Debug, Default)]
pub struct EntityLocks {
    held: Mutex<HashSet<EntityKey>>,
    released: Condvar,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until every key is free, then hold all of them until the guard
    /// drops. Duplicate keys are allowed.
    pub fn acquire(
        &self,
        keys: impl IntoIterator<Item = EntityKey>,
    ) -> EngineResult<EntityGuard<'_>> {
        let keys: Vec<EntityKey> = keys
            .into_iter()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let mut held = self.held.lock().map_err(|_| poisoned())?;
        while keys.iter().any(|key| held.contains(key)) {
            held = self.released.wait(held).map_err(|_| poisoned())?;
        }
        held.extend(keys.iter().cloned());

        Ok(EntityGuard { locks: self, keys })
    }

    /// Whether `key` is currently held by some operation.
    #[cfg(test)]
    pub fn is_held(&self, key: &EntityKey) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(key))
            .unwrap_or(false)
    }
}

fn poisoned() -> EngineError {
    EngineError::storage("entity lock table poisoned")
}

/// Releases its keys on drop.
#[derive(Debug)]
pub struct EntityGuard<'a> {
    locks: &'a EntityLocks,
    keys: Vec<EntityKey>,
}

impl EntityGuard<'_> {
    #[cfg(test)]
    pub fn keys(&self) -> &[EntityKey] {
        &self.keys
    }
}

impl Drop for EntityGuard<'_> {
    fn drop(&mut self) {
        let mut held = match self.locks.held.lock() {
            Ok(held) => held,
            Err(poisoned) => poisoned.into_inner(),
        };
        for key in &self.keys {
            held.remove(key);
        }
        drop(held);
        self.locks.released.notify_all();
    }
}
