//! Monotonic version counters and the optimistic-concurrency rule for imports.
use crate::error::{ArchiveError, Result};
use crate::resource::Versioned;
use crate::types::ResourceKey;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Outcome of presenting an incoming version against the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Verdict {
    Accept,
    Conflict { current: u64, incoming: u64 },
}

pub struct VersionLedger;

impl VersionLedger {
    /// The only sanctioned successor of a resource's version. The caller
    /// persists the returned value in the same transaction as the snapshot.
    pub fn next_version(resource: &impl Versioned) -> Result<u64> {
        resource
            .version_number()
            .checked_add(1)
            .ok_or_else(|| {
                let key = resource.key();
                ArchiveError::VersionOverflow {
                    kind: key.kind,
                    id: key.id,
                }
            })
    }

    /// Advances `resource` to its next version and returns it.
    pub fn advance(resource: &mut impl Versioned) -> Result<u64> {
        let next = Self::next_version(resource)?;
        resource.set_version_number(next);
        resource.touch();
        Ok(next)
    }

    /// Accepts only a strictly newer incoming version.
    pub fn accept_incoming(resource: &impl Versioned, incoming: u64) -> Verdict {
        let current = resource.version_number();
        if incoming > current {
            Verdict::Accept
        } else {
            Verdict::Conflict { current, incoming }
        }
    }
}

/// Striped per-resource write locks. A write unit holds the stripes of every
/// resource it touches for the duration of its transaction, so the
/// read-check-write of an import cannot interleave with another writer.
pub struct ResourceLocks {
    stripes: Vec<Mutex<()>>,
}

pub const DEFAULT_LOCK_STRIPES: usize = 64;

impl ResourceLocks {
    pub fn new(stripes: usize) -> Self {
        let stripes = stripes.max(1);
        Self {
            stripes: (0..stripes).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe(&self, key: &ResourceKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }

    /// Locks the stripes for `keys` in ascending stripe order.
    pub fn acquire(&self, keys: &[&ResourceKey]) -> Vec<MutexGuard<'_, ()>> {
        let mut indices: Vec<usize> = keys.iter().map(|key| self.stripe(key)).collect();
        indices.sort_unstable();
        indices.dedup();
        tracing::trace!(?indices, "acquiring resource locks");
        indices
            .into_iter()
            .map(|i| self.stripes[i].lock().unwrap_or_else(PoisonError::into_inner))
            .collect()
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }
}

impl Default for ResourceLocks {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_STRIPES)
    }
}
