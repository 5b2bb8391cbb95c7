//! Per-name pull exclusion.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use vmpull_core::error::{Result, VmError};

/// Set of local VM names with a pull in flight.
///
/// Clones share the same set.
#[derive(Debug, Clone, Default)]
pub struct PullLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl PullLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `name`, failing fast if another pull holds it.
    pub fn try_acquire(&self, name: &str) -> Result<PullLockGuard> {
        let mut held = self.held.lock();
        if !held.insert(name.to_string()) {
            return Err(VmError::ConcurrentPullConflictError(name.to_string()));
        }
        Ok(PullLockGuard {
            held: Arc::clone(&self.held),
            name: name.to_string(),
        })
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.held.lock().contains(name)
    }
}

/// Releases the name on drop, on every exit path.
#[derive(Debug)]
pub struct PullLockGuard {
    held: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl PullLockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for PullLockGuard {
    fn drop(&mut self) {
        self.held.lock().remove(&self.name);
    }
}
