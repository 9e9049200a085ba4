//! TTL cache collapsing source replays.
//!
//! Sources replay: a node reconnecting to the grid re-receives its whole
//! backlog, and some sources simply deliver twice. The engine marks every
//! workload it starts provisioning here and silently skips ids seen within
//! the TTL. Only the provision path consults the cache; a decommission is
//! never skipped.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use plfm_gridtypes::WorkloadId;

/// Default time a mark stays live.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

/// TTL map of recently processed workload ids.
///
/// Owned solely by the engine loop; no locking. Expired marks are swept
/// opportunistically on every mutation.
#[derive(Debug)]
pub struct DedupCache {
    ttl: Duration,
    marks: BTreeMap<WorkloadId, Instant>,
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl DedupCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            marks: BTreeMap::new(),
        }
    }

    /// Whether `id` was marked within the TTL.
    pub fn contains(&self, id: &WorkloadId) -> bool {
        match self.marks.get(id) {
            Some(marked) => marked.elapsed() < self.ttl,
            None => false,
        }
    }

    /// Mark `id` as processed now.
    pub fn mark(&mut self, id: WorkloadId) {
        self.sweep();
        self.marks.insert(id, Instant::now());
    }

    /// Drop expired marks.
    pub fn sweep(&mut self) {
        let ttl = self.ttl;
        self.marks.retain(|_, marked| marked.elapsed() < ttl);
    }

    /// Number of live marks.
    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_contains() {
        let mut cache = DedupCache::default();
        let id = WorkloadId::new(11, 1);

        assert!(!cache.contains(&id));
        cache.mark(id.clone());
        assert!(cache.contains(&id));
    }

    #[test]
    fn test_expiry() {
        let mut cache = DedupCache::new(Duration::from_millis(10));
        let id = WorkloadId::new(11, 1);

        cache.mark(id.clone());
        std::thread::sleep(Duration::from_millis(20));
        assert!(!cache.contains(&id));

        // sweep drops the stale mark entirely
        cache.sweep();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_sweep_on_mark() {
        let mut cache = DedupCache::new(Duration::from_millis(10));
        cache.mark(WorkloadId::new(1, 1));
        std::thread::sleep(Duration::from_millis(20));

        cache.mark(WorkloadId::new(2, 1));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remark_refreshes() {
        let mut cache = DedupCache::new(Duration::from_millis(40));
        let id = WorkloadId::new(11, 1);

        cache.mark(id.clone());
        std::thread::sleep(Duration::from_millis(25));
        cache.mark(id.clone());
        std::thread::sleep(Duration::from_millis(25));

        assert!(cache.contains(&id));
    }
}
