//! Version assignment for rendered rule sets
//!
//! Each cohort (callers resolving to the same rule set) remembers the
//! fingerprint of its last render and the version it was given. A changed
//! fingerprint takes the next value of a single controller-wide counter, so
//! versions never decrease across cohorts or over time. An unchanged
//! fingerprint keeps its version.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::Result;
use crate::storage::ControllerStore;

#[derive(Debug, Default)]
struct Inner {
    counter: u64,
    cohorts: HashMap<String, (String, u64)>,
}

/// Hands out monotonic versions keyed by cohort and render fingerprint
///
/// The counter is persisted through the store, so a restarted controller
/// continues above every version it handed out before. Cohort fingerprints
/// live in memory only; after a restart each cohort takes one fresh version.
#[derive(Debug, Default)]
pub struct VersionTracker {
    inner: Mutex<Inner>,
}

impl VersionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Version for `cohort` given the fingerprint of its current render
    pub fn version_for(
        &self,
        store: &dyn ControllerStore,
        cohort: &str,
        fingerprint: &str,
    ) -> Result<u64> {
        let mut inner = self.inner.lock();
        if let Some((known, version)) = inner.cohorts.get(cohort) {
            if known == fingerprint {
                return Ok(*version);
            }
        }
        let version = inner.counter.max(store.latest_version()?) + 1;
        store.record_version(version)?;
        inner.counter = version;
        inner
            .cohorts
            .insert(cohort.to_string(), (fingerprint.to_string(), version));
        tracing::debug!(cohort = %cohort, version, "assigned new config version");
        Ok(version)
    }

    /// Version last assigned to `cohort`, if any
    pub fn current(&self, cohort: &str) -> Option<u64> {
        self.inner.lock().cohorts.get(cohort).map(|(_, v)| *v)
    }

    /// Highest version this process has handed out
    pub fn latest(&self) -> u64 {
        self.inner.lock().counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;

    #[test]
    fn test_identical_render_reuses_version() {
        let store = InMemoryStore::new();
        let tracker = VersionTracker::new();
        let v1 = tracker.version_for(&store, "c", "h1").unwrap();
        assert_eq!(tracker.version_for(&store, "c", "h1").unwrap(), v1);
        assert_eq!(tracker.current("c"), Some(v1));
    }

    #[test]
    fn test_versions_are_monotonic_across_cohorts() {
        let store = InMemoryStore::new();
        let tracker = VersionTracker::new();
        let a1 = tracker.version_for(&store, "a", "x").unwrap();
        let b1 = tracker.version_for(&store, "b", "y").unwrap();
        let a2 = tracker.version_for(&store, "a", "z").unwrap();
        assert!(a1 < b1 && b1 < a2);

        // Going back to an earlier render still moves forward
        let a3 = tracker.version_for(&store, "a", "x").unwrap();
        assert!(a3 > a2);
        assert_eq!(tracker.latest(), a3);
        assert_eq!(store.latest_version().unwrap(), a3);
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn test_counter_continues_after_restart() {
        use crate::storage::SqliteStore;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controller.db");
        let before = {
            let store = SqliteStore::open(&path).unwrap();
            let tracker = VersionTracker::new();
            tracker.version_for(&store, "c", "empty").unwrap();
            tracker.version_for(&store, "c", "approved").unwrap()
        };

        let store = SqliteStore::open(&path).unwrap();
        let tracker = VersionTracker::new();
        let after = tracker.version_for(&store, "c", "approved").unwrap();
        assert!(after > before, "version went backwards: {} -> {}", before, after);
    }
}
