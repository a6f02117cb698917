use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Per-driver counters. The global `metrics` facade sees the same events
/// aggregated across drivers; these stay attributable to one query.
#[derive(Debug, Default)]
pub struct DriverStats {
    entries: AtomicU64,
    direct_patches: AtomicU64,
    fetches: AtomicU64,
    queries: AtomicU64,
    requeries: AtomicU64,
    invariant_breaches: AtomicU64,
    phase_changes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub entries: u64,
    pub direct_patches: u64,
    pub fetches: u64,
    pub queries: u64,
    pub requeries: u64,
    pub invariant_breaches: u64,
    pub phase_changes: u64,
}

impl DriverStats {
    pub(crate) fn entry(&self) { self.entries.fetch_add(1, Ordering::Relaxed); }
    pub(crate) fn direct_patch(&self) { self.direct_patches.fetch_add(1, Ordering::Relaxed); }
    pub(crate) fn fetch(&self) { self.fetches.fetch_add(1, Ordering::Relaxed); }
    pub(crate) fn query(&self) { self.queries.fetch_add(1, Ordering::Relaxed); }
    pub(crate) fn requery(&self) { self.requeries.fetch_add(1, Ordering::Relaxed); }
    pub(crate) fn invariant_breach(&self) { self.invariant_breaches.fetch_add(1, Ordering::Relaxed); }
    pub(crate) fn phase_change(&self) { self.phase_changes.fetch_add(1, Ordering::Relaxed); }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            entries: self.entries.load(Ordering::Relaxed),
            direct_patches: self.direct_patches.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
            requeries: self.requeries.load(Ordering::Relaxed),
            invariant_breaches: self.invariant_breaches.load(Ordering::Relaxed),
            phase_changes: self.phase_changes.load(Ordering::Relaxed),
        }
    }
}
