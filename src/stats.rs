//! Lock-free scheduler counters.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Stats {
    pub nr_dispatches: AtomicU64,
    pub nr_commit_failures: AtomicU64,
    pub nr_local_yields: AtomicU64,
    pub nr_pings: AtomicU64,
    pub nr_ticks: AtomicU64,
    pub nr_tick_preemptions: AtomicU64,
    pub nr_spin_fallbacks: AtomicU64,
}

/// Point-in-time snapshot of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metrics {
    pub nr_dispatches: u64,
    pub nr_commit_failures: u64,
    pub nr_local_yields: u64,
    pub nr_pings: u64,
    pub nr_ticks: u64,
    pub nr_tick_preemptions: u64,
    pub nr_spin_fallbacks: u64,
}

impl Stats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Metrics {
        Metrics {
            nr_dispatches: self.nr_dispatches.load(Ordering::Relaxed),
            nr_commit_failures: self.nr_commit_failures.load(Ordering::Relaxed),
            nr_local_yields: self.nr_local_yields.load(Ordering::Relaxed),
            nr_pings: self.nr_pings.load(Ordering::Relaxed),
            nr_ticks: self.nr_ticks.load(Ordering::Relaxed),
            nr_tick_preemptions: self.nr_tick_preemptions.load(Ordering::Relaxed),
            nr_spin_fallbacks: self.nr_spin_fallbacks.load(Ordering::Relaxed),
        }
    }
}
