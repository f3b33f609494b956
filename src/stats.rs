//! Retry statistics and optional per-call profiling.
//!
//! Counters are atomically incremented and read without synchronization;
//! slightly stale snapshots are acceptable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::retry::{TryClass, MAX_MAX_TRIES};

struct TryClassCounters {
    /// Index t = exchanges that succeeded on attempt t (1-based); the final
    /// slot counts exchanges that exhausted their tries.
    histogram: [AtomicU64; MAX_MAX_TRIES as usize + 2],
    elapsed_ns: AtomicU64,
}

impl TryClassCounters {
    fn new() -> TryClassCounters {
        TryClassCounters {
            histogram: std::array::from_fn(|_| AtomicU64::new(0)),
            elapsed_ns: AtomicU64::new(0),
        }
    }
}

#[derive(Default)]
struct ProfileEntry {
    calls: u64,
    elapsed_ns: u64,
}

/// Library-wide counters, owned by the context.
pub struct Stats {
    classes: [TryClassCounters; 5],
    profile: Mutex<HashMap<&'static str, ProfileEntry>>,
}

impl Default for Stats {
    fn default() -> Self {
        Stats::new()
    }
}

impl Stats {
    pub fn new() -> Stats {
        Stats {
            classes: std::array::from_fn(|_| TryClassCounters::new()),
            profile: Mutex::new(HashMap::new()),
        }
    }

    /// Records one finished exchange: the attempts it took, whether it
    /// succeeded, and its wall time.
    pub fn record_tries(&self, class: TryClass, tries: u32, succeeded: bool, elapsed: Duration) {
        let counters = &self.classes[class.index()];
        let slot = if succeeded {
            (tries as usize).min(MAX_MAX_TRIES as usize)
        } else {
            MAX_MAX_TRIES as usize + 1
        };
        counters.histogram[slot].fetch_add(1, Ordering::Relaxed);
        counters
            .elapsed_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Records one timed library-level call for the profiling report.
    pub fn record_call(&self, name: &'static str, elapsed: Duration) {
        let mut profile = self.profile.lock().unwrap();
        let entry = profile.entry(name).or_default();
        entry.calls += 1;
        entry.elapsed_ns += elapsed.as_nanos() as u64;
    }

    pub fn class_snapshot(&self, class: TryClass) -> TryClassSnapshot {
        let counters = &self.classes[class.index()];
        let mut histogram = [0u64; MAX_MAX_TRIES as usize + 1];
        let mut successes = 0;
        let mut attempts = 0;
        for t in 1..=MAX_MAX_TRIES as usize {
            let n = counters.histogram[t].load(Ordering::Relaxed);
            histogram[t] = n;
            successes += n;
            attempts += n * t as u64;
        }
        let failed = counters.histogram[MAX_MAX_TRIES as usize + 1].load(Ordering::Relaxed);
        TryClassSnapshot {
            class,
            attempts,
            successes,
            failed,
            histogram,
            elapsed: Duration::from_nanos(counters.elapsed_ns.load(Ordering::Relaxed)),
        }
    }

    pub fn snapshot(&self) -> Vec<TryClassSnapshot> {
        TryClass::ALL.iter().map(|c| self.class_snapshot(*c)).collect()
    }

    pub fn profile_snapshot(&self) -> Vec<ProfileSnapshot> {
        let profile = self.profile.lock().unwrap();
        let mut rows: Vec<ProfileSnapshot> = profile
            .iter()
            .map(|(name, e)| ProfileSnapshot {
                name,
                calls: e.calls,
                elapsed: Duration::from_nanos(e.elapsed_ns),
            })
            .collect();
        rows.sort_by_key(|r| r.name);
        rows
    }
}

/// Point-in-time view of one retry class.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TryClassSnapshot {
    pub class: TryClass,
    /// Total I/O attempts, retries included.
    pub attempts: u64,
    pub successes: u64,
    pub failed: u64,
    /// `histogram[t]` = exchanges that succeeded on attempt `t`.
    pub histogram: [u64; MAX_MAX_TRIES as usize + 1],
    pub elapsed: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProfileSnapshot {
    pub name: &'static str,
    pub calls: u64,
    pub elapsed: Duration,
}
