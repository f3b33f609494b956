//! Dynamic sleep adjustment.
//!
//! DDC/CI prescribes minimum intervals between transactions, but real
//! monitors tolerate anywhere from a tenth to ten times the nominal values.
//! Each display carries a sleep multiplier that scales every base interval;
//! the multiplier rises when exchanges need retries and decays cautiously
//! after a sustained run of clean exchanges.

use std::collections::VecDeque;
use std::thread::sleep;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Required delay between writing a request and reading its reply.
pub const BASE_WRITE_TO_READ: Duration = Duration::from_millis(40);
/// Required delay before the next command may be written.
pub const BASE_NEXT_WRITE: Duration = Duration::from_millis(50);
/// Required delay before a capabilities fragment reply may be read.
pub const BASE_CAPABILITIES_REPLY: Duration = Duration::from_millis(50);
/// Recovery delay after a failed exchange.
pub const BASE_FAILED_EXCHANGE: Duration = Duration::from_millis(40);
/// Settle time before the read-back that verifies a set.
pub const BASE_VERIFY_SETTLE: Duration = Duration::from_millis(50);

pub const MULTIPLIER_MAX: f64 = 10.0;
pub const MULTIPLIER_FLOOR: f64 = 0.1;
pub const MULTIPLIER_DEFAULT: f64 = 1.0;

const INCREASE_FACTOR: f64 = 1.5;
const DECREASE_FACTOR: f64 = 0.9;
/// A decrease requires this many consecutive first-try successes...
const DECREASE_CLEAN_RUN: u32 = 10;
/// ...and at least this long since the previous adjustment.
const DECREASE_DWELL: Duration = Duration::from_secs(30);
const OUTCOME_WINDOW: usize = 16;

/// Outcome of one logical exchange, as seen by the adaptive loop.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExchangeOutcome {
    /// Attempts the exchange took; 1 means first-try success.
    pub tries: u32,
    pub succeeded: bool,
}

/// Persisted per-display tuning counters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TuningSnapshot {
    pub multiplier: f64,
    pub exchanges: u64,
    pub retried_exchanges: u64,
    pub increases: u64,
    pub decreases: u64,
}

/// Per-display sleep tuning state. Mutated only under the display's lock.
#[derive(Debug)]
pub struct DynamicSleep {
    multiplier: f64,
    user_pinned: Option<f64>,
    adjustments_enabled: bool,
    window: VecDeque<ExchangeOutcome>,
    clean_run: u32,
    last_adjust: Instant,
    decrease_dwell: Duration,
    exchanges: u64,
    retried_exchanges: u64,
    increases: u64,
    decreases: u64,
}

impl Default for DynamicSleep {
    fn default() -> Self {
        DynamicSleep::new()
    }
}

impl DynamicSleep {
    pub fn new() -> DynamicSleep {
        DynamicSleep {
            multiplier: MULTIPLIER_DEFAULT,
            user_pinned: None,
            adjustments_enabled: true,
            window: VecDeque::with_capacity(OUTCOME_WINDOW),
            clean_run: 0,
            last_adjust: Instant::now(),
            decrease_dwell: DECREASE_DWELL,
            exchanges: 0,
            retried_exchanges: 0,
            increases: 0,
            decreases: 0,
        }
    }

    /// Restores tuning persisted from a previous run.
    pub fn from_snapshot(snap: &TuningSnapshot) -> DynamicSleep {
        let mut dsa = DynamicSleep::new();
        dsa.multiplier = snap.multiplier.clamp(MULTIPLIER_FLOOR, MULTIPLIER_MAX);
        dsa.exchanges = snap.exchanges;
        dsa.retried_exchanges = snap.retried_exchanges;
        dsa.increases = snap.increases;
        dsa.decreases = snap.decreases;
        dsa
    }

    pub fn snapshot(&self) -> TuningSnapshot {
        TuningSnapshot {
            multiplier: self.multiplier,
            exchanges: self.exchanges,
            retried_exchanges: self.retried_exchanges,
            increases: self.increases,
            decreases: self.decreases,
        }
    }

    /// Pins the multiplier, disabling all automatic motion.
    pub fn pin(&mut self, multiplier: f64) {
        self.user_pinned = Some(multiplier.clamp(0.0, MULTIPLIER_MAX));
    }

    /// Freezes the current multiplier without pinning a new value.
    pub fn disable_adjustment(&mut self) {
        self.adjustments_enabled = false;
    }

    #[cfg(test)]
    pub(crate) fn set_decrease_dwell(&mut self, dwell: Duration) {
        self.decrease_dwell = dwell;
    }

    pub fn multiplier(&self) -> f64 {
        self.user_pinned.unwrap_or(self.multiplier)
    }

    pub fn is_pinned(&self) -> bool {
        self.user_pinned.is_some()
    }

    /// Scales a base interval by the effective multiplier.
    pub fn scaled(&self, base: Duration) -> Duration {
        base.mul_f64(self.multiplier())
    }

    /// Feeds one exchange outcome into the adaptive loop.
    pub fn record(&mut self, outcome: ExchangeOutcome) {
        self.exchanges += 1;
        if !outcome.succeeded || outcome.tries > 1 {
            self.retried_exchanges += 1;
        }
        if self.window.len() == OUTCOME_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(outcome);

        if self.user_pinned.is_some() || !self.adjustments_enabled {
            return;
        }

        if !outcome.succeeded || outcome.tries > 1 {
            let next = (self.multiplier * INCREASE_FACTOR).min(MULTIPLIER_MAX);
            if next > self.multiplier {
                log::debug!(
                    "sleep multiplier raised {:.2} -> {:.2}",
                    self.multiplier,
                    next
                );
                self.increases += 1;
            }
            self.multiplier = next;
            self.clean_run = 0;
            self.last_adjust = Instant::now();
            return;
        }

        self.clean_run += 1;
        if self.clean_run >= DECREASE_CLEAN_RUN
            && self.last_adjust.elapsed() >= self.decrease_dwell
            && self.multiplier > MULTIPLIER_FLOOR
        {
            let next = (self.multiplier * DECREASE_FACTOR).max(MULTIPLIER_FLOOR);
            log::debug!(
                "sleep multiplier lowered {:.2} -> {:.2}",
                self.multiplier,
                next
            );
            self.multiplier = next;
            self.decreases += 1;
            self.clean_run = 0;
            self.last_adjust = Instant::now();
        }
    }

    pub fn recent_outcomes(&self) -> impl Iterator<Item = &ExchangeOutcome> {
        self.window.iter()
    }
}

/// Tracks the residue of a required inter-command delay, sleeping only for
/// whatever portion has not already elapsed.
#[derive(Clone, Debug, Default)]
pub struct Delay {
    time: Option<Instant>,
    delay: Duration,
}

impl Delay {
    /// Creates a new delay starting now.
    pub fn new(delay: Duration) -> Self {
        Delay {
            time: Some(Instant::now()),
            delay,
        }
    }

    /// The time remaining in this delay.
    pub fn remaining(&self) -> Duration {
        self.time
            .as_ref()
            .and_then(|time| self.delay.checked_sub(time.elapsed()))
            .unwrap_or_default()
    }

    /// Waits out the remaining time in this delay.
    pub fn sleep(&mut self) {
        if let Some(delay) = self
            .time
            .take()
            .and_then(|time| self.delay.checked_sub(time.elapsed()))
        {
            sleep(delay);
        }
    }
}
