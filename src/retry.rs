//! Bounded retry around single DDC exchanges.
//!
//! Each exchange class has a configurable maximum try count. Retriable
//! failures accumulate into a cause chain; success and fatal errors exit
//! immediately. The engine feeds every finished exchange to the display's
//! sleep tuning and to the global statistics.

use std::sync::Mutex;
use std::time::Instant;

use crate::dsa::{DynamicSleep, ExchangeOutcome, BASE_FAILED_EXCHANGE};
use crate::error::{DdcResult, ErrorInfo, Retriability, Status};
use crate::locking::CancelToken;
use crate::stats::Stats;

/// Hard ceiling on any per-class try cap.
pub const MAX_MAX_TRIES: u8 = 15;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TryClass {
    WriteOnly,
    ReadOnly,
    WriteRead,
    MultiPartRead,
    MultiPartWrite,
}

impl TryClass {
    pub const ALL: [TryClass; 5] = [
        TryClass::WriteOnly,
        TryClass::ReadOnly,
        TryClass::WriteRead,
        TryClass::MultiPartRead,
        TryClass::MultiPartWrite,
    ];

    pub fn index(self) -> usize {
        match self {
            TryClass::WriteOnly => 0,
            TryClass::ReadOnly => 1,
            TryClass::WriteRead => 2,
            TryClass::MultiPartRead => 3,
            TryClass::MultiPartWrite => 4,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TryClass::WriteOnly => "write only",
            TryClass::ReadOnly => "read only",
            TryClass::WriteRead => "write-read",
            TryClass::MultiPartRead => "multi-part read",
            TryClass::MultiPartWrite => "multi-part write",
        }
    }

    pub fn default_max_tries(self) -> u8 {
        match self {
            TryClass::WriteOnly | TryClass::ReadOnly => 4,
            TryClass::WriteRead => 6,
            TryClass::MultiPartRead | TryClass::MultiPartWrite => 8,
        }
    }
}

/// Per-class try caps, each in `[1, MAX_MAX_TRIES]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_tries: [u8; 5],
}

impl Default for RetryPolicy {
    fn default() -> Self {
        let mut max_tries = [0u8; 5];
        for class in TryClass::ALL {
            max_tries[class.index()] = class.default_max_tries();
        }
        RetryPolicy { max_tries }
    }
}

impl RetryPolicy {
    pub fn max_tries(&self, class: TryClass) -> u8 {
        self.max_tries[class.index()]
    }

    pub fn set_max_tries(&mut self, class: TryClass, tries: u8) -> DdcResult<()> {
        if tries < 1 || tries > MAX_MAX_TRIES {
            return Err(Status::InvalidArgument(format!(
                "max tries {} outside [1, {}]",
                tries, MAX_MAX_TRIES
            ))
            .at("RetryPolicy::set_max_tries"));
        }
        self.max_tries[class.index()] = tries;
        Ok(())
    }
}

/// Everything an exchange needs around its I/O closure.
pub struct RetryEnv<'a> {
    pub policy: &'a RetryPolicy,
    pub stats: &'a Stats,
    pub dsa: &'a Mutex<DynamicSleep>,
    pub cancel: Option<&'a CancelToken>,
}

impl RetryEnv<'_> {
    /// Runs `attempt` up to the class cap. The closure receives the
    /// 1-based attempt number.
    pub fn run<T>(
        &self,
        class: TryClass,
        site: &'static str,
        mut attempt: impl FnMut(u32) -> DdcResult<T>,
    ) -> DdcResult<T> {
        let max_tries = self.policy.max_tries(class) as u32;
        let started = Instant::now();
        let mut causes = Vec::new();

        for tryctr in 1..=max_tries {
            if let Some(cancel) = self.cancel {
                if cancel.is_cancelled() {
                    return Err(Status::Cancelled.at(site));
                }
            }
            if tryctr > 1 {
                let recovery = self.dsa.lock().unwrap().scaled(BASE_FAILED_EXCHANGE);
                std::thread::sleep(recovery);
            }

            match attempt(tryctr) {
                Ok(value) => {
                    self.stats
                        .record_tries(class, tryctr, true, started.elapsed());
                    self.dsa.lock().unwrap().record(ExchangeOutcome {
                        tries: tryctr,
                        succeeded: true,
                    });
                    return Ok(value);
                }
                // an explicit unsupported reply is a completed exchange,
                // not a transmission failure
                Err(err) if err.status == Status::ReportedUnsupported => {
                    self.stats
                        .record_tries(class, tryctr, true, started.elapsed());
                    self.dsa.lock().unwrap().record(ExchangeOutcome {
                        tries: tryctr,
                        succeeded: true,
                    });
                    return Err(err);
                }
                Err(err) => match err.status.retriability() {
                    Retriability::Retriable => {
                        log::debug!("{}: attempt {}/{} failed: {}", site, tryctr, max_tries, err);
                        causes.push(err);
                    }
                    Retriability::Busy | Retriability::Fatal => {
                        self.stats
                            .record_tries(class, tryctr, false, started.elapsed());
                        log::warn!("{}: fatal on attempt {}: {}", site, tryctr, err);
                        return Err(err);
                    }
                },
            }
        }

        self.stats
            .record_tries(class, max_tries, false, started.elapsed());
        self.dsa.lock().unwrap().record(ExchangeOutcome {
            tries: max_tries,
            succeeded: false,
        });
        let composite = ErrorInfo::retries(site, causes);
        log::warn!("{}: {}", site, composite);
        Err(composite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsa::DynamicSleep;

    fn env<'a>(
        policy: &'a RetryPolicy,
        stats: &'a Stats,
        dsa: &'a Mutex<DynamicSleep>,
    ) -> RetryEnv<'a> {
        RetryEnv {
            policy,
            stats,
            dsa,
            cancel: None,
        }
    }

    #[test]
    fn succeeds_on_later_attempt() {
        let policy = RetryPolicy::default();
        let stats = Stats::new();
        let dsa = Mutex::new(DynamicSleep::new());
        let mut pinned = dsa.lock().unwrap();
        pinned.pin(0.0); // no real sleeping in tests
        drop(pinned);

        let result = env(&policy, &stats, &dsa).run(TryClass::WriteRead, "test", |t| {
            if t < 3 {
                Err(Status::NullResponse.at("attempt"))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        let snap = stats.class_snapshot(TryClass::WriteRead);
        assert_eq!(snap.histogram[3], 1);
    }

    #[test]
    fn attempt_count_never_exceeds_cap() {
        let mut policy = RetryPolicy::default();
        policy.set_max_tries(TryClass::WriteRead, 2).unwrap();
        let stats = Stats::new();
        let dsa = Mutex::new(DynamicSleep::new());
        dsa.lock().unwrap().pin(0.0);

        let mut calls = 0;
        let result: DdcResult<()> = env(&policy, &stats, &dsa).run(TryClass::WriteRead, "test", |_| {
            calls += 1;
            Err(Status::ChecksumMismatch.at("attempt"))
        });
        assert_eq!(calls, 2);
        let err = result.unwrap_err();
        assert_eq!(err.status, Status::RetriesExhausted);
        assert_eq!(err.causes.len(), 2);
    }

    #[test]
    fn all_null_attempts_collapse() {
        let mut policy = RetryPolicy::default();
        policy.set_max_tries(TryClass::WriteRead, 3).unwrap();
        let stats = Stats::new();
        let dsa = Mutex::new(DynamicSleep::new());
        dsa.lock().unwrap().pin(0.0);

        let result: DdcResult<()> = env(&policy, &stats, &dsa).run(TryClass::WriteRead, "test", |_| {
            Err(Status::NullResponse.at("attempt"))
        });
        assert_eq!(result.unwrap_err().status, Status::AllResponsesNull);
    }

    #[test]
    fn fatal_errors_exit_immediately() {
        let policy = RetryPolicy::default();
        let stats = Stats::new();
        let dsa = Mutex::new(DynamicSleep::new());

        let mut calls = 0;
        let result: DdcResult<()> = env(&policy, &stats, &dsa).run(TryClass::WriteRead, "test", |_| {
            calls += 1;
            Err(Status::DisplayRemoved.at("attempt"))
        });
        assert_eq!(calls, 1);
        assert_eq!(result.unwrap_err().status, Status::DisplayRemoved);
    }

    #[test]
    fn cancellation_is_checked_between_attempts() {
        let policy = RetryPolicy::default();
        let stats = Stats::new();
        let dsa = Mutex::new(DynamicSleep::new());
        dsa.lock().unwrap().pin(0.0);
        let cancel = CancelToken::new();

        let mut calls = 0;
        let cancel_ref = cancel.clone();
        let env = RetryEnv {
            policy: &policy,
            stats: &stats,
            dsa: &dsa,
            cancel: Some(&cancel),
        };
        let result: DdcResult<()> = env.run(TryClass::WriteRead, "test", |_| {
            calls += 1;
            cancel_ref.cancel();
            Err(Status::NullResponse.at("attempt"))
        });
        assert_eq!(calls, 1);
        assert_eq!(result.unwrap_err().status, Status::Cancelled);
    }

    #[test]
    fn retry_failure_raises_sleep_multiplier() {
        let mut policy = RetryPolicy::default();
        policy.set_max_tries(TryClass::WriteRead, 2).unwrap();
        let stats = Stats::new();
        let dsa = Mutex::new(DynamicSleep::new());
        let before = dsa.lock().unwrap().multiplier();

        let _ = env(&policy, &stats, &dsa).run::<()>(TryClass::WriteRead, "test", |_| {
            Err(Status::NullResponse.at("attempt"))
        });
        assert!(dsa.lock().unwrap().multiplier() > before);
    }
}
