//! Display references: one per monitor candidate found during discovery.

use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU16, Ordering};
use std::sync::{Mutex, OnceLock};

use bitflags::bitflags;

use crate::dsa::DynamicSleep;
use crate::edid::{MonitorModelKey, ParsedEdid};
use crate::locking::DisplayLock;

/// Communication did not work and no more specific cause is known.
pub const DISPNO_INVALID: i32 = -1;
/// Duplicate bus for a panel that is reachable on another bus.
pub const DISPNO_PHANTOM: i32 = -2;
/// Display disappeared after discovery.
pub const DISPNO_REMOVED: i32 = -3;
/// The DDC address was busy (EBUSY) during initial checks.
pub const DISPNO_BUSY: i32 = -4;

/// Where a display's DDC traffic goes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum IoPath {
    I2c { busno: u32 },
    Usb { bus: u8, device: u8 },
}

impl fmt::Display for IoPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IoPath::I2c { busno } => write!(f, "/dev/i2c-{}", busno),
            IoPath::Usb { bus, device } => write!(f, "usb:{}.{}", bus, device),
        }
    }
}

bitflags! {
    /// Protocol dialect and lifecycle flags, set by initial checks.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct DialectFlags: u16 {
        const COMMUNICATION_WORKING = 1 << 0;
        const COMMUNICATION_CHECKED = 1 << 1;
        /// Unsupported features come back as a valid reply with the
        /// unsupported bit set.
        const USES_DDC_FLAG = 1 << 2;
        /// Unsupported features come back as a Null Response.
        const USES_NULL_RESPONSE = 1 << 3;
        /// Unsupported features come back with mh=ml=sh=sl=0.
        const USES_ALL_ZERO_BYTES = 1 << 4;
        const DOES_NOT_INDICATE_UNSUPPORTED = 1 << 5;
        const BUSY = 1 << 6;
        const REMOVED = 1 << 7;
    }
}

impl DialectFlags {
    /// A working display carries exactly one unsupported-signalling
    /// convention; a non-working one carries at most one. Working implies
    /// checked.
    pub fn is_consistent(self) -> bool {
        let conventions = [
            DialectFlags::USES_DDC_FLAG,
            DialectFlags::USES_NULL_RESPONSE,
            DialectFlags::USES_ALL_ZERO_BYTES,
            DialectFlags::DOES_NOT_INDICATE_UNSUPPORTED,
        ]
        .iter()
        .filter(|f| self.contains(**f))
        .count();
        let working = self.contains(DialectFlags::COMMUNICATION_WORKING);
        let checked_if_working = !working || self.contains(DialectFlags::COMMUNICATION_CHECKED);
        let conventions_ok = if working {
            conventions == 1
        } else {
            conventions <= 1
        };
        conventions_ok && checked_if_working
    }
}

/// One discovered monitor candidate. Created during discovery and never
/// recreated in place; lives until the registry is discarded.
#[derive(Debug)]
pub struct DisplayRef {
    pub io_path: IoPath,
    pub edid: ParsedEdid,
    pub model_key: MonitorModelKey,
    dispno: AtomicI32,
    flags: AtomicU16,
    /// Per-display sleep tuning, mutated only under `lock`.
    pub tuning: Mutex<DynamicSleep>,
    /// Serializes all I/O on this display.
    pub lock: DisplayLock,
    /// Registry index of the real display this phantom duplicates.
    actual_display: OnceLock<usize>,
}

impl DisplayRef {
    pub fn new(io_path: IoPath, edid: ParsedEdid) -> DisplayRef {
        let model_key = edid.model_key();
        DisplayRef {
            io_path,
            edid,
            model_key,
            dispno: AtomicI32::new(DISPNO_INVALID),
            flags: AtomicU16::new(DialectFlags::empty().bits()),
            tuning: Mutex::new(DynamicSleep::new()),
            lock: DisplayLock::new(),
            actual_display: OnceLock::new(),
        }
    }

    pub fn dispno(&self) -> i32 {
        self.dispno.load(Ordering::Acquire)
    }

    pub fn set_dispno(&self, dispno: i32) {
        self.dispno.store(dispno, Ordering::Release);
    }

    pub fn flags(&self) -> DialectFlags {
        DialectFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn add_flags(&self, add: DialectFlags) {
        self.flags.fetch_or(add.bits(), Ordering::AcqRel);
    }

    pub fn remove_flags(&self, remove: DialectFlags) {
        self.flags.fetch_and(!remove.bits(), Ordering::AcqRel);
    }

    pub fn is_working(&self) -> bool {
        self.flags().contains(DialectFlags::COMMUNICATION_WORKING)
    }

    pub fn is_removed(&self) -> bool {
        self.flags().contains(DialectFlags::REMOVED)
    }

    pub fn mark_removed(&self) {
        self.add_flags(DialectFlags::REMOVED);
        self.set_dispno(DISPNO_REMOVED);
    }

    pub fn link_phantom(&self, actual_index: usize) {
        self.set_dispno(DISPNO_PHANTOM);
        // idempotent; a second identical link is a no-op
        let _ = self.actual_display.set(actual_index);
    }

    pub fn phantom_of(&self) -> Option<usize> {
        self.actual_display.get().copied()
    }
}

impl fmt::Display for DisplayRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "display {} ({}, {})",
            self.dispno(),
            self.io_path,
            self.model_key
        )
    }
}
