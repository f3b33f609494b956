//! VCP exchanges on an open display handle.
//!
//! A handle owns the display's lock for its whole lifetime, so everything
//! issued through it is serialized against other users of the same display.
//! Every exchange goes through the retry engine and the display's sleep
//! tuning.

use std::thread;
use std::time::Duration;

use crate::commands::{
    CapabilitiesRequest, Command, CommandResult, FeatureCode, GetTimingReport, GetVcpFeature,
    SaveCurrentSettings, SetVcpFeature, TableRead, TableWrite, TimingMessage, VcpValue,
};
use crate::display::{DialectFlags, DisplayRef};
use crate::dsa::{Delay, BASE_FAILED_EXCHANGE, BASE_VERIFY_SETTLE};
use crate::error::{DdcResult, ErrorInfo, Status};
use crate::locking::{CancelToken, DisplayLockGuard};
use crate::packet::{self, MultiPartAssembler, Packet, MAX_FRAGMENT};
use crate::retry::{RetryEnv, RetryPolicy};
use crate::stats::Stats;
use crate::transport::{classify_os_error, I2cIo, I2C_ADDRESS_DDC_CI};

/// Table write payload per packet: fragment limit minus opcode, feature
/// code, and the two offset bytes.
const TABLE_WRITE_CHUNK: usize = MAX_FRAGMENT - 4;

/// Per-handle operation settings.
#[derive(Clone, Debug)]
pub struct OpenOptions {
    /// How long to wait for the display's lock; `None` blocks.
    pub lock_timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
    /// Read back and compare after every set.
    pub verify_sets: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            lock_timeout: None,
            cancel: None,
            verify_sets: true,
        }
    }
}

/// An open device handle on a display reference. At most one exists per
/// display at any instant; the embedded lock guard enforces it.
pub struct DisplayHandle<'a> {
    dref: &'a DisplayRef,
    io: Box<dyn I2cIo + 'a>,
    _guard: DisplayLockGuard<'a>,
    delay: Delay,
    policy: RetryPolicy,
    stats: &'a Stats,
    cancel: Option<CancelToken>,
    verify_sets: bool,
}

impl<'a> DisplayHandle<'a> {
    pub fn open(
        dref: &'a DisplayRef,
        io: Box<dyn I2cIo + 'a>,
        policy: RetryPolicy,
        stats: &'a Stats,
        options: OpenOptions,
    ) -> DdcResult<DisplayHandle<'a>> {
        if dref.is_removed() {
            return Err(Status::DisplayRemoved.at("DisplayHandle::open"));
        }
        let guard = dref.lock.acquire(options.lock_timeout)?;
        Ok(DisplayHandle {
            dref,
            io,
            _guard: guard,
            delay: Delay::default(),
            policy,
            stats,
            cancel: options.cancel,
            verify_sets: options.verify_sets,
        })
    }

    pub fn display(&self) -> &'a DisplayRef {
        self.dref
    }

    fn scaled(&self, base: Duration) -> Duration {
        self.dref.tuning.lock().unwrap().scaled(base)
    }

    /// Gets a non-table feature value. The result is the raw monitor
    /// answer; callers that want dialect interpretation apply
    /// [`apply_unsupported_dialect`] on top.
    pub fn get_vcp_feature(&mut self, code: FeatureCode) -> DdcResult<VcpValue> {
        const SITE: &str = "vcp::get_vcp_feature";
        let cmd = GetVcpFeature::new(code);
        let wire = packet::encode(&cmd.packet()?)?;
        let dref = self.dref;
        let policy = self.policy.clone();
        let cancel = self.cancel.clone();
        let env = RetryEnv {
            policy: &policy,
            stats: self.stats,
            dsa: &dref.tuning,
            cancel: cancel.as_ref(),
        };
        env.run(GetVcpFeature::RETRY_CLASS, SITE, |_| {
            let pkt = self.attempt_write_read(
                &wire,
                Duration::from_millis(GetVcpFeature::DELAY_RESPONSE_MS),
                Duration::from_millis(GetVcpFeature::DELAY_COMMAND_MS),
                GetVcpFeature::MAX_READ,
                SITE,
            )?;
            let value = VcpValue::decode(&pkt)?;
            if value.feature != code {
                return Err(Status::InvalidResponse("echoed feature code mismatch").at(SITE));
            }
            Ok(value)
        })
    }

    /// Sets a non-table feature, then (unless disabled) reads the value
    /// back after a settle delay and compares.
    pub fn set_vcp_feature(&mut self, code: FeatureCode, value: u16) -> DdcResult<()> {
        let cmd = SetVcpFeature::new(code, value);
        self.run_write_only(&cmd, "vcp::set_vcp_feature")?;
        if self.verify_sets {
            thread::sleep(self.scaled(BASE_VERIFY_SETTLE));
            let read_back = self.get_vcp_feature(code)?;
            if read_back.value() != value {
                return Err(Status::VerificationFailed {
                    expected: value,
                    actual: read_back.value(),
                }
                .at("vcp::set_vcp_feature"));
            }
        }
        Ok(())
    }

    /// Reads a table feature value, stitching reply fragments in strict
    /// offset order until the zero-length terminator.
    pub fn get_table_vcp(&mut self, code: FeatureCode) -> DdcResult<Vec<u8>> {
        const SITE: &str = "vcp::get_table_vcp";
        let mut assembler = MultiPartAssembler::new();
        loop {
            let offset = assembler.assembled_len() as u16;
            let fragment = self.run_write_read(&TableRead::new(code, offset), SITE)?;
            if fragment.offset != offset {
                return Err(Status::InvalidResponse("fragment offset mismatch").at(SITE));
            }
            if assembler.push(fragment.offset, fragment.bytes())? {
                break;
            }
        }
        assembler.finish()
    }

    /// Writes a table feature value in offset-tagged chunks.
    pub fn set_table_vcp(&mut self, code: FeatureCode, data: &[u8]) -> DdcResult<()> {
        let mut offset = 0u16;
        for chunk in data.chunks(TABLE_WRITE_CHUNK) {
            let cmd = TableWrite::new(code, offset, chunk);
            self.run_write_only(&cmd, "vcp::set_table_vcp")?;
            offset += chunk.len() as u16;
        }
        Ok(())
    }

    /// Retrieves the complete capabilities string.
    pub fn capabilities_string(&mut self) -> DdcResult<String> {
        const SITE: &str = "vcp::capabilities_string";
        let mut assembler = MultiPartAssembler::new();
        loop {
            let offset = assembler.assembled_len() as u16;
            let caps = self.run_write_read(&CapabilitiesRequest::new(offset), SITE)?;
            if caps.offset != offset {
                return Err(Status::InvalidResponse("fragment offset mismatch").at(SITE));
            }
            if assembler.push(caps.offset, &caps.data)? {
                break;
            }
        }
        let bytes = assembler.finish()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn save_current_settings(&mut self) -> DdcResult<()> {
        self.run_write_only(&SaveCurrentSettings, "vcp::save_current_settings")
    }

    pub fn get_timing_report(&mut self) -> DdcResult<TimingMessage> {
        self.run_write_read(&GetTimingReport, "vcp::get_timing_report")
    }

    fn run_write_only<C: Command<Ok = ()>>(
        &mut self,
        cmd: &C,
        site: &'static str,
    ) -> DdcResult<()> {
        let wire = packet::encode(&cmd.packet()?)?;
        let dref = self.dref;
        let policy = self.policy.clone();
        let cancel = self.cancel.clone();
        let env = RetryEnv {
            policy: &policy,
            stats: self.stats,
            dsa: &dref.tuning,
            cancel: cancel.as_ref(),
        };
        let delay_command = Duration::from_millis(C::DELAY_COMMAND_MS);
        env.run(C::RETRY_CLASS, site, |_| {
            self.attempt_write_only(&wire, delay_command, site)
        })
    }

    fn run_write_read<C: Command>(&mut self, cmd: &C, site: &'static str) -> DdcResult<C::Ok> {
        debug_assert!(C::MAX_READ > 0);
        let wire = packet::encode(&cmd.packet()?)?;
        let dref = self.dref;
        let policy = self.policy.clone();
        let cancel = self.cancel.clone();
        let env = RetryEnv {
            policy: &policy,
            stats: self.stats,
            dsa: &dref.tuning,
            cancel: cancel.as_ref(),
        };
        let response_delay = Duration::from_millis(C::DELAY_RESPONSE_MS);
        let delay_command = Duration::from_millis(C::DELAY_COMMAND_MS);
        env.run(C::RETRY_CLASS, site, |_| {
            let pkt =
                self.attempt_write_read(&wire, response_delay, delay_command, C::MAX_READ, site)?;
            C::Ok::decode(&pkt)
        })
    }

    /// One write attempt: wait out the previous command's delay, write the
    /// framed request, start the next-command delay.
    fn attempt_write_only(
        &mut self,
        wire: &[u8],
        delay_command: Duration,
        site: &'static str,
    ) -> DdcResult<()> {
        if let Err(e) = self.io.set_slave_address(I2C_ADDRESS_DDC_CI, false) {
            return Err(classify_os_error(&e).at(site));
        }
        self.delay.sleep();
        if let Err(e) = self.io.write(wire) {
            self.delay = Delay::new(self.scaled(BASE_FAILED_EXCHANGE));
            return Err(classify_os_error(&e).at(site));
        }
        self.delay = Delay::new(self.scaled(delay_command));
        Ok(())
    }

    /// One write-read attempt, returning the decoded reply packet.
    fn attempt_write_read(
        &mut self,
        wire: &[u8],
        response_delay: Duration,
        delay_command: Duration,
        max_read: usize,
        site: &'static str,
    ) -> DdcResult<Packet> {
        if let Err(e) = self.io.set_slave_address(I2C_ADDRESS_DDC_CI, false) {
            return Err(classify_os_error(&e).at(site));
        }
        self.delay.sleep();
        if let Err(e) = self.io.write(wire) {
            self.delay = Delay::new(self.scaled(BASE_FAILED_EXCHANGE));
            return Err(classify_os_error(&e).at(site));
        }
        thread::sleep(self.scaled(response_delay));
        let mut buf = vec![0u8; max_read];
        let n = match self.io.read(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                self.delay = Delay::new(self.scaled(BASE_FAILED_EXCHANGE));
                return Err(classify_os_error(&e).at(site));
            }
        };
        self.delay = Delay::new(self.scaled(delay_command));

        if n < 3 {
            return Err(Status::ShortRead {
                expected: 3,
                actual: n,
            }
            .at(site));
        }
        // monitors pad reads; trim to the declared frame when plausible and
        // let the codec judge the rest
        let declared = (buf[1] & 0x7F) as usize;
        let end = if buf[1] & 0x80 != 0 {
            (declared + 3).min(n)
        } else {
            n
        };
        packet::decode(&buf[..end])
    }
}

/// Applies the display's unsupported-signalling dialect to a raw get
/// result, converting dialect-specific answers into
/// [`Status::DeterminedUnsupported`].
pub fn apply_unsupported_dialect(
    dref: &DisplayRef,
    code: FeatureCode,
    result: DdcResult<VcpValue>,
) -> DdcResult<VcpValue> {
    const SITE: &str = "vcp::apply_unsupported_dialect";
    let flags = dref.flags();
    match result {
        Ok(value)
            if flags.contains(DialectFlags::USES_ALL_ZERO_BYTES) && value.bytes_all_zero() =>
        {
            Err(ErrorInfo::with_message(
                Status::DeterminedUnsupported,
                SITE,
                format!("feature {:#04x}: all-zero value bytes", code),
            ))
        }
        Err(e)
            if flags.contains(DialectFlags::USES_NULL_RESPONSE)
                && matches!(
                    e.status,
                    Status::NullResponse | Status::AllResponsesNull
                ) =>
        {
            Err(ErrorInfo::with_message(
                Status::DeterminedUnsupported,
                SITE,
                format!("feature {:#04x}: null response dialect", code),
            )
            .caused_by(e))
        }
        other => other,
    }
}
