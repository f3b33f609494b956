//! Display discovery: bus enumeration, EDID probing, dialect detection,
//! display numbering, and phantom filtering.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::thread;

use crate::display::{DialectFlags, DisplayRef, IoPath, DISPNO_BUSY, DISPNO_INVALID};
use crate::dsa::{DynamicSleep, TuningSnapshot};
use crate::edid::{ParsedEdid, EDID_BLOCK_SIZE};
use crate::error::Status;
use crate::retry::RetryPolicy;
use crate::stats::Stats;
use crate::sysfs::SysfsView;
use crate::transport::{self, I2cDevice, I2cIo};
use crate::vcp::{DisplayHandle, OpenOptions};

/// Run per-display initial checks in parallel once at least this many
/// candidates were found.
pub const DISPLAY_CHECK_ASYNC_THRESHOLD: usize = 3;

/// Outcome of enumerating the system's I2C buses.
#[derive(Debug, Default)]
pub struct BusScan {
    /// Bus numbers whose device nodes are accessible.
    pub buses: Vec<u32>,
    pub errors: Vec<BusOpenError>,
}

/// A bus whose device node could not be opened during detection.
#[derive(Clone, Debug)]
pub struct BusOpenError {
    pub io_path: IoPath,
    pub errno: Option<i32>,
    pub message: String,
}

/// Source of I2C buses. Production uses [`LinuxBuses`]; tests substitute
/// scripted providers.
pub trait BusProvider: Send + Sync {
    fn scan(&self) -> BusScan;
    fn open(&self, busno: u32) -> io::Result<Box<dyn I2cIo>>;
}

/// External collaborator interface for the USB HID monitor-control path.
/// The discovery pipeline is IO-mode agnostic past this point.
pub trait UsbMonitorSource: Sync {
    fn monitors(&self) -> Vec<UsbMonitorInfo>;
}

/// One USB monitor as reported by a [`UsbMonitorSource`].
#[derive(Clone, Debug)]
pub struct UsbMonitorInfo {
    pub bus: u8,
    pub device: u8,
    pub edid: Vec<u8>,
}

/// Settings consumed by [`detect`].
pub struct DiscoveryOptions<'a> {
    pub async_threshold: usize,
    /// 128 or 256; how much EDID to request from each candidate bus.
    pub edid_read_size: usize,
    pub policy: RetryPolicy,
    /// User-pinned sleep multiplier, applied to every display.
    pub sleep_multiplier: Option<f64>,
    /// When false, multipliers stay frozen at their seeded values.
    pub dynamic_sleep: bool,
    /// Persisted tuning per EDID identity key, from the displays cache.
    pub tuning_seed: HashMap<String, TuningSnapshot>,
    pub usb: Option<&'a dyn UsbMonitorSource>,
}

impl Default for DiscoveryOptions<'_> {
    fn default() -> Self {
        DiscoveryOptions {
            async_threshold: DISPLAY_CHECK_ASYNC_THRESHOLD,
            edid_read_size: EDID_BLOCK_SIZE,
            policy: RetryPolicy::default(),
            sleep_multiplier: None,
            dynamic_sleep: true,
            tuning_seed: HashMap::new(),
            usb: None,
        }
    }
}

/// The master list of discovered displays. Built once, read-only until
/// teardown.
#[derive(Default)]
pub struct DisplayRegistry {
    displays: Vec<Arc<DisplayRef>>,
    pub open_errors: Vec<BusOpenError>,
}

impl DisplayRegistry {
    pub fn displays(&self) -> &[Arc<DisplayRef>] {
        &self.displays
    }

    pub fn display_count(&self, include_invalid: bool) -> usize {
        self.displays
            .iter()
            .filter(|d| include_invalid || d.dispno() > 0)
            .count()
    }

    pub fn by_dispno(&self, dispno: i32) -> Option<&Arc<DisplayRef>> {
        self.displays.iter().find(|d| d.dispno() == dispno)
    }

    pub fn by_busno(&self, busno: u32) -> Option<&Arc<DisplayRef>> {
        self.displays
            .iter()
            .find(|d| d.io_path == IoPath::I2c { busno })
    }

    pub fn by_edid(&self, raw: &[u8]) -> Option<&Arc<DisplayRef>> {
        self.displays
            .iter()
            .find(|d| raw.get(..EDID_BLOCK_SIZE) == Some(d.edid.raw.as_slice()))
    }

    /// Finds the first valid display matching every given identity filter.
    pub fn by_model(
        &self,
        mfg: Option<&str>,
        model: Option<&str>,
        serial: Option<&str>,
    ) -> Option<&Arc<DisplayRef>> {
        self.displays.iter().find(|d| {
            d.dispno() > 0
                && mfg.map_or(true, |m| d.edid.mfg_id == m)
                && model.map_or(true, |m| d.edid.model_name == m)
                && serial.map_or(true, |s| d.edid.serial_ascii == s)
        })
    }
}

/// Enumerates buses, probes EDIDs, runs initial checks, assigns display
/// numbers, and filters phantoms.
pub fn detect(
    provider: &dyn BusProvider,
    sysfs: &SysfsView,
    stats: &Stats,
    options: &DiscoveryOptions,
) -> DisplayRegistry {
    let scan = provider.scan();
    let mut registry = DisplayRegistry {
        displays: Vec::new(),
        open_errors: scan.errors,
    };

    for busno in scan.buses {
        match probe_edid(provider, busno, options.edid_read_size) {
            Ok(Some(edid)) => {
                let dref = DisplayRef::new(IoPath::I2c { busno }, edid);
                seed_tuning(&dref, options);
                registry.displays.push(Arc::new(dref));
            }
            Ok(None) => {
                log::debug!("/dev/i2c-{}: no usable EDID, skipping", busno);
            }
            Err(e) => {
                registry.open_errors.push(BusOpenError {
                    io_path: IoPath::I2c { busno },
                    errno: e.raw_os_error(),
                    message: e.to_string(),
                });
            }
        }
    }

    if let Some(usb) = options.usb {
        for monitor in usb.monitors() {
            match ParsedEdid::parse(&monitor.edid) {
                Ok(edid) => {
                    let dref = DisplayRef::new(
                        IoPath::Usb {
                            bus: monitor.bus,
                            device: monitor.device,
                        },
                        edid,
                    );
                    seed_tuning(&dref, options);
                    // the HID report path carries its own framing; a
                    // device that enumerates is communicating
                    dref.add_flags(
                        DialectFlags::COMMUNICATION_CHECKED
                            | DialectFlags::COMMUNICATION_WORKING
                            | DialectFlags::USES_DDC_FLAG,
                    );
                    registry.displays.push(Arc::new(dref));
                }
                Err(e) => {
                    log::warn!(
                        "usb:{}.{}: unparseable EDID: {}",
                        monitor.bus,
                        monitor.device,
                        e
                    );
                }
            }
        }
    }

    let unchecked: Vec<Arc<DisplayRef>> = registry
        .displays
        .iter()
        .filter(|d| !d.flags().contains(DialectFlags::COMMUNICATION_CHECKED))
        .cloned()
        .collect();
    if unchecked.len() >= options.async_threshold {
        thread::scope(|scope| {
            for dref in &unchecked {
                let dref = Arc::clone(dref);
                scope.spawn(move || initial_checks_by_dref(provider, stats, options, &dref));
            }
        });
    } else {
        for dref in &unchecked {
            initial_checks_by_dref(provider, stats, options, dref);
        }
    }

    assign_display_numbers(&registry.displays);
    filter_phantom_displays(&registry.displays, sysfs);

    log::info!(
        "detected {} display(s) on {} candidate bus(es)",
        registry.display_count(false),
        registry.displays.len()
    );
    registry
}

fn probe_edid(
    provider: &dyn BusProvider,
    busno: u32,
    edid_read_size: usize,
) -> io::Result<Option<ParsedEdid>> {
    let mut dev = provider.open(busno)?;
    let mut buf = vec![0u8; edid_read_size];
    let n = match transport::read_edid(dev.as_mut(), 0, &mut buf) {
        Ok(n) => n,
        Err(e) => {
            log::debug!("/dev/i2c-{}: EDID read failed: {}", busno, e);
            return Ok(None);
        }
    };
    if n < EDID_BLOCK_SIZE {
        log::debug!("/dev/i2c-{}: EDID read returned {} bytes", busno, n);
        return Ok(None);
    }
    match ParsedEdid::parse(&buf[..n]) {
        Ok(edid) => Ok(Some(edid)),
        Err(e) => {
            log::debug!("/dev/i2c-{}: {}", busno, e);
            Ok(None)
        }
    }
}

fn seed_tuning(dref: &DisplayRef, options: &DiscoveryOptions) {
    let mut tuning = dref.tuning.lock().unwrap();
    if let Some(snap) = options.tuning_seed.get(&dref.edid.identity_key()) {
        *tuning = DynamicSleep::from_snapshot(snap);
        log::debug!(
            "{}: seeded sleep multiplier {:.2} from displays cache",
            dref.io_path,
            tuning.multiplier()
        );
    }
    if let Some(multiplier) = options.sleep_multiplier {
        tuning.pin(multiplier);
    }
    if !options.dynamic_sleep {
        tuning.disable_adjustment();
    }
}

/// Opens the display and performs dialect detection on the open handle.
fn initial_checks_by_dref(
    provider: &dyn BusProvider,
    stats: &Stats,
    options: &DiscoveryOptions,
    dref: &DisplayRef,
) {
    let busno = match dref.io_path {
        IoPath::I2c { busno } => busno,
        IoPath::Usb { .. } => return,
    };
    match provider.open(busno) {
        Ok(io) => {
            let open = DisplayHandle::open(
                dref,
                io,
                options.policy.clone(),
                stats,
                OpenOptions {
                    verify_sets: false,
                    lock_timeout: None,
                    cancel: None,
                },
            );
            match open {
                Ok(mut handle) => {
                    initial_checks_by_handle(&mut handle);
                }
                Err(e) => {
                    if e.status == Status::DisplayBusy {
                        dref.add_flags(DialectFlags::BUSY);
                    }
                    log::warn!("{}: unable to open: {}", dref.io_path, e);
                }
            }
        }
        Err(e) => {
            if e.raw_os_error() == Some(libc::EBUSY) {
                dref.add_flags(DialectFlags::BUSY);
            }
            log::warn!("{}: unable to open: {}", dref.io_path, e);
        }
    }
    dref.add_flags(DialectFlags::COMMUNICATION_CHECKED);
}

/// Determines whether DDC communication works and which convention the
/// monitor uses to signal an unsupported feature.
///
/// Probes feature 0x00 (reserved, should not exist), falling back to 0x41
/// (also reserved) and 0x10 (brightness, near-universal) to separate the
/// conventions: a proper unsupported reply, all-zero value bytes, or a
/// Null Response.
pub fn initial_checks_by_handle(handle: &mut DisplayHandle) -> bool {
    let dref = handle.display();
    if dref.flags().contains(DialectFlags::COMMUNICATION_CHECKED) {
        return dref.is_working();
    }

    match handle.get_vcp_feature(0x00) {
        Err(e) if e.status == Status::ReportedUnsupported => {
            dref.add_flags(DialectFlags::COMMUNICATION_WORKING | DialectFlags::USES_DDC_FLAG);
        }
        Ok(value) if value.bytes_all_zero() => {
            // could be the all-zero convention, or 0x00 could genuinely be
            // a feature on this monitor; probe another reserved code
            match handle.get_vcp_feature(0x41) {
                Ok(v41) if v41.bytes_all_zero() => {
                    dref.add_flags(
                        DialectFlags::COMMUNICATION_WORKING | DialectFlags::USES_ALL_ZERO_BYTES,
                    );
                }
                Ok(_) => {
                    log::warn!(
                        "{}: feature 0x41 should not exist but returns a nonzero value",
                        dref.io_path
                    );
                    dref.add_flags(
                        DialectFlags::COMMUNICATION_WORKING | DialectFlags::USES_NULL_RESPONSE,
                    );
                }
                Err(e) if e.status == Status::ReportedUnsupported => {
                    // feature 0x00 actually worked on this monitor
                    dref.add_flags(
                        DialectFlags::COMMUNICATION_WORKING | DialectFlags::USES_DDC_FLAG,
                    );
                }
                Err(e)
                    if matches!(
                        e.status,
                        Status::NullResponse | Status::AllResponsesNull
                    ) =>
                {
                    probe_brightness(handle);
                }
                Err(e) => {
                    note_failure(dref, &e.status);
                }
            }
        }
        Ok(_) => {
            dref.add_flags(
                DialectFlags::COMMUNICATION_WORKING
                    | DialectFlags::DOES_NOT_INDICATE_UNSUPPORTED,
            );
        }
        Err(e) if matches!(e.status, Status::NullResponse | Status::AllResponsesNull) => {
            probe_brightness(handle);
        }
        Err(e) => {
            note_failure(dref, &e.status);
        }
    }

    dref.add_flags(DialectFlags::COMMUNICATION_CHECKED);
    debug_assert!(dref.flags().is_consistent());
    dref.is_working()
}

/// Step (c): a null answer for a reserved feature means either the
/// null-response convention or a dead channel; brightness decides.
fn probe_brightness(handle: &mut DisplayHandle) {
    let dref = handle.display();
    match handle.get_vcp_feature(0x10) {
        Ok(_) => {
            dref.add_flags(
                DialectFlags::COMMUNICATION_WORKING | DialectFlags::USES_NULL_RESPONSE,
            );
        }
        Err(e) => {
            log::debug!("{}: brightness probe failed: {}", dref.io_path, e);
        }
    }
}

fn note_failure(dref: &DisplayRef, status: &Status) {
    if *status == Status::DisplayBusy {
        dref.add_flags(DialectFlags::BUSY);
    }
    log::debug!("{}: communication not working: {}", dref.io_path, status);
}

/// Assigns positive display numbers to working displays in discovery
/// order; everything else gets the matching sentinel.
fn assign_display_numbers(displays: &[Arc<DisplayRef>]) {
    let mut dispno_max = 0;
    for dref in displays {
        if dref.is_working() {
            dispno_max += 1;
            dref.set_dispno(dispno_max);
        } else if dref.flags().contains(DialectFlags::BUSY) {
            dref.set_dispno(DISPNO_BUSY);
        } else {
            dref.set_dispno(DISPNO_INVALID);
        }
    }
}

/// Marks non-working displays that duplicate a working display's EDID as
/// phantoms, linking them to the real display. Idempotent.
pub fn filter_phantom_displays(displays: &[Arc<DisplayRef>], sysfs: &SysfsView) {
    let valid: Vec<usize> = (0..displays.len())
        .filter(|&i| displays[i].dispno() > 0)
        .collect();
    if valid.is_empty() {
        return;
    }
    for dref in displays {
        if dref.dispno() >= 0 {
            continue;
        }
        for &valid_index in &valid {
            if is_phantom_display(dref, &displays[valid_index], sysfs) {
                dref.link_phantom(valid_index);
                break;
            }
        }
    }
}

/// An invalid display is a phantom of a valid one when the EDID identity
/// fields match and the invalid bus's connector reports itself
/// disconnected, disabled, and without an edid attribute.
fn is_phantom_display(invalid: &DisplayRef, valid: &DisplayRef, sysfs: &SysfsView) -> bool {
    if !invalid.edid.ids_match(&valid.edid) {
        return false;
    }
    let (IoPath::I2c { busno }, IoPath::I2c { .. }) = (invalid.io_path, valid.io_path) else {
        return false;
    };
    let Some(dir) = sysfs.connector_dir(busno) else {
        return false;
    };
    sysfs.attr_text(&dir, "status").as_deref() == Some("disconnected")
        && sysfs.attr_text(&dir, "enabled").as_deref() == Some("disabled")
        && !sysfs.has_attr(&dir, "edid")
}

/// Opens a transport for a display reference through the given provider.
pub fn open_display_io(
    provider: &dyn BusProvider,
    dref: &DisplayRef,
) -> Result<Box<dyn I2cIo>, crate::error::ErrorInfo> {
    match dref.io_path {
        IoPath::I2c { busno } => provider
            .open(busno)
            .map_err(|e| transport::classify_os_error(&e).at("discovery::open_display_io")),
        IoPath::Usb { .. } => Err(Status::InvalidOperation(
            "no transport registered for USB displays",
        )
        .at("discovery::open_display_io")),
    }
}

/// Production bus provider: udev enumeration of i2c-dev devices with a
/// `/dev` glob fallback, devices opened through `/dev/i2c-N`.
pub struct LinuxBuses;

/// I2C adapters whose names mark them as never display-bearing.
const IGNORABLE_NAME_PREFIXES: [&str; 5] = ["SMBus", "soc:i2cdsi", "smu", "mac-io", "u4"];

impl BusProvider for LinuxBuses {
    fn scan(&self) -> BusScan {
        let mut scan = BusScan::default();
        let mut busnos = match enumerate_bus_numbers() {
            Ok(busnos) => busnos,
            Err(e) => {
                log::warn!("i2c bus enumeration failed: {}", e);
                return scan;
            }
        };
        busnos.sort_unstable();
        busnos.dedup();
        for busno in busnos {
            match I2cDevice::open(busno) {
                Ok(_) => scan.buses.push(busno),
                Err(e) => scan.errors.push(BusOpenError {
                    io_path: IoPath::I2c { busno },
                    errno: e.raw_os_error(),
                    message: e.to_string(),
                }),
            }
        }
        scan
    }

    fn open(&self, busno: u32) -> io::Result<Box<dyn I2cIo>> {
        Ok(Box::new(I2cDevice::open(busno)?))
    }
}

#[cfg(feature = "udev")]
fn enumerate_bus_numbers() -> io::Result<Vec<u32>> {
    let mut enumerator = udev::Enumerator::new()?;
    enumerator.match_subsystem("i2c-dev")?;
    let mut busnos = Vec::new();
    for device in enumerator.scan_devices()? {
        let Some(devnode) = device.devnode() else {
            continue;
        };
        let Some(name) = device.attribute_value("name") else {
            continue;
        };
        let name = name.to_string_lossy();
        if IGNORABLE_NAME_PREFIXES.iter().any(|p| name.starts_with(p)) {
            continue;
        }
        if let Some(busno) = busno_from_devnode(&devnode.to_string_lossy()) {
            busnos.push(busno);
        }
    }
    Ok(busnos)
}

#[cfg(not(feature = "udev"))]
fn enumerate_bus_numbers() -> io::Result<Vec<u32>> {
    let mut busnos = Vec::new();
    for entry in std::fs::read_dir("/dev")? {
        let entry = entry?;
        if let Some(busno) = busno_from_devnode(&entry.path().to_string_lossy()) {
            busnos.push(busno);
        }
    }
    Ok(busnos)
}

fn busno_from_devnode(devnode: &str) -> Option<u32> {
    devnode
        .rsplit('/')
        .next()
        .and_then(|name| name.strip_prefix("i2c-"))
        .and_then(|n| n.parse().ok())
}
