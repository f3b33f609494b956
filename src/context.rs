//! The library context: one value owning the display registry, options,
//! statistics, and persisted state, threaded through every operation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::caps::{parse_capabilities, Capabilities};
use crate::commands::{FeatureCode, TimingMessage, VcpValue};
use crate::config::Options;
use crate::discovery::{self, BusProvider, DiscoveryOptions, DisplayRegistry, LinuxBuses};
use crate::display::DisplayRef;
use crate::error::{DdcResult, Status};
use crate::retry::RetryPolicy;
use crate::state::{CapabilitiesCache, DisplayCacheEntry, DisplaysCache, DsaCache, StateStore};
use crate::stats::Stats;
use crate::sysfs::SysfsView;
use crate::vcp::{apply_unsupported_dialect, DisplayHandle, OpenOptions};

/// Identifies which display an operation targets. Filters are tried in
/// the order bus number, display number, EDID, identity fields; with no
/// filter set, display 1 is assumed.
#[derive(Clone, Debug, Default)]
pub struct DisplaySelector {
    pub dispno: Option<i32>,
    pub busno: Option<u32>,
    pub edid: Option<Vec<u8>>,
    pub mfg: Option<String>,
    pub model: Option<String>,
    pub serial: Option<String>,
}

impl DisplaySelector {
    pub fn dispno(dispno: i32) -> DisplaySelector {
        DisplaySelector {
            dispno: Some(dispno),
            ..DisplaySelector::default()
        }
    }

    pub fn busno(busno: u32) -> DisplaySelector {
        DisplaySelector {
            busno: Some(busno),
            ..DisplaySelector::default()
        }
    }

    fn has_identity_filter(&self) -> bool {
        self.mfg.is_some() || self.model.is_some() || self.serial.is_some()
    }
}

/// Owns everything a running library instance needs. The process-wide
/// singleton surface in [`crate::api`] is a thin adapter over one of
/// these.
pub struct Context {
    options: Options,
    policy: RetryPolicy,
    stats: Stats,
    registry: DisplayRegistry,
    provider: Box<dyn BusProvider>,
    store: Option<StateStore>,
    caps_cache: Mutex<HashMap<String, String>>,
}

impl Context {
    /// Initializes against the real operating system: udev/dev enumeration
    /// and the XDG state directory.
    pub fn new(options: Options) -> DdcResult<Context> {
        Context::with_parts(options, Box::new(LinuxBuses), SysfsView::new(), StateStore::new())
    }

    /// Initialization with explicit collaborators; the seam tests and
    /// embedders use.
    pub fn with_parts(
        options: Options,
        provider: Box<dyn BusProvider>,
        sysfs: SysfsView,
        store: Option<StateStore>,
    ) -> DdcResult<Context> {
        let policy = options.to_policy()?;
        let stats = Stats::new();

        let mut tuning_seed = HashMap::new();
        let mut caps_cache = HashMap::new();
        if let Some(store) = &store {
            if options.displays_cache {
                match store.load_dsa() {
                    Ok(cache) => tuning_seed = cache.tuning,
                    Err(e) => log::warn!("ignoring unreadable DSA cache: {}", e),
                }
            }
            if options.capabilities_cache {
                match store.load_capabilities() {
                    Ok(cache) => caps_cache = cache.capabilities,
                    Err(e) => log::warn!("ignoring unreadable capabilities cache: {}", e),
                }
            }
        }

        if options.usb {
            log::info!("USB monitor detection enabled but no USB backend is registered");
        }
        let discovery_options = DiscoveryOptions {
            async_threshold: options.async_threshold,
            edid_read_size: options.edid_read_size,
            policy: policy.clone(),
            sleep_multiplier: options.sleep_multiplier,
            dynamic_sleep: options.dynamic_sleep,
            tuning_seed,
            usb: None,
        };
        let registry = discovery::detect(provider.as_ref(), &sysfs, &stats, &discovery_options);

        Ok(Context {
            options,
            policy,
            stats,
            registry,
            provider,
            store,
            caps_cache: Mutex::new(caps_cache),
        })
    }

    pub fn registry(&self) -> &DisplayRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Resolves a selector against the registry.
    pub fn resolve(&self, selector: &DisplaySelector) -> DdcResult<&Arc<DisplayRef>> {
        const SITE: &str = "context::resolve";
        let found = if let Some(busno) = selector.busno {
            self.registry.by_busno(busno)
        } else if let Some(dispno) = selector.dispno {
            self.registry.by_dispno(dispno)
        } else if let Some(edid) = &selector.edid {
            self.registry.by_edid(edid)
        } else if selector.has_identity_filter() {
            self.registry.by_model(
                selector.mfg.as_deref(),
                selector.model.as_deref(),
                selector.serial.as_deref(),
            )
        } else {
            self.registry.by_dispno(1)
        };
        let dref = found.ok_or_else(|| Status::DisplayNotFound.at(SITE))?;
        if dref.is_removed() {
            return Err(Status::DisplayRemoved.at(SITE));
        }
        Ok(dref)
    }

    /// Opens a handle on a resolved display, honoring the context's
    /// verification and locking options.
    pub fn open_display<'s>(&'s self, dref: &'s DisplayRef) -> DdcResult<DisplayHandle<'s>> {
        let io = discovery::open_display_io(self.provider.as_ref(), dref)?;
        DisplayHandle::open(
            dref,
            io,
            self.policy.clone(),
            &self.stats,
            OpenOptions {
                lock_timeout: None,
                cancel: None,
                verify_sets: self.options.verify_sets,
            },
        )
    }

    pub fn get_vcp(&self, selector: &DisplaySelector, code: FeatureCode) -> DdcResult<VcpValue> {
        self.timed("get_vcp", |ctx| {
            let dref = ctx.resolve(selector)?;
            let result = {
                let mut handle = ctx.open_display(dref)?;
                handle.get_vcp_feature(code)
            };
            let result = apply_unsupported_dialect(dref, code, result);
            ctx.note_removed(dref, result.as_ref().err());
            result
        })
    }

    pub fn set_vcp(
        &self,
        selector: &DisplaySelector,
        code: FeatureCode,
        value: u16,
    ) -> DdcResult<()> {
        self.timed("set_vcp", |ctx| {
            let dref = ctx.resolve(selector)?;
            let result = {
                let mut handle = ctx.open_display(dref)?;
                handle.set_vcp_feature(code, value)
            };
            ctx.note_removed(dref, result.as_ref().err());
            result
        })
    }

    pub fn get_table(&self, selector: &DisplaySelector, code: FeatureCode) -> DdcResult<Vec<u8>> {
        self.timed("get_table", |ctx| {
            let dref = ctx.resolve(selector)?;
            let mut handle = ctx.open_display(dref)?;
            handle.get_table_vcp(code)
        })
    }

    pub fn set_table(
        &self,
        selector: &DisplaySelector,
        code: FeatureCode,
        data: &[u8],
    ) -> DdcResult<()> {
        self.timed("set_table", |ctx| {
            let dref = ctx.resolve(selector)?;
            let mut handle = ctx.open_display(dref)?;
            handle.set_table_vcp(code, data)
        })
    }

    /// Returns the capabilities string, consulting the persisted cache
    /// first when enabled.
    pub fn capabilities_string(&self, selector: &DisplaySelector) -> DdcResult<String> {
        self.timed("capabilities_string", |ctx| {
            let dref = ctx.resolve(selector)?;
            let key = dref.edid.identity_key();
            if ctx.options.capabilities_cache {
                if let Some(cached) = ctx.caps_cache.lock().unwrap().get(&key) {
                    log::debug!("{}: capabilities served from cache", dref.io_path);
                    return Ok(cached.clone());
                }
            }
            let mut handle = ctx.open_display(dref)?;
            let caps = handle.capabilities_string()?;
            drop(handle);
            ctx.caps_cache.lock().unwrap().insert(key, caps.clone());
            Ok(caps)
        })
    }

    pub fn capabilities(&self, selector: &DisplaySelector) -> DdcResult<Capabilities> {
        let raw = self.capabilities_string(selector)?;
        parse_capabilities(&raw)
    }

    pub fn save_current_settings(&self, selector: &DisplaySelector) -> DdcResult<()> {
        self.timed("save_current_settings", |ctx| {
            let dref = ctx.resolve(selector)?;
            let mut handle = ctx.open_display(dref)?;
            handle.save_current_settings()
        })
    }

    pub fn get_timing_report(&self, selector: &DisplaySelector) -> DdcResult<TimingMessage> {
        self.timed("get_timing_report", |ctx| {
            let dref = ctx.resolve(selector)?;
            let mut handle = ctx.open_display(dref)?;
            handle.get_timing_report()
        })
    }

    /// Persists DSA tuning, the displays cache, and the capabilities
    /// cache, then drops the context.
    pub fn teardown(self) -> DdcResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        if self.options.displays_cache {
            let mut dsa = DsaCache::default();
            let mut displays = DisplaysCache::default();
            for dref in self.registry.displays() {
                let key = dref.edid.identity_key();
                dsa.tuning
                    .insert(key.clone(), dref.tuning.lock().unwrap().snapshot());
                displays.displays.insert(
                    key,
                    DisplayCacheEntry {
                        busno: match dref.io_path {
                            crate::display::IoPath::I2c { busno } => Some(busno),
                            crate::display::IoPath::Usb { .. } => None,
                        },
                        dispno: dref.dispno(),
                        model: dref.model_key.to_string(),
                    },
                );
            }
            store.save_dsa(&dsa)?;
            store.save_displays(&displays)?;
        }
        if self.options.capabilities_cache {
            let capabilities = self.caps_cache.lock().unwrap().clone();
            store.save_capabilities(&CapabilitiesCache { capabilities })?;
        }
        Ok(())
    }

    fn timed<T>(&self, name: &'static str, f: impl FnOnce(&Self) -> DdcResult<T>) -> DdcResult<T> {
        let started = Instant::now();
        let result = f(self);
        self.stats.record_call(name, started.elapsed());
        result
    }

    fn note_removed(&self, dref: &DisplayRef, err: Option<&crate::error::ErrorInfo>) {
        if let Some(err) = err {
            if err.status == Status::DisplayRemoved {
                log::warn!("{}: device gone, marking removed", dref.io_path);
                dref.mark_removed();
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::empty_context;
    use super::*;

    #[test]
    fn missing_display_is_reported() {
        let ctx = empty_context();
        let err = ctx.get_vcp(&DisplaySelector::default(), 0x10).unwrap_err();
        assert_eq!(err.status, Status::DisplayNotFound);
    }

    #[test]
    fn profiling_records_the_call() {
        let ctx = empty_context();
        let _ = ctx.get_vcp(&DisplaySelector::dispno(1), 0x10);
        let rows = ctx.stats().profile_snapshot();
        assert!(rows.iter().any(|r| r.name == "get_vcp" && r.calls == 1));
    }

    #[test]
    fn teardown_without_store_is_a_no_op() {
        let ctx = empty_context();
        ctx.teardown().unwrap();
    }

    #[test]
    fn teardown_persists_caches() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::at(tmp.path());
        let ctx = Context::with_parts(
            Options::default(),
            Box::new(testing::NullProvider),
            SysfsView::with_root("/nonexistent"),
            Some(store.clone()),
        )
        .unwrap();
        ctx.caps_cache
            .lock()
            .unwrap()
            .insert("id".into(), "(vcp(10))".into());
        ctx.teardown().unwrap();
        let cache = store.load_capabilities().unwrap();
        assert_eq!(cache.capabilities.get("id").map(String::as_str), Some("(vcp(10))"));
    }
}
