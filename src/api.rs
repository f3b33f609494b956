//! Process-wide adapter over a default [`Context`].
//!
//! External callers that want the classic singleton surface use this
//! module: idempotent initialization, operations returning bare status
//! codes, and a thread-local accessor for the full error tree of the last
//! failed call on this thread.

use std::cell::RefCell;
use std::sync::RwLock;

use crate::caps::Capabilities;
use crate::commands::{FeatureCode, TimingMessage, VcpValue};
use crate::config;
use crate::context::{Context, DisplaySelector};
use crate::error::{DdcResult, ErrorInfo, Status};

static GLOBAL: RwLock<Option<Context>> = RwLock::new(None);

thread_local! {
    static LAST_ERROR: RefCell<Option<ErrorInfo>> = const { RefCell::new(None) };
}

fn store_error(err: ErrorInfo) -> Status {
    let status = err.status.clone();
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(err));
    status
}

fn clear_error() {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = None);
}

/// Full detail of the last error reported to this thread.
pub fn last_error_detail() -> Option<ErrorInfo> {
    LAST_ERROR.with(|slot| slot.borrow().clone())
}

/// Initializes the default context from the config file plus the given
/// option string. A second initialization is refused.
pub fn initialize(option_string: &str) -> Result<(), Status> {
    let options = config::load_options(None, option_string).map_err(store_error)?;
    let context = Context::new(options).map_err(store_error)?;
    install(context)
}

/// Installs an already-built context as the process default. Embedders
/// and tests use this to supply their own collaborators.
pub fn install(context: Context) -> Result<(), Status> {
    let mut guard = GLOBAL.write().unwrap();
    if guard.is_some() {
        return Err(store_error(
            Status::InvalidOperation("library already initialized").at("api::initialize"),
        ));
    }
    *guard = Some(context);
    clear_error();
    Ok(())
}

/// Tears down the default context, persisting state. Safe to call at
/// most once; a second call is an invalid operation.
pub fn teardown() -> Result<(), Status> {
    let context = {
        let mut guard = GLOBAL.write().unwrap();
        guard.take()
    };
    match context {
        Some(context) => {
            context.teardown().map_err(store_error)?;
            clear_error();
            Ok(())
        }
        None => Err(store_error(
            Status::InvalidOperation("library not initialized").at("api::teardown"),
        )),
    }
}

fn with_context<T>(f: impl FnOnce(&Context) -> DdcResult<T>) -> Result<T, Status> {
    let guard = GLOBAL.read().unwrap();
    let context = guard.as_ref().ok_or_else(|| {
        store_error(Status::InvalidOperation("library not initialized").at("api::with_context"))
    })?;
    match f(context) {
        Ok(value) => {
            clear_error();
            Ok(value)
        }
        Err(err) => Err(store_error(err)),
    }
}

pub fn display_count(include_invalid: bool) -> Result<usize, Status> {
    with_context(|ctx| Ok(ctx.registry().display_count(include_invalid)))
}

pub fn get_vcp_feature(selector: &DisplaySelector, code: FeatureCode) -> Result<VcpValue, Status> {
    with_context(|ctx| ctx.get_vcp(selector, code))
}

pub fn set_vcp_feature(
    selector: &DisplaySelector,
    code: FeatureCode,
    value: u16,
) -> Result<(), Status> {
    with_context(|ctx| ctx.set_vcp(selector, code, value))
}

pub fn get_table_feature(
    selector: &DisplaySelector,
    code: FeatureCode,
) -> Result<Vec<u8>, Status> {
    with_context(|ctx| ctx.get_table(selector, code))
}

pub fn capabilities_string(selector: &DisplaySelector) -> Result<String, Status> {
    with_context(|ctx| ctx.capabilities_string(selector))
}

pub fn capabilities(selector: &DisplaySelector) -> Result<Capabilities, Status> {
    with_context(|ctx| ctx.capabilities(selector))
}

pub fn save_current_settings(selector: &DisplaySelector) -> Result<(), Status> {
    with_context(|ctx| ctx.save_current_settings(selector))
}

pub fn get_timing_report(selector: &DisplaySelector) -> Result<TimingMessage, Status> {
    with_context(|ctx| ctx.get_timing_report(selector))
}
