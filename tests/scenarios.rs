//! End-to-end scenarios over mock monitors: discovery, dialect detection,
//! retries, verification, phantoms, and persisted state.

mod common;

use std::fs;

use common::{build_edid, Dialect, MockBus, MockMonitor};
use ddctool::config::Options;
use ddctool::context::{Context, DisplaySelector};
use ddctool::display::{DialectFlags, DISPNO_PHANTOM};
use ddctool::error::Status;
use ddctool::retry::TryClass;
use ddctool::state::StateStore;
use ddctool::sysfs::SysfsView;

fn fast_options() -> Options {
    Options {
        // pin the multiplier at zero so tests never really sleep
        sleep_multiplier: Some(0.0),
        ..Options::default()
    }
}

fn context_over(monitors: Vec<(u32, MockMonitor)>, options: Options) -> Context {
    Context::with_parts(
        options,
        Box::new(MockBus::new(monitors)),
        SysfsView::with_root("/nonexistent"),
        None,
    )
    .unwrap()
}

#[test]
fn happy_path_get() {
    let monitor = MockMonitor::new(build_edid("DEL", "P2411H", 7, "ABC123"), Dialect::DdcFlag)
        .with_feature(0x10, 0x00FF, 0x0064);
    let ctx = context_over(vec![(5, monitor)], fast_options());

    assert_eq!(ctx.registry().display_count(false), 1);
    let value = ctx.get_vcp(&DisplaySelector::busno(5), 0x10).unwrap();
    assert_eq!(value.feature, 0x10);
    assert_eq!(value.maximum(), 0x00FF);
    assert_eq!(value.value(), 0x0064);
}

#[test]
fn unsupported_by_flag_sets_ddc_flag_dialect() {
    let monitor = MockMonitor::new(build_edid("DEL", "P2411H", 7, "ABC123"), Dialect::DdcFlag)
        .with_feature(0x10, 0x00FF, 0x0064);
    let ctx = context_over(vec![(5, monitor)], fast_options());

    let dref = ctx.registry().by_busno(5).unwrap();
    assert!(dref.flags().contains(DialectFlags::USES_DDC_FLAG));
    assert!(dref.flags().is_consistent());

    let err = ctx.get_vcp(&DisplaySelector::busno(5), 0x00).unwrap_err();
    assert_eq!(err.status, Status::ReportedUnsupported);
}

#[test]
fn unsupported_by_null_sets_null_dialect() {
    let monitor = MockMonitor::new(
        build_edid("GSM", "ULTRAFINE", 3, "000042"),
        Dialect::NullResponse,
    )
    .with_feature(0x10, 100, 50);
    let ctx = context_over(vec![(4, monitor)], fast_options());

    let dref = ctx.registry().by_busno(4).unwrap();
    assert!(dref.is_working());
    assert!(dref.flags().contains(DialectFlags::USES_NULL_RESPONSE));

    // an unknown feature nulls out on every try; the dialect converts the
    // collapsed composite into determined-unsupported
    let err = ctx.get_vcp(&DisplaySelector::busno(4), 0x22).unwrap_err();
    assert_eq!(err.status, Status::DeterminedUnsupported);
    assert_eq!(err.causes[0].status, Status::AllResponsesNull);
    assert_eq!(err.causes[0].causes.len(), 6);
}

#[test]
fn all_zero_dialect_is_detected_and_applied() {
    let monitor = MockMonitor::new(build_edid("BNQ", "GW2480", 9, "000009"), Dialect::AllZero)
        .with_feature(0x10, 100, 80);
    let ctx = context_over(vec![(7, monitor)], fast_options());

    let dref = ctx.registry().by_busno(7).unwrap();
    assert!(dref.flags().contains(DialectFlags::USES_ALL_ZERO_BYTES));

    let err = ctx.get_vcp(&DisplaySelector::busno(7), 0x22).unwrap_err();
    assert_eq!(err.status, Status::DeterminedUnsupported);
    let value = ctx.get_vcp(&DisplaySelector::busno(7), 0x10).unwrap();
    assert_eq!(value.value(), 80);
}

#[test]
fn retry_then_success_bumps_histogram_and_multiplier() {
    // two garbage replies before every exchange behaves; leave the
    // multiplier unpinned so adaptation is observable
    let monitor = MockMonitor::new(build_edid("DEL", "U2720Q", 2, "XYZ001"), Dialect::DdcFlag)
        .with_feature(0x10, 100, 50)
        .with_flaky_reads(2);
    let ctx = context_over(vec![(6, monitor)], Options::default());

    let dref = ctx.registry().by_busno(6).unwrap();
    assert!(dref.is_working());
    let multiplier_after_discovery = dref.tuning.lock().unwrap().multiplier();
    assert!(multiplier_after_discovery > 1.0);
    let third_try_before = ctx.stats().class_snapshot(TryClass::WriteRead).histogram[3];

    let value = ctx.get_vcp(&DisplaySelector::busno(6), 0x10).unwrap();
    assert_eq!(value.value(), 50);
    let snap = ctx.stats().class_snapshot(TryClass::WriteRead);
    assert_eq!(snap.histogram[3], third_try_before + 1);
    assert!(dref.tuning.lock().unwrap().multiplier() >= multiplier_after_discovery);
}

#[test]
fn set_with_matching_read_back_succeeds() {
    let monitor = MockMonitor::new(build_edid("DEL", "P2411H", 7, "ABC123"), Dialect::DdcFlag)
        .with_feature(0x10, 0x00FF, 0x0010);
    let ctx = context_over(vec![(5, monitor)], fast_options());
    ctx.set_vcp(&DisplaySelector::busno(5), 0x10, 0x32).unwrap();
}

#[test]
fn set_that_does_not_stick_fails_verification() {
    let monitor = MockMonitor::new(build_edid("AUS", "CLAMP", 4, "CL0001"), Dialect::DdcFlag)
        .with_feature(0x10, 0x00FF, 0x002E)
        .with_ignored_sets();
    let ctx = context_over(vec![(5, monitor)], fast_options());
    let err = ctx
        .set_vcp(&DisplaySelector::busno(5), 0x10, 0x32)
        .unwrap_err();
    assert_eq!(
        err.status,
        Status::VerificationFailed {
            expected: 0x32,
            actual: 0x2E
        }
    );
}

#[test]
fn set_of_unsupported_feature_surfaces_the_monitor_answer() {
    let monitor = MockMonitor::new(build_edid("DEL", "P2411H", 7, "ABC123"), Dialect::DdcFlag)
        .with_feature(0x10, 0x00FF, 0x0010);
    let ctx = context_over(vec![(5, monitor)], fast_options());
    // the write itself is accepted; the verification read-back is where
    // the monitor reports the feature unsupported
    let err = ctx
        .set_vcp(&DisplaySelector::busno(5), 0x12, 0x32)
        .unwrap_err();
    assert_eq!(err.status, Status::ReportedUnsupported);
}

#[test]
fn phantom_bus_is_linked_to_real_display() {
    let edid = build_edid("XYZ", "M1", 0x0101, "000001");
    let real = MockMonitor::new(edid.clone(), Dialect::DdcFlag).with_feature(0x10, 100, 50);
    let ghost = MockMonitor::new(edid, Dialect::Dead);

    let tmp = tempfile::tempdir().unwrap();
    let connector = tmp.path().join("bus/i2c/devices/i2c-9/device");
    fs::create_dir_all(&connector).unwrap();
    fs::write(connector.join("status"), "disconnected\n").unwrap();
    fs::write(connector.join("enabled"), "disabled\n").unwrap();

    let ctx = Context::with_parts(
        fast_options(),
        Box::new(MockBus::new(vec![(5, real), (9, ghost)])),
        SysfsView::with_root(tmp.path()),
        None,
    )
    .unwrap();

    let real_ref = ctx.registry().by_busno(5).unwrap();
    assert_eq!(real_ref.dispno(), 1);
    let ghost_ref = ctx.registry().by_busno(9).unwrap();
    assert_eq!(ghost_ref.dispno(), DISPNO_PHANTOM);
    let actual = ghost_ref.phantom_of().unwrap();
    assert!(std::sync::Arc::ptr_eq(
        &ctx.registry().displays()[actual],
        real_ref
    ));
}

#[test]
fn capabilities_round_trip_and_cache() {
    const CAPS: &str = "(prot(monitor)type(lcd)model(P2411H)vcp(02 10 12 14(05 08 0B)))";
    let monitor = MockMonitor::new(build_edid("DEL", "P2411H", 7, "ABC123"), Dialect::DdcFlag)
        .with_feature(0x10, 100, 50)
        .with_capabilities(CAPS);

    let tmp = tempfile::tempdir().unwrap();
    let store = StateStore::at(tmp.path());

    let ctx = Context::with_parts(
        fast_options(),
        Box::new(MockBus::new(vec![(5, monitor)])),
        SysfsView::with_root("/nonexistent"),
        Some(store.clone()),
    )
    .unwrap();
    let caps = ctx.capabilities(&DisplaySelector::busno(5)).unwrap();
    assert!(caps.supports_feature(0x10));
    assert_eq!(caps.properties.get("model").map(String::as_str), Some("P2411H"));
    ctx.teardown().unwrap();

    // second run: the monitor no longer answers capabilities, but the
    // cache does
    let mute = MockMonitor::new(build_edid("DEL", "P2411H", 7, "ABC123"), Dialect::DdcFlag)
        .with_feature(0x10, 100, 50);
    let ctx2 = Context::with_parts(
        fast_options(),
        Box::new(MockBus::new(vec![(5, mute)])),
        SysfsView::with_root("/nonexistent"),
        Some(store),
    )
    .unwrap();
    let raw = ctx2.capabilities_string(&DisplaySelector::busno(5)).unwrap();
    assert_eq!(raw, CAPS);
}

#[test]
fn dsa_multiplier_persists_across_contexts() {
    let tmp = tempfile::tempdir().unwrap();
    let store = StateStore::at(tmp.path());

    // a flaky first session drives the multiplier up
    let flaky = MockMonitor::new(build_edid("DEL", "U2720Q", 2, "XYZ001"), Dialect::DdcFlag)
        .with_feature(0x10, 100, 50)
        .with_flaky_reads(2);
    let ctx = Context::with_parts(
        Options::default(),
        Box::new(MockBus::new(vec![(6, flaky)])),
        SysfsView::with_root("/nonexistent"),
        Some(store.clone()),
    )
    .unwrap();
    let raised = {
        let dref = ctx.registry().by_busno(6).unwrap();
        dref.tuning.lock().unwrap().multiplier()
    };
    assert!(raised > 1.0);
    ctx.teardown().unwrap();

    // a clean second session is seeded with the persisted multiplier
    let clean = MockMonitor::new(build_edid("DEL", "U2720Q", 2, "XYZ001"), Dialect::DdcFlag)
        .with_feature(0x10, 100, 50);
    let ctx2 = Context::with_parts(
        Options::default(),
        Box::new(MockBus::new(vec![(6, clean)])),
        SysfsView::with_root("/nonexistent"),
        Some(store),
    )
    .unwrap();
    let seeded = {
        let dref = ctx2.registry().by_busno(6).unwrap();
        dref.tuning.lock().unwrap().multiplier()
    };
    assert_eq!(seeded, raised);
}

#[test]
fn selector_variants_find_the_same_display() {
    let edid = build_edid("DEL", "P2411H", 7, "ABC123");
    let monitor =
        MockMonitor::new(edid.clone(), Dialect::DdcFlag).with_feature(0x10, 100, 50);
    let ctx = context_over(vec![(5, monitor)], fast_options());

    let by_bus = ctx.resolve(&DisplaySelector::busno(5)).unwrap();
    let by_dispno = ctx.resolve(&DisplaySelector::dispno(1)).unwrap();
    let by_edid = ctx
        .resolve(&DisplaySelector {
            edid: Some(edid),
            ..DisplaySelector::default()
        })
        .unwrap();
    let by_model = ctx
        .resolve(&DisplaySelector {
            mfg: Some("DEL".into()),
            model: Some("P2411H".into()),
            serial: Some("ABC123".into()),
            ..DisplaySelector::default()
        })
        .unwrap();
    assert!(std::sync::Arc::ptr_eq(by_bus, by_dispno));
    assert!(std::sync::Arc::ptr_eq(by_bus, by_edid));
    assert!(std::sync::Arc::ptr_eq(by_bus, by_model));

    assert_eq!(
        ctx.resolve(&DisplaySelector::busno(12)).unwrap_err().status,
        Status::DisplayNotFound
    );
}

#[test]
fn concurrent_callers_on_different_displays_proceed() {
    let a = MockMonitor::new(build_edid("AAA", "M1", 1, "000001"), Dialect::DdcFlag)
        .with_feature(0x10, 100, 10);
    let b = MockMonitor::new(build_edid("BBB", "M2", 2, "000002"), Dialect::DdcFlag)
        .with_feature(0x10, 100, 20);
    let ctx = context_over(vec![(1, a), (2, b)], fast_options());

    std::thread::scope(|scope| {
        let ctx = &ctx;
        let t1 = scope.spawn(move || ctx.get_vcp(&DisplaySelector::busno(1), 0x10).unwrap());
        let t2 = scope.spawn(move || ctx.get_vcp(&DisplaySelector::busno(2), 0x10).unwrap());
        assert_eq!(t1.join().unwrap().value(), 10);
        assert_eq!(t2.join().unwrap().value(), 20);
    });
}
