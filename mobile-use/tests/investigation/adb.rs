//! Live checks of the adb driver: device listing, capture and a harmless key.

use std::time::Duration;

use mobile_use::core::types::Key;
use mobile_use::io::adb::{AdbDriver, list_devices};
use mobile_use::io::driver::{DeviceDriver, PrimitiveAction};
use mobile_use::io::snapshot::Snapshotter;

use crate::live_config;

/// Verifies adb is reachable and reports at least one ready device.
#[test]
#[ignore]
fn adb_lists_a_ready_device() {
    let config = live_config();
    let devices = list_devices(&config.device.adb_path).expect("adb devices");
    for device in &devices {
        println!("{}\t{}", device.serial, device.state);
    }
    assert!(
        devices.iter().any(|d| d.is_ready()),
        "no ready device; connect one or start an emulator"
    );
}

/// Verifies a live capture normalizes into a non-empty element list.
#[test]
#[ignore]
fn live_capture_normalizes() {
    let config = live_config();
    let driver = AdbDriver::connect(&config.device).expect("connect");
    let mut snapshotter = Snapshotter::new(&driver, config.device.capture_timeout(), 200);

    let state = snapshotter
        .snapshot(config.device.capture_timeout())
        .expect("snapshot");
    println!(
        "serial={} app={:?} elements={} partial={:?}",
        driver.serial(),
        state.focused_app,
        state.elements.len(),
        state.partial
    );
    assert_eq!(state.seq, 1);
    assert!(!state.elements.is_empty(), "hierarchy dump was empty");
    assert_eq!(state.digest.len(), 16, "truncated sha-256 hex digest");
}

/// Verifies a dispatched key press is acknowledged by the device.
///
/// Sends HOME, which is safe on any screen.
#[test]
#[ignore]
fn home_key_is_dispatched() {
    let config = live_config();
    let driver = AdbDriver::connect(&config.device).expect("connect");

    driver
        .dispatch(
            &PrimitiveAction::Key { key: Key::Home },
            Duration::from_secs(config.device.dispatch_timeout_secs),
        )
        .expect("dispatch home");
}
