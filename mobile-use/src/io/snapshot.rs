//! State snapshotter: captures and normalizes the device UI.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, instrument, warn};

use crate::core::normalize::{digest, normalize};
use crate::core::types::{DeviceState, Screenshot};
use crate::io::driver::{DeviceDriver, DriverError};

/// Produces [`DeviceState`]s with a per-session monotonically increasing sequence.
pub struct Snapshotter<'d, D: DeviceDriver + ?Sized> {
    driver: &'d D,
    timeout: Duration,
    max_elements: usize,
    seq: u64,
}

impl<'d, D: DeviceDriver + ?Sized> Snapshotter<'d, D> {
    pub fn new(driver: &'d D, timeout: Duration, max_elements: usize) -> Self {
        Self {
            driver,
            timeout,
            max_elements,
            seq: 0,
        }
    }

    /// Sequence number of the most recent snapshot (0 before the first).
    pub fn last_seq(&self) -> u64 {
        self.seq
    }

    /// Capture the device and return a canonical state.
    ///
    /// Partial dumps are not errors: the state carries a `partial` note instead.
    #[instrument(skip_all, fields(next_seq = self.seq + 1))]
    pub fn snapshot(&mut self, timeout: Duration) -> Result<DeviceState, DriverError> {
        let raw = self.driver.capture(timeout.min(self.timeout))?;
        let tree = normalize(raw.dialect, &raw.payload, self.max_elements).map_err(|err| {
            DriverError::unavailable(format!("unreadable {:?} dump: {err:#}", raw.dialect))
        })?;
        if let Some(note) = &tree.partial {
            warn!(note = %note, "partial device state");
        }

        let focused_app = raw.focused_app.or(tree.focused_app);
        let digest = digest(focused_app.as_deref(), &tree.elements);
        self.seq += 1;
        let state = DeviceState {
            seq: self.seq,
            captured_at: Utc::now(),
            platform: tree.platform,
            screen: raw.screen.or(tree.screen),
            focused_app,
            elements: tree.elements,
            screenshot: raw.screenshot_png.map(|png| Screenshot {
                bytes: png.len(),
                path: None,
                png: Arc::new(png),
            }),
            partial: tree.partial,
            digest,
        };
        debug!(
            seq = state.seq,
            elements = state.elements.len(),
            digest = %state.digest,
            "snapshot captured"
        );
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedDriver, canonical_screen};

    #[test]
    fn sequence_increases_and_digest_tracks_content() {
        let driver = ScriptedDriver::new(vec![
            canonical_screen(&["Home"]),
            canonical_screen(&["Home"]),
            canonical_screen(&["Settings"]),
        ]);
        let mut snapshotter = Snapshotter::new(&driver, Duration::from_secs(1), 100);
        let a = snapshotter.snapshot(Duration::from_secs(1)).expect("a");
        let b = snapshotter.snapshot(Duration::from_secs(1)).expect("b");
        let c = snapshotter.snapshot(Duration::from_secs(1)).expect("c");
        assert_eq!((a.seq, b.seq, c.seq), (1, 2, 3));
        assert_eq!(a.digest, b.digest);
        assert_ne!(b.digest, c.digest);
        assert_eq!(snapshotter.last_seq(), 3);
    }

    #[test]
    fn unreadable_dump_is_driver_unavailable() {
        let driver = ScriptedDriver::from_payloads(vec![(
            crate::core::normalize::Dialect::Canonical,
            "garbage".to_string(),
        )]);
        let mut snapshotter = Snapshotter::new(&driver, Duration::from_secs(1), 100);
        let err = snapshotter
            .snapshot(Duration::from_secs(1))
            .expect_err("unreadable");
        assert!(err.is_transient());
        assert_eq!(snapshotter.last_seq(), 0);
    }

    #[test]
    fn element_cap_yields_partial_state() {
        let driver = ScriptedDriver::new(vec![canonical_screen(&["a", "b", "c"])]);
        let mut snapshotter = Snapshotter::new(&driver, Duration::from_secs(1), 2);
        let state = snapshotter.snapshot(Duration::from_secs(1)).expect("state");
        assert_eq!(state.elements.len(), 2);
        assert!(state.partial.is_some());
    }
}
