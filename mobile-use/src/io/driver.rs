//! Device driver abstraction.
//!
//! The [`DeviceDriver`] trait decouples the loop from the automation transport
//! (currently `adb`). Tests use scripted drivers that replay predetermined
//! dumps without touching a device.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::normalize::Dialect;
use crate::core::types::{Key, Point, ScreenSize};

/// Unprocessed capture returned by a driver.
#[derive(Debug, Clone)]
pub struct RawSnapshot {
    pub dialect: Dialect,
    pub payload: String,
    pub screenshot_png: Option<Vec<u8>>,
    /// Focused app reported out of band (overrides the tree's package).
    pub focused_app: Option<String>,
    pub screen: Option<ScreenSize>,
}

/// Device-level gesture in absolute screen coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "primitive", rename_all = "snake_case")]
pub enum PrimitiveAction {
    Tap { at: Point },
    LongPress { at: Point, duration_ms: u64 },
    Swipe { from: Point, to: Point, duration_ms: u64 },
    InputText { text: String },
    Key { key: Key },
    LaunchApp { package: String },
    Wait { duration_ms: u64 },
}

/// Driver acknowledgement of a dispatched primitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawDispatch {
    pub output: String,
}

#[derive(Debug, Error)]
pub enum DriverError {
    /// The device cannot be reached (offline, transport failure, missing binary).
    #[error("device unavailable: {0}")]
    Unavailable(String),

    /// A capture or dispatch exceeded its timeout.
    #[error("device call timed out after {0:?}")]
    Timeout(Duration),

    /// The device was reachable but refused the primitive.
    #[error("device refused action: {0}")]
    Refused(String),
}

impl DriverError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self::Refused(message.into())
    }

    /// Transient errors are retried with backoff; refusals become rejected actions.
    pub fn is_transient(&self) -> bool {
        matches!(self, DriverError::Unavailable(_) | DriverError::Timeout(_))
    }
}

/// Abstraction over device automation backends.
pub trait DeviceDriver: Send + Sync {
    /// Capture the current UI tree (and screenshot when supported).
    fn capture(&self, timeout: Duration) -> Result<RawSnapshot, DriverError>;

    /// Dispatch exactly one primitive and wait for it to complete.
    fn dispatch(
        &self,
        action: &PrimitiveAction,
        timeout: Duration,
    ) -> Result<RawDispatch, DriverError>;
}

impl<D: DeviceDriver + ?Sized> DeviceDriver for &D {
    fn capture(&self, timeout: Duration) -> Result<RawSnapshot, DriverError> {
        (**self).capture(timeout)
    }

    fn dispatch(
        &self,
        action: &PrimitiveAction,
        timeout: Duration,
    ) -> Result<RawDispatch, DriverError> {
        (**self).dispatch(action, timeout)
    }
}

impl<D: DeviceDriver + ?Sized> DeviceDriver for Box<D> {
    fn capture(&self, timeout: Duration) -> Result<RawSnapshot, DriverError> {
        (**self).capture(timeout)
    }

    fn dispatch(
        &self,
        action: &PrimitiveAction,
        timeout: Duration,
    ) -> Result<RawDispatch, DriverError> {
        (**self).dispatch(action, timeout)
    }
}
