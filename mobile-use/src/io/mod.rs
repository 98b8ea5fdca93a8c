//! I/O boundaries: device, model, configuration and traces.

pub mod adb;
pub mod cancel;
pub mod config;
pub mod driver;
pub mod gateway;
pub mod process;
pub mod prompt;
pub mod providers;
pub mod snapshot;
pub mod transcript;
