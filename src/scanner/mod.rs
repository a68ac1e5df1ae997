//! BLE discovery abstraction.
//!
//! This module provides a trait-based abstraction over different Bluetooth
//! scanning backends. A backend is initialized once and then asked for
//! bounded discovery passes, each returning the devices heard and their
//! signal strength.

#[cfg(feature = "bluer")]
pub mod bluer;

#[cfg(feature = "hci")]
pub mod hci;

use crate::mac_address::MacAddress;
use crate::proximity::Observation;
use futures::future::BoxFuture;
use std::time::Duration;
use thiserror::Error;

/// Error type for scanner operations.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    #[error("scanner is not initialized")]
    NotInitialized,
}

/// A BLE scanner that can run bounded discovery passes.
pub trait Discovery: Send {
    /// Acquire the adapter. Failure here is a setup fault.
    fn init(&mut self) -> BoxFuture<'_, Result<(), ScanError>>;

    /// Listen for `duration` and return every device heard, one entry per
    /// address.
    fn discover(
        &mut self,
        duration: Duration,
    ) -> BoxFuture<'_, Result<Vec<Observation>, ScanError>>;
}

/// Available scanner backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// BlueZ D-Bus backend (requires bluetoothd daemon)
    #[cfg(feature = "bluer")]
    #[value(alias = "bluez")]
    Bluer,
    /// Raw HCI socket backend (direct kernel access, no daemon required)
    #[cfg(feature = "hci")]
    #[value(alias = "raw")]
    Hci,
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "bluer")]
        return Backend::Bluer;
        #[cfg(all(feature = "hci", not(feature = "bluer")))]
        return Backend::Hci;
        #[cfg(not(any(feature = "bluer", feature = "hci")))]
        compile_error!("At least one backend feature must be enabled");
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => write!(f, "bluer"),
            #[cfg(feature = "hci")]
            Backend::Hci => write!(f, "hci"),
            #[cfg(not(any(feature = "bluer", feature = "hci")))]
            _ => unreachable!("Backend enum has no variants when no backend features are enabled"),
        }
    }
}

/// Create the discovery backend. Nothing is opened until `init`.
pub fn open_discovery(backend: Backend) -> Box<dyn Discovery> {
    match backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => Box::new(bluer::BluerDiscovery::new()),
        #[cfg(feature = "hci")]
        Backend::Hci => Box::new(hci::HciDiscovery::new(hci::DEFAULT_DEVICE)),
    }
}

/// Fold one report into a discovery pass: the latest RSSI wins, and an
/// advertised name is kept once any report carried it.
pub(crate) fn record(observations: &mut Vec<Observation>, report: Observation) {
    match observations.iter_mut().find(|o| o.address == report.address) {
        Some(existing) => {
            existing.rssi = report.rssi;
            if report.name.is_some() {
                existing.name = report.name;
            }
        }
        None => observations.push(report),
    }
}

/// Log line for one device heard during discovery.
pub(crate) fn describe(address: &MacAddress, rssi: i16, name: Option<&str>) -> String {
    match name {
        Some(name) => format!("{address} ({name}) at {rssi} dBm"),
        None => format!("{address} at {rssi} dBm"),
    }
}
