//! Environmental sensor access.
//!
//! The BME680 driver is only compiled with the `bme680` feature; without it
//! the environment task still builds but fails its setup.

#[cfg(feature = "bme680")]
pub mod bme680;

use crate::config::EnvironmentConfig;
use crate::measurement::Measurement;
use futures::future::BoxFuture;
use thiserror::Error;

/// Error type for sensor operations.
#[derive(Error, Debug)]
pub enum SourceError {
    /// Driver support not compiled in
    #[error("sensor '{0}' not available (not compiled in)")]
    NotAvailable(&'static str),
    #[error("sensor error: {0}")]
    Device(String),
    #[error("sensor is not initialized")]
    NotInitialized,
}

/// Something that produces environmental measurements on demand.
pub trait MeasurementSource: Send {
    /// Open and configure the device. Failure here is a setup fault.
    fn init(&mut self) -> BoxFuture<'_, Result<(), SourceError>>;

    /// Take one reading. `Ok(None)` means the sensor had nothing new.
    fn read(&mut self) -> BoxFuture<'_, Result<Option<Measurement>, SourceError>>;
}

/// Open the sensor described by `config`.
pub fn open_sensor(config: &EnvironmentConfig) -> Box<dyn MeasurementSource> {
    #[cfg(feature = "bme680")]
    return Box::new(bme680::Bme680Source::new(config));

    #[cfg(not(feature = "bme680"))]
    {
        let _ = config;
        Box::new(Unavailable("bme680"))
    }
}

/// Stand-in for a driver that was not compiled in.
#[cfg_attr(feature = "bme680", allow(dead_code))]
struct Unavailable(&'static str);

impl MeasurementSource for Unavailable {
    fn init(&mut self) -> BoxFuture<'_, Result<(), SourceError>> {
        let name = self.0;
        Box::pin(async move { Err(SourceError::NotAvailable(name)) })
    }

    fn read(&mut self) -> BoxFuture<'_, Result<Option<Measurement>, SourceError>> {
        Box::pin(async { Err(SourceError::NotInitialized) })
    }
}
