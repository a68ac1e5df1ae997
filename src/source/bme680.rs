//! Bosch BME680 over Linux I2C.
//!
//! The driver is blocking, so every device access runs on the blocking
//! thread pool. The device handle lives behind a mutex so a reading that
//! outlives its caller's deadline cannot tear the sensor away from the next
//! one.

use super::{MeasurementSource, SourceError};
use crate::config::EnvironmentConfig;
use crate::measurement::Measurement;
use bme680::{
    Bme680, FieldDataCondition, I2CAddress, IIRFilterSize, OversamplingSetting, PowerMode,
    Settings, SettingsBuilder,
};
use futures::future::BoxFuture;
use linux_embedded_hal::{Delay, I2cdev};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Ambient temperature assumed by the gas heater profile, in Celsius.
const AMBIENT_TEMPERATURE: i8 = 25;

struct Sensor {
    device: Bme680<I2cdev, Delay>,
    delay: Delay,
    /// How long one forced measurement takes, heater included
    profile: Duration,
}

fn sensor_settings(heater_temperature: u16, heater_duration: Duration) -> Settings {
    SettingsBuilder::new()
        .with_humidity_oversampling(OversamplingSetting::OS2x)
        .with_pressure_oversampling(OversamplingSetting::OS4x)
        .with_temperature_oversampling(OversamplingSetting::OS8x)
        .with_temperature_filter(IIRFilterSize::Size3)
        .with_gas_measurement(heater_duration, heater_temperature, AMBIENT_TEMPERATURE)
        .with_run_gas(true)
        .build()
}

impl Sensor {
    fn open(
        path: &Path,
        heater_temperature: u16,
        heater_duration: Duration,
    ) -> Result<Self, SourceError> {
        let mut delay = Delay;
        let mut device = match init_at(path, &mut delay, I2CAddress::Primary) {
            Ok(device) => device,
            Err(e) => {
                warn!(error = %e, "no BME680 at primary address, trying secondary");
                init_at(path, &mut delay, I2CAddress::Secondary)?
            }
        };

        let settings = sensor_settings(heater_temperature, heater_duration);
        let profile = device
            .get_profile_dur(&settings.0)
            .map_err(|e| SourceError::Device(format!("cannot size measurement: {e:?}")))?;
        device
            .set_sensor_settings(&mut delay, settings)
            .map_err(|e| SourceError::Device(format!("cannot configure sensor: {e:?}")))?;
        debug!(?profile, "BME680 measurement profile");

        Ok(Self {
            device,
            delay,
            profile,
        })
    }

    fn measure(&mut self) -> Result<Option<Measurement>, SourceError> {
        self.device
            .set_sensor_mode(&mut self.delay, PowerMode::ForcedMode)
            .map_err(|e| SourceError::Device(format!("cannot start measurement: {e:?}")))?;
        // The driver only polls briefly for new data; the heater alone
        // usually outlasts that.
        std::thread::sleep(self.profile);
        let (data, condition) = self
            .device
            .get_sensor_data(&mut self.delay)
            .map_err(|e| SourceError::Device(format!("cannot read sensor: {e:?}")))?;

        if matches!(condition, FieldDataCondition::Unchanged) {
            return Ok(None);
        }

        Ok(Some(Measurement {
            timestamp: SystemTime::now(),
            temperature: f64::from(data.temperature_celsius()),
            humidity: f64::from(data.humidity_percent()),
            pressure: f64::from(data.pressure_hpa()),
            gas_resistance: data
                .heat_stable()
                .then(|| f64::from(data.gas_resistance_ohm())),
        }))
    }
}

fn init_at(
    path: &Path,
    delay: &mut Delay,
    address: I2CAddress,
) -> Result<Bme680<I2cdev, Delay>, SourceError> {
    let i2c = I2cdev::new(path)
        .map_err(|e| SourceError::Device(format!("cannot open {}: {e}", path.display())))?;
    Bme680::init(i2c, delay, address)
        .map_err(|e| SourceError::Device(format!("cannot initialize sensor: {e:?}")))
}

pub struct Bme680Source {
    path: PathBuf,
    heater_temperature: u16,
    heater_duration: Duration,
    sensor: Option<Arc<Mutex<Sensor>>>,
}

impl Bme680Source {
    pub fn new(config: &EnvironmentConfig) -> Self {
        Self {
            path: config.i2c_device.clone(),
            heater_temperature: config.heater_temperature,
            heater_duration: config.heater_duration,
            sensor: None,
        }
    }
}

impl MeasurementSource for Bme680Source {
    fn init(&mut self) -> BoxFuture<'_, Result<(), SourceError>> {
        Box::pin(async move {
            let path = self.path.clone();
            let (temperature, duration) = (self.heater_temperature, self.heater_duration);
            let sensor =
                tokio::task::spawn_blocking(move || Sensor::open(&path, temperature, duration))
                    .await
                    .map_err(|e| SourceError::Device(e.to_string()))??;
            info!(device = %self.path.display(), "BME680 ready");
            self.sensor = Some(Arc::new(Mutex::new(sensor)));
            Ok(())
        })
    }

    fn read(&mut self) -> BoxFuture<'_, Result<Option<Measurement>, SourceError>> {
        Box::pin(async move {
            let sensor = self.sensor.clone().ok_or(SourceError::NotInitialized)?;
            tokio::task::spawn_blocking(move || {
                let mut sensor = sensor
                    .lock()
                    .map_err(|_| SourceError::Device("sensor lock poisoned".into()))?;
                sensor.measure()
            })
            .await
            .map_err(|e| SourceError::Device(e.to_string()))?
        })
    }
}
