//! Environmental sample produced by the sensor source.

use std::time::SystemTime;

/// One reading from the environmental sensor.
///
/// Units:
/// - Temperature in Celsius
/// - Relative humidity in percent (0-100)
/// - Pressure in hectopascals
/// - Gas resistance in Ohms
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Wall-clock time of the reading (UTC)
    pub timestamp: SystemTime,
    pub temperature: f64,
    pub humidity: f64,
    pub pressure: f64,
    /// Only present once the gas heater reports a stable condition.
    pub gas_resistance: Option<f64>,
}

impl Measurement {
    /// Progress line printed for every reading.
    pub fn summary(&self) -> String {
        let base = format!(
            "{:.2} C, {:.2} hPa, {:.2} %RH",
            self.temperature, self.pressure, self.humidity
        );
        match self.gas_resistance {
            Some(gas) => format!("{base}, {gas:.2} Ohms"),
            None => format!("{base}, gas reading not stable"),
        }
    }
}
