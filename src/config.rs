//! Daemon configuration, read from a TOML file.
//!
//! Every key has a default so that a missing file (or an empty one) gives a
//! working setup: both polling tasks enabled, records printed to stdout.

use crate::duration;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::Level;

/// Well-known configuration path used when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "envbeacon.toml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Where a task sends its records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    Stdout,
    Influxdb,
    Mqtt,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub tags: TagsConfig,
    pub environment: EnvironmentConfig,
    pub location: LocationConfig,
    pub influxdb: Option<InfluxDbConfig>,
    pub mqtt: Option<MqttConfig>,
    pub subscriber: SubscriberConfig,
    pub logging: Option<LoggingConfig>,
}

/// Static tags added to every point.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TagsConfig {
    pub location: String,
}

impl Default for TagsConfig {
    fn default() -> Self {
        Self {
            location: "raspberry_pi".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvironmentConfig {
    pub enabled: bool,
    #[serde(deserialize_with = "duration::deserialize")]
    pub interval: Duration,
    pub i2c_device: PathBuf,
    pub measurement: String,
    pub sink: SinkKind,
    pub bucket: String,
    pub topic: String,
    /// Gas heater target temperature in Celsius
    pub heater_temperature: u16,
    #[serde(deserialize_with = "duration::deserialize")]
    pub heater_duration: Duration,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(10),
            i2c_device: PathBuf::from("/dev/i2c-1"),
            measurement: "bme680_measurements".into(),
            sink: SinkKind::Stdout,
            bucket: "bme680_data".into(),
            topic: "envbeacon/environment".into(),
            heater_temperature: 320,
            heater_duration: Duration::from_millis(150),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LocationConfig {
    pub enabled: bool,
    #[serde(deserialize_with = "duration::deserialize")]
    pub interval: Duration,
    #[serde(deserialize_with = "duration::deserialize")]
    pub scan_duration: Duration,
    /// Beacons at or below this RSSI (dBm) are ignored
    pub rssi_threshold: i16,
    pub beacons: PathBuf,
    pub measurement: String,
    pub sink: SinkKind,
    pub bucket: String,
    pub topic: String,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(5),
            scan_duration: Duration::from_secs(4),
            rssi_threshold: -70,
            beacons: PathBuf::from("beacons.json"),
            measurement: "ble_measurements".into(),
            sink: SinkKind::Stdout,
            bucket: "balenaLocating".into(),
            topic: "envbeacon/location".into(),
        }
    }
}

/// InfluxDB v2 connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InfluxDbConfig {
    /// e.g. "http://localhost:8086"
    pub url: String,
    pub org: String,
    pub token: String,
    #[serde(default = "default_request_timeout", deserialize_with = "duration::deserialize")]
    pub timeout: Duration,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    #[serde(deserialize_with = "duration::deserialize")]
    pub keep_alive: Duration,
    pub client_id: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            keep_alive: Duration::from_secs(60),
            client_id: "envbeacon".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SubscriberConfig {
    pub enabled: bool,
    pub topics: Vec<String>,
    #[serde(deserialize_with = "duration::deserialize")]
    pub reconnect_interval: Duration,
    #[serde(deserialize_with = "duration::deserialize")]
    pub connect_timeout: Duration,
    /// Longest time one received message may take to handle
    #[serde(deserialize_with = "duration::deserialize")]
    pub handler_timeout: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            topics: vec!["pemesa/temperature/#".into()],
            reconnect_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            handler_timeout: Duration::from_secs(10),
        }
    }
}

/// Log events forwarded to the broker, on top of the local output.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub topic: String,
    /// Reported as `service` in every forwarded event
    pub service: String,
    /// Least severe level forwarded: error, warn, info, debug or trace
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            topic: "logs/envbeacon".into(),
            service: "envbeacon".into(),
            level: "info".into(),
        }
    }
}

impl LoggingConfig {
    pub fn level(&self) -> Result<Level, ConfigError> {
        self.level
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("unknown log level {:?}", self.level)))
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::from_file`], but a missing file means defaults.
    ///
    /// Returns whether the file existed alongside the configuration.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<(Self, bool), ConfigError> {
        match Self::from_file(path) {
            Ok(config) => Ok((config, true)),
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok((Self::default(), false))
            }
            Err(e) => Err(e),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.environment.enabled && !self.location.enabled && !self.subscriber.enabled {
            return Err(ConfigError::Invalid("No task enabled".into()));
        }

        let sinks = [
            (self.environment.enabled, "environment", self.environment.sink),
            (self.location.enabled, "location", self.location.sink),
        ];
        for (enabled, task, sink) in sinks {
            if !enabled {
                continue;
            }
            if sink == SinkKind::Influxdb && self.influxdb.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "{task} writes to InfluxDB but [influxdb] is missing"
                )));
            }
            if sink == SinkKind::Mqtt && self.mqtt.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "{task} publishes to MQTT but [mqtt] is missing"
                )));
            }
        }

        if self.environment.enabled && self.environment.interval.is_zero() {
            return Err(ConfigError::Invalid("environment interval must be positive".into()));
        }
        if self.location.enabled {
            if self.location.interval.is_zero() {
                return Err(ConfigError::Invalid("location interval must be positive".into()));
            }
            if self.location.scan_duration.is_zero() {
                return Err(ConfigError::Invalid("scan duration must be positive".into()));
            }
        }

        if let Some(mqtt) = &self.mqtt
            && !mqtt.keep_alive.is_zero()
            && mqtt.keep_alive < Duration::from_secs(1)
        {
            return Err(ConfigError::Invalid(
                "MQTT keep-alive must be zero or at least one second".into(),
            ));
        }

        if self.subscriber.enabled {
            if self.mqtt.is_none() {
                return Err(ConfigError::Invalid(
                    "subscriber is enabled but [mqtt] is missing".into(),
                ));
            }
            if self.subscriber.topics.is_empty() {
                return Err(ConfigError::Invalid("subscriber has no topic".into()));
            }
        }

        if let Some(logging) = &self.logging {
            if self.mqtt.is_none() {
                return Err(ConfigError::Invalid(
                    "log forwarding is enabled but [mqtt] is missing".into(),
                ));
            }
            if logging.topic.is_empty() {
                return Err(ConfigError::Invalid("log topic must not be empty".into()));
            }
            logging.level()?;
        }

        Ok(())
    }
}
