//! Destinations for the records produced by the polling tasks.
//!
//! Each task owns exactly one sink and closes it when the task ends.

pub mod influxdb;
pub mod line_protocol;
pub mod mqtt;
pub mod stdout;

use crate::config::{Config, SinkKind};
use futures::future::BoxFuture;
use line_protocol::DataPoint;
use thiserror::Error;

pub use influxdb::InfluxDbSink;
pub use mqtt::MqttSink;
pub use stdout::StdoutSink;

/// Errors reported by a single write.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("InfluxDB rejected write ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("point {0} has no field to write")]
    NoFields(String),
    #[error("sink is closed")]
    Closed,
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
}

/// A record consumer that may fail or be temporarily unavailable.
pub trait Sink: Send {
    fn write<'a>(&'a mut self, point: &'a DataPoint) -> BoxFuture<'a, Result<(), SinkError>>;

    /// Release connections. Further writes fail with [`SinkError::Closed`].
    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// Where a task's records go, as resolved from its configuration section.
#[derive(Debug, Clone, Copy)]
pub struct Target<'a> {
    pub kind: SinkKind,
    pub bucket: &'a str,
    pub topic: &'a str,
    /// Distinguishes this task's broker session from the others
    pub client_suffix: &'a str,
}

/// Open the sink a task writes to.
pub fn open(config: &Config, target: Target<'_>) -> Result<Box<dyn Sink>, SinkError> {
    match target.kind {
        SinkKind::Stdout => Ok(Box::new(StdoutSink::stdout())),
        SinkKind::Influxdb => {
            let influx = config
                .influxdb
                .as_ref()
                .ok_or(SinkError::NotConfigured("[influxdb]"))?;
            Ok(Box::new(InfluxDbSink::new(influx, target.bucket)?))
        }
        SinkKind::Mqtt => {
            let mqtt = config
                .mqtt
                .as_ref()
                .ok_or(SinkError::NotConfigured("[mqtt]"))?;
            Ok(Box::new(MqttSink::new(
                mqtt,
                target.topic,
                target.client_suffix,
            )))
        }
    }
}
