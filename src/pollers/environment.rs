use crate::measurement::Measurement;
use crate::sink::Sink;
use crate::sink::line_protocol::{DataPoint, FieldValue};
use crate::source::MeasurementSource;
use crate::task::{Poller, TaskError};
use futures::future::BoxFuture;
use tracing::info;

/// Reads the environmental sensor and writes one point per reading.
pub struct EnvironmentPoller {
    source: Box<dyn MeasurementSource>,
    sink: Box<dyn Sink>,
    measurement: String,
    location: String,
}

impl EnvironmentPoller {
    pub fn new(
        source: Box<dyn MeasurementSource>,
        sink: Box<dyn Sink>,
        measurement: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            source,
            sink,
            measurement: measurement.into(),
            location: location.into(),
        }
    }

    pub fn to_point(&self, reading: &Measurement) -> DataPoint {
        let point = DataPoint::new(self.measurement.as_str())
            .tag("sensor", "bme680")
            .tag("location", self.location.as_str())
            .field("temperature", FieldValue::Float(reading.temperature))
            .field("humidity", FieldValue::Float(reading.humidity))
            .field("pressure", FieldValue::Float(reading.pressure))
            .timestamp(reading.timestamp);
        match reading.gas_resistance {
            Some(gas) => point.field("gas_resistance", FieldValue::Float(gas)),
            None => point,
        }
    }
}

impl Poller for EnvironmentPoller {
    type Reading = Measurement;

    fn setup(&mut self) -> BoxFuture<'_, Result<(), TaskError>> {
        Box::pin(async move { Ok(self.source.init().await?) })
    }

    fn acquire(&mut self) -> BoxFuture<'_, Result<Option<Measurement>, TaskError>> {
        Box::pin(async move { Ok(self.source.read().await?) })
    }

    fn publish(&mut self, reading: Measurement) -> BoxFuture<'_, Result<(), TaskError>> {
        Box::pin(async move {
            info!("{}", reading.summary());
            let point = self.to_point(&reading);
            self.sink.write(&point).await?;
            Ok(())
        })
    }

    fn teardown(&mut self) -> BoxFuture<'_, ()> {
        self.sink.close()
    }
}
