use crate::proximity::{self, ProximityMatch};
use crate::registry::BeaconRegistry;
use crate::scanner::Discovery;
use crate::sink::Sink;
use crate::sink::line_protocol::{DataPoint, FieldValue};
use crate::task::{Poller, TaskError};
use futures::future::BoxFuture;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

/// Registered beacons heard in one discovery pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Sighting {
    pub timestamp: SystemTime,
    pub matches: Vec<ProximityMatch>,
}

/// Scans for registered beacons and writes one point per nearby beacon.
pub struct LocationPoller {
    discovery: Box<dyn Discovery>,
    registry: BeaconRegistry,
    rssi_threshold: i16,
    scan_duration: Duration,
    interval: Duration,
    sink: Box<dyn Sink>,
    measurement: String,
    location: String,
}

impl LocationPoller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        discovery: Box<dyn Discovery>,
        registry: BeaconRegistry,
        rssi_threshold: i16,
        scan_duration: Duration,
        interval: Duration,
        sink: Box<dyn Sink>,
        measurement: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            discovery,
            registry,
            rssi_threshold,
            scan_duration,
            interval,
            sink,
            measurement: measurement.into(),
            location: location.into(),
        }
    }

    pub fn to_point(&self, beacon: &ProximityMatch, timestamp: SystemTime) -> DataPoint {
        DataPoint::new(self.measurement.as_str())
            .tag("sensor", "ble")
            .tag("location", self.location.as_str())
            .tag("device_name", beacon.name.as_str())
            .tag("address", beacon.address.to_string())
            .field("rssi", FieldValue::Integer(i64::from(beacon.rssi)))
            .timestamp(timestamp)
    }
}

impl Poller for LocationPoller {
    type Reading = Sighting;

    fn setup(&mut self) -> BoxFuture<'_, Result<(), TaskError>> {
        Box::pin(async move {
            if self.registry.is_empty() {
                warn!("beacon registry is empty, no beacon will match");
            }
            Ok(self.discovery.init().await?)
        })
    }

    /// A failed discovery pass counts as a pass that heard nothing.
    fn acquire(&mut self) -> BoxFuture<'_, Result<Option<Sighting>, TaskError>> {
        Box::pin(async move {
            let observations = match self.discovery.discover(self.scan_duration).await {
                Ok(observations) => observations,
                Err(e) => {
                    warn!(error = %e, "discovery failed");
                    Vec::new()
                }
            };
            let timestamp = SystemTime::now();
            let matches = proximity::filter(&observations, &self.registry, self.rssi_threshold);

            if matches.is_empty() {
                info!(devices = observations.len(), "no nearby beacon detected");
            } else {
                info!("nearby beacons: {}", matches.len());
                for beacon in &matches {
                    info!("{beacon}");
                }
            }
            Ok(Some(Sighting { timestamp, matches }))
        })
    }

    /// Every match is written even when an earlier write fails; the first
    /// failure is returned once the whole sighting has been attempted.
    fn publish(&mut self, sighting: Sighting) -> BoxFuture<'_, Result<(), TaskError>> {
        Box::pin(async move {
            let mut first_error = None;
            for beacon in &sighting.matches {
                let point = self.to_point(beacon, sighting.timestamp);
                if let Err(e) = self.sink.write(&point).await {
                    warn!(address = %beacon.address, error = %e, "write failed");
                    first_error.get_or_insert(e);
                }
            }
            info!("next scan in {} s", self.interval.as_secs());
            match first_error {
                Some(e) => Err(e.into()),
                None => Ok(()),
            }
        })
    }

    fn teardown(&mut self) -> BoxFuture<'_, ()> {
        self.sink.close()
    }
}
