use crate::mac_address::MacAddress;
use crate::measurement::Measurement;
use crate::proximity::Observation;
use crate::registry::BeaconRegistry;
use crate::scanner::{Discovery, ScanError};
use crate::sink::line_protocol::DataPoint;
use crate::sink::{Sink, SinkError};
use crate::source::{MeasurementSource, SourceError};
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

/// A stable MAC address for unit tests.
pub const TEST_MAC: MacAddress = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

/// A second address that is never registered.
pub const OTHER_MAC: MacAddress = MacAddress([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);

/// Fixed timestamp: 2001-09-09T01:46:40Z.
pub fn test_timestamp() -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000_000)
}

/// Build a `Measurement` with typical indoor values.
pub fn measurement(gas_resistance: Option<f64>) -> Measurement {
    Measurement {
        timestamp: test_timestamp(),
        temperature: 21.5,
        humidity: 45.0,
        pressure: 1013.25,
        gas_resistance,
    }
}

pub fn observation(address: MacAddress, rssi: i16) -> Observation {
    Observation {
        address,
        rssi,
        name: None,
    }
}

pub fn registry(entries: &[(MacAddress, &str)]) -> BeaconRegistry {
    entries
        .iter()
        .map(|(address, name)| (*address, name.to_string()))
        .collect()
}

/// Sink that keeps every point; can be switched to failing, or told to
/// fail a number of upcoming writes.
#[derive(Clone, Default)]
pub struct RecordingSink {
    pub points: Arc<Mutex<Vec<DataPoint>>>,
    pub failing: Arc<AtomicBool>,
    pub failures_left: Arc<AtomicUsize>,
    pub attempts: Arc<AtomicUsize>,
    pub closed: Arc<AtomicBool>,
}

impl RecordingSink {
    pub fn points(&self) -> Vec<DataPoint> {
        self.points.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Sink for RecordingSink {
    fn write<'a>(&'a mut self, point: &'a DataPoint) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let scripted_failure = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if scripted_failure || self.failing.load(Ordering::SeqCst) {
                return Err(SinkError::Io(io::Error::other("broken pipe")));
            }
            self.points.lock().unwrap().push(point.clone());
            Ok(())
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.closed.store(true, Ordering::SeqCst) })
    }
}

/// Source that replays scripted readings; `None` in the script is a failed read.
#[derive(Default)]
pub struct FakeSource {
    pub init_fails: bool,
    pub readings: VecDeque<Option<Measurement>>,
}

impl MeasurementSource for FakeSource {
    fn init(&mut self) -> BoxFuture<'_, Result<(), SourceError>> {
        Box::pin(async move {
            if self.init_fails {
                Err(SourceError::Device("no sensor on /dev/i2c-1".into()))
            } else {
                Ok(())
            }
        })
    }

    fn read(&mut self) -> BoxFuture<'_, Result<Option<Measurement>, SourceError>> {
        Box::pin(async move {
            match self.readings.pop_front() {
                Some(Some(measurement)) => Ok(Some(measurement)),
                Some(None) => Err(SourceError::Device("I2C read failed".into())),
                None => Ok(None),
            }
        })
    }
}

/// Discovery that replays scripted passes; `None` is a failed pass.
///
/// Each pass takes its full duration, like the real backends.
#[derive(Default)]
pub struct FakeDiscovery {
    pub init_fails: bool,
    pub passes: VecDeque<Option<Vec<Observation>>>,
}

impl Discovery for FakeDiscovery {
    fn init(&mut self) -> BoxFuture<'_, Result<(), ScanError>> {
        Box::pin(async move {
            if self.init_fails {
                Err(ScanError::Bluetooth("no adapter".into()))
            } else {
                Ok(())
            }
        })
    }

    fn discover(
        &mut self,
        duration: Duration,
    ) -> BoxFuture<'_, Result<Vec<Observation>, ScanError>> {
        Box::pin(async move {
            tokio::time::sleep(duration).await;
            match self.passes.pop_front() {
                Some(Some(observations)) => Ok(observations),
                Some(None) => Err(ScanError::Bluetooth("adapter reset".into())),
                None => Ok(Vec::new()),
            }
        })
    }
}

/// Log output captured from the current thread's default subscriber.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Route `tracing` output into a buffer until the guard is dropped.
///
/// Only covers the calling thread, so use it from current-thread runtimes.
pub fn capture_logs() -> (CapturedLogs, tracing::subscriber::DefaultGuard) {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    (logs, tracing::subscriber::set_default(subscriber))
}
