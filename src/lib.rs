//! `envbeacon` library.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing, logging setup and
//! process exit codes. The core logic lives in [`crate::app`] where it can be
//! tested deterministically with injected devices.
//!
//! Every long-running activity is a [`Task`] run by the [`Orchestrator`]:
//! two [`PeriodicTask`]s poll the environmental sensor and scan for BLE
//! beacons, and an optional [`ReconnectingSubscriber`] follows broker topics.
//! All of them stop when the shared [`CancellationSignal`] fires. Log events
//! can additionally be forwarded to the broker through a [`BrokerLog`].

pub mod app;
pub mod cancel;
pub mod config;
pub mod duration;
pub mod logging;
pub mod mac_address;
pub mod measurement;
pub mod orchestrator;
pub mod pollers;
pub mod proximity;
pub mod registry;
pub mod scanner;
pub mod sink;
pub mod source;
pub mod subscriber;
pub mod task;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use cancel::CancellationSignal;
pub use config::{Config, ConfigError};
pub use duration::parse_duration;
pub use logging::BrokerLog;
pub use mac_address::MacAddress;
pub use measurement::Measurement;
pub use orchestrator::{Orchestrator, RunReport, TaskReport};
pub use proximity::{Observation, ProximityMatch};
pub use registry::{Alias, BeaconRegistry, parse_alias};
pub use scanner::{Backend, Discovery, ScanError};
pub use sink::line_protocol::{DataPoint, FieldValue};
pub use sink::{Sink, SinkError};
pub use source::{MeasurementSource, SourceError};
pub use subscriber::{ReconnectingSubscriber, SubscriberState};
pub use task::{PeriodicTask, Poller, Task, TaskError, TaskFault, TaskOutcome};
