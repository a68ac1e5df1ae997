//! Core application runner for `envbeacon`.
//!
//! This module is intentionally decoupled from CLI parsing and process exit codes
//! so it can be tested deterministically with injected devices.

use crate::config::{Config, ConfigError, DEFAULT_CONFIG_PATH, EnvironmentConfig};
use crate::logging::BrokerLog;
use crate::orchestrator::{Orchestrator, RunReport};
use crate::pollers::{EnvironmentPoller, LocationPoller};
use crate::registry::{Alias, BeaconRegistry, parse_alias};
use crate::scanner::{Backend, Discovery, open_discovery};
use crate::sink::{self, SinkError, Target};
use crate::source::{MeasurementSource, open_sensor};
use crate::subscriber::{LogHandler, MqttConnector, ReconnectingSubscriber};
use crate::task::{PeriodicTask, Task};
use clap::Parser;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Slack on top of the scan duration before a discovery pass is abandoned.
const SCAN_DEADLINE_MARGIN: Duration = Duration::from_secs(5);

#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Configuration file (TOML). A missing file means built-in defaults.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Beacon registry (JSON object of address to name).
    /// Overrides `beacons` in the [location] section.
    #[arg(long)]
    pub beacons: Option<PathBuf>,

    /// Register an extra beacon, taking precedence over the registry file.
    /// Format: --beacon DE:AD:BE:EF:00:00=Lobby
    #[arg(long = "beacon", value_parser = parse_alias, value_name = "BEACON")]
    pub extra_beacons: Vec<Alias>,

    /// Bluetooth scanner backend to use
    #[arg(long, default_value_t, value_enum)]
    pub backend: Backend,

    /// Verbose output, log every device heard and every iteration
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

/// Setup faults: nothing has been started when one of these is returned.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot open sink: {0}")]
    Sink(#[from] SinkError),
    #[error("cannot install signal handlers: {0}")]
    Signals(#[from] io::Error),
}

/// Hardware abstraction to enable deterministic unit tests without a
/// sensor or Bluetooth adapter.
pub trait Devices: Send + Sync {
    fn sensor(&self, config: &EnvironmentConfig) -> Box<dyn MeasurementSource>;

    fn discovery(&self, backend: Backend) -> Box<dyn Discovery>;
}

/// Real devices, using the compiled-in drivers.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealDevices;

impl Devices for RealDevices {
    fn sensor(&self, config: &EnvironmentConfig) -> Box<dyn MeasurementSource> {
        open_sensor(config)
    }

    fn discovery(&self, backend: Backend) -> Box<dyn Discovery> {
        open_discovery(backend)
    }
}

/// Load the configuration named by `options`.
pub fn load_config(options: &Options) -> Result<Config, RunError> {
    let (config, found) = Config::load_or_default(&options.config)?;
    if found {
        info!(path = %options.config.display(), "configuration loaded");
    } else {
        warn!(path = %options.config.display(), "configuration file not found, using defaults");
    }
    Ok(config)
}

/// Start forwarding log events to the broker when `[logging]` asks for it.
pub fn forward_logs(config: &Config, broker_log: &BrokerLog) -> Result<(), RunError> {
    let (Some(logging), Some(mqtt)) = (&config.logging, &config.mqtt) else {
        return Ok(());
    };
    if broker_log.attach(mqtt, logging)? {
        info!(topic = %logging.topic, "forwarding log events to the broker");
    }
    Ok(())
}

/// Build every enabled task, each with its own sink.
pub fn build_tasks(
    config: &Config,
    options: &Options,
    devices: &dyn Devices,
) -> Result<Vec<Box<dyn Task>>, RunError> {
    let mut tasks: Vec<Box<dyn Task>> = Vec::new();
    let location_tag = config.tags.location.as_str();

    if config.environment.enabled {
        let env = &config.environment;
        let sink = sink::open(
            config,
            Target {
                kind: env.sink,
                bucket: &env.bucket,
                topic: &env.topic,
                client_suffix: "environment",
            },
        )?;
        let poller = EnvironmentPoller::new(
            devices.sensor(env),
            sink,
            env.measurement.as_str(),
            location_tag,
        );
        tasks.push(Box::new(PeriodicTask::new("environment", poller, env.interval)));
    }

    if config.location.enabled {
        let loc = &config.location;
        let path = options.beacons.as_ref().unwrap_or(&loc.beacons);
        let registry = BeaconRegistry::load(path, &options.extra_beacons);
        info!(backend = %options.backend, beacons = registry.len(), "location scanning configured");
        let sink = sink::open(
            config,
            Target {
                kind: loc.sink,
                bucket: &loc.bucket,
                topic: &loc.topic,
                client_suffix: "location",
            },
        )?;
        let poller = LocationPoller::new(
            devices.discovery(options.backend),
            registry,
            loc.rssi_threshold,
            loc.scan_duration,
            loc.interval,
            sink,
            loc.measurement.as_str(),
            location_tag,
        );
        tasks.push(Box::new(
            PeriodicTask::new("location", poller, loc.interval)
                .with_deadline(loc.scan_duration + SCAN_DEADLINE_MARGIN),
        ));
    }

    if config.subscriber.enabled {
        let sub = &config.subscriber;
        let mqtt = config
            .mqtt
            .as_ref()
            .ok_or(SinkError::NotConfigured("[mqtt]"))?;
        let connector = MqttConnector::new(mqtt, sub.topics.clone());
        tasks.push(Box::new(
            ReconnectingSubscriber::new("subscriber", connector, LogHandler, sub.reconnect_interval)
                .with_connect_timeout(sub.connect_timeout)
                .with_handler_timeout(sub.handler_timeout),
        ));
    }

    Ok(tasks)
}

/// Build the tasks and run them under `orchestrator` until its signal fires.
pub async fn run_with(
    options: Options,
    devices: &dyn Devices,
    orchestrator: Orchestrator,
    broker_log: &BrokerLog,
) -> Result<RunReport, RunError> {
    let config = load_config(&options)?;
    forward_logs(&config, broker_log)?;
    let tasks = build_tasks(&config, &options, devices)?;
    Ok(orchestrator.run(tasks).await)
}

/// Run with real devices until SIGINT or SIGTERM.
pub async fn run(options: Options, broker_log: &BrokerLog) -> Result<RunReport, RunError> {
    let mut orchestrator = Orchestrator::default();
    orchestrator.install_interrupt_handlers()?;
    run_with(options, &RealDevices, orchestrator, broker_log).await
}
