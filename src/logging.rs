//! Log events forwarded to the broker as JSON documents.
//!
//! Each event becomes one object holding the service name, the level, the
//! message as `event`, a nanosecond `timestamp` and the event's own fields.
//! Documents are published at QoS 1 on the configured topic. Forwarding
//! starts once [`BrokerLog::attach`] has run; earlier events only reach the
//! local output.

use crate::config::{ConfigError, LoggingConfig, MqttConfig};
use crate::sink::mqtt::{REQUEST_CHANNEL_CAPACITY, disconnect, mqtt_options, spawn_driver};
use rumqttc::{AsyncClient, QoS};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::SystemTime;
use tokio::task::JoinHandle;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Targets never forwarded: the broker connection's own chatter would feed
/// back into the topic it is reporting on.
const PLUMBING_TARGETS: &[&str] = &["rumqttc", "envbeacon::sink::mqtt"];

/// Where forwarded events go.
pub trait LogTransport: Send + Sync + 'static {
    /// Called from inside the subscriber: must neither block nor log.
    fn send(&self, payload: Vec<u8>);
}

struct MqttTransport {
    client: AsyncClient,
    topic: String,
}

impl LogTransport for MqttTransport {
    fn send(&self, payload: Vec<u8>) {
        // A full queue drops the event; there is nowhere left to report it.
        let _ = self
            .client
            .try_publish(self.topic.as_str(), QoS::AtLeastOnce, false, payload);
    }
}

struct Forwarder {
    transport: Box<dyn LogTransport>,
    service: String,
    level: Level,
}

/// Handle shared between the subscriber layer and the code that connects it.
#[derive(Clone, Default)]
pub struct BrokerLog {
    forwarder: Arc<OnceLock<Forwarder>>,
    connection: Arc<Mutex<Option<(AsyncClient, JoinHandle<()>)>>>,
}

impl BrokerLog {
    /// The layer to install in the subscriber. It forwards nothing until a
    /// transport is attached.
    pub fn layer(&self) -> BrokerLogLayer {
        BrokerLogLayer {
            forwarder: self.forwarder.clone(),
        }
    }

    pub fn is_attached(&self) -> bool {
        self.forwarder.get().is_some()
    }

    /// Start forwarding to the broker. Must be called within a tokio runtime.
    ///
    /// Returns `Ok(false)` if forwarding was already attached.
    pub fn attach(&self, mqtt: &MqttConfig, config: &LoggingConfig) -> Result<bool, ConfigError> {
        let level = config.level()?;
        if self.is_attached() {
            return Ok(false);
        }
        let (client, eventloop) =
            AsyncClient::new(mqtt_options(mqtt, "log"), REQUEST_CHANNEL_CAPACITY);
        let driver = spawn_driver(eventloop, format!("{}:{}", mqtt.host, mqtt.port));
        let transport = MqttTransport {
            client: client.clone(),
            topic: config.topic.clone(),
        };
        if !self.attach_transport(transport, &config.service, level) {
            driver.abort();
            return Ok(false);
        }
        if let Ok(mut connection) = self.connection.lock() {
            *connection = Some((client, driver));
        }
        Ok(true)
    }

    /// Forward events at `level` or more severe to `transport`.
    pub fn attach_transport(
        &self,
        transport: impl LogTransport,
        service: &str,
        level: Level,
    ) -> bool {
        self.forwarder
            .set(Forwarder {
                transport: Box::new(transport),
                service: service.to_string(),
                level,
            })
            .is_ok()
    }

    /// Send what is still queued, then disconnect from the broker.
    pub async fn close(&self) {
        let connection = self
            .connection
            .lock()
            .ok()
            .and_then(|mut connection| connection.take());
        if let Some((client, mut driver)) = connection {
            disconnect(client, &mut driver).await;
        }
    }
}

/// `tracing-subscriber` layer feeding a [`BrokerLog`].
pub struct BrokerLogLayer {
    forwarder: Arc<OnceLock<Forwarder>>,
}

impl<S: Subscriber> Layer<S> for BrokerLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let Some(forwarder) = self.forwarder.get() else {
            return;
        };
        let metadata = event.metadata();
        if *metadata.level() > forwarder.level || is_plumbing(metadata.target()) {
            return;
        }
        let record = to_record(&forwarder.service, event, SystemTime::now());
        if let Ok(payload) = serde_json::to_vec(&record) {
            forwarder.transport.send(payload);
        }
    }
}

/// Records bridged from the `log` crate carry the target `log`.
fn is_plumbing(target: &str) -> bool {
    target == "log" || PLUMBING_TARGETS.iter().any(|prefix| target.starts_with(prefix))
}

fn level_name(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "error",
        Level::WARN => "warning",
        Level::INFO => "info",
        Level::DEBUG => "debug",
        _ => "trace",
    }
}

/// Render one event. The reserved keys win over event fields of the same name.
pub fn to_record(service: &str, event: &Event<'_>, time: SystemTime) -> Value {
    let mut fields = JsonFields::default();
    event.record(&mut fields);

    let mut object = fields.values;
    object.insert("service".into(), Value::from(service));
    object.insert("level".into(), Value::from(level_name(event.metadata().level())));
    object.insert("event".into(), Value::from(fields.message.unwrap_or_default()));
    let nanos = time
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    object.insert("timestamp".into(), Value::from(nanos as u64));
    Value::Object(object)
}

#[derive(Default)]
struct JsonFields {
    message: Option<String>,
    values: Map<String, Value>,
}

impl JsonFields {
    fn insert(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = Some(match value {
                Value::String(s) => s,
                other => other.to_string(),
            });
        } else {
            self.values.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for JsonFields {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::from(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, Value::from(format!("{value:?}")));
    }
}
