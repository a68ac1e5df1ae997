//! MQTT publisher: one JSON document per point.

use super::{Sink, SinkError};
use crate::config::MqttConfig;
use crate::sink::line_protocol::DataPoint;
use futures::future::BoxFuture;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Requests buffered between the client handle and its event loop.
pub const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Delay before the event loop is polled again after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// How long `close` waits for queued publishes and the DISCONNECT to go out.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Broker options for one session; `client_suffix` keeps per-task client ids unique.
pub fn mqtt_options(config: &MqttConfig, client_suffix: &str) -> MqttOptions {
    let mut options = MqttOptions::new(
        format!("{}-{}", config.client_id, client_suffix),
        config.host.clone(),
        config.port,
    );
    options.set_keep_alive(config.keep_alive);
    options
}

/// Drive a client's event loop until the client sends DISCONNECT.
///
/// Connection errors are retried after [`RECONNECT_DELAY`]. Must be called
/// from within a tokio runtime.
pub(crate) fn spawn_driver(mut eventloop: EventLoop, broker: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(broker = %broker, "MQTT publisher connected");
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!(broker = %broker, "MQTT publisher disconnected");
                    break;
                }
                Ok(event) => debug!(?event, "MQTT publisher event"),
                Err(e) => {
                    warn!(broker = %broker, error = %e, "MQTT publisher connection error");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    })
}

/// Queue a DISCONNECT behind any pending publishes and wait for the driver
/// to send it. The driver is aborted if that takes longer than
/// [`DRAIN_TIMEOUT`]; returns whether the queue was drained.
pub(crate) async fn disconnect(client: AsyncClient, driver: &mut JoinHandle<()>) -> bool {
    if client.try_disconnect().is_ok() && timeout(DRAIN_TIMEOUT, &mut *driver).await.is_ok() {
        return true;
    }
    driver.abort();
    false
}

pub struct MqttSink {
    client: Option<AsyncClient>,
    topic: String,
    driver: JoinHandle<()>,
}

impl MqttSink {
    /// Create the client and spawn the task that drives its connection.
    ///
    /// Must be called from within a tokio runtime. Connecting happens lazily
    /// in the driver; until then publishes are queued.
    pub fn new(config: &MqttConfig, topic: &str, client_suffix: &str) -> Self {
        let (client, eventloop) =
            AsyncClient::new(mqtt_options(config, client_suffix), REQUEST_CHANNEL_CAPACITY);
        let driver = spawn_driver(eventloop, format!("{}:{}", config.host, config.port));

        Self {
            client: Some(client),
            topic: topic.to_string(),
            driver,
        }
    }
}

impl Sink for MqttSink {
    fn write<'a>(&'a mut self, point: &'a DataPoint) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            let client = self.client.as_ref().ok_or(SinkError::Closed)?;
            point.check_writable()?;
            let payload = serde_json::to_vec(&point.to_json())?;
            // Never wait on a full queue: a stalled broker must not stall the task.
            client.try_publish(self.topic.as_str(), QoS::AtLeastOnce, false, payload)?;
            Ok(())
        })
    }

    /// Queued publishes go out ahead of the DISCONNECT.
    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let Some(client) = self.client.take() else {
                return;
            };
            if !disconnect(client, &mut self.driver).await {
                warn!(topic = %self.topic, "MQTT publisher not drained, dropping queued points");
            }
        })
    }
}

impl Drop for MqttSink {
    fn drop(&mut self) {
        self.driver.abort();
    }
}
