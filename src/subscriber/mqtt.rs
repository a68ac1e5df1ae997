//! MQTT subscription on top of `rumqttc`.

use super::{ConnectionError, Connector, HandlerError, Message, MessageHandler, MessageStream};
use crate::config::MqttConfig;
use crate::sink::mqtt::{REQUEST_CHANNEL_CAPACITY, mqtt_options};
use futures::future::BoxFuture;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeReasonCode};
use tracing::{debug, info};

/// Connects a fresh client per attempt and subscribes to every topic.
pub struct MqttConnector {
    options: MqttOptions,
    topics: Vec<String>,
}

impl MqttConnector {
    pub fn new(config: &MqttConfig, topics: Vec<String>) -> Self {
        Self {
            options: mqtt_options(config, "subscriber"),
            topics,
        }
    }
}

impl Connector for MqttConnector {
    type Stream = MqttStream;

    /// Completes once the broker has acknowledged every subscription.
    fn connect(&mut self) -> BoxFuture<'_, Result<MqttStream, ConnectionError>> {
        Box::pin(async move {
            let capacity = REQUEST_CHANNEL_CAPACITY.max(self.topics.len());
            let (client, mut eventloop) = AsyncClient::new(self.options.clone(), capacity);
            for topic in &self.topics {
                client.subscribe(topic.as_str(), QoS::AtMostOnce).await?;
            }

            let mut pending = self.topics.len();
            while pending > 0 {
                match eventloop.poll().await? {
                    Event::Incoming(Packet::ConnAck(_)) => {
                        let (host, port) = self.options.broker_address();
                        info!(broker = %format!("{host}:{port}"), "MQTT subscriber connected");
                    }
                    Event::Incoming(Packet::SubAck(ack)) => {
                        let rejected = ack
                            .return_codes
                            .iter()
                            .any(|code| matches!(code, SubscribeReasonCode::Failure));
                        if rejected {
                            return Err(ConnectionError::Rejected(self.topics.join(", ")));
                        }
                        // One subscribe request per topic, so one ack each
                        pending -= 1;
                    }
                    event => debug!(?event, "MQTT subscriber event"),
                }
            }

            Ok(MqttStream {
                _client: client,
                eventloop,
            })
        })
    }
}

pub struct MqttStream {
    // Dropping the client closes the request channel.
    _client: AsyncClient,
    eventloop: EventLoop,
}

impl MessageStream for MqttStream {
    fn next_message(&mut self) -> BoxFuture<'_, Result<Message, ConnectionError>> {
        Box::pin(async move {
            loop {
                match self.eventloop.poll().await? {
                    Event::Incoming(Packet::Publish(publish)) => {
                        return Ok(Message {
                            topic: publish.topic,
                            payload: publish.payload.to_vec(),
                        });
                    }
                    event => debug!(?event, "MQTT subscriber event"),
                }
            }
        })
    }
}

/// Logs every message as a progress line.
#[derive(Debug, Default)]
pub struct LogHandler;

impl MessageHandler for LogHandler {
    fn handle<'a>(&'a mut self, message: &'a Message) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            info!("received {} on {}", message.payload_str(), message.topic);
            Ok(())
        })
    }
}
