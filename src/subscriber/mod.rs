//! Long-lived broker subscription that survives connection loss.
//!
//! [`ReconnectingSubscriber`] cycles through connecting, subscribed and
//! backing-off until cancelled. Every connection fault is retried after a
//! fixed delay; a message the handler cannot process is logged and skipped.

pub mod mqtt;

use crate::cancel::CancellationSignal;
use crate::task::{Task, TaskOutcome};
use futures::future::BoxFuture;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub use mqtt::{LogHandler, MqttConnector};

/// One message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Connection-level fault; always recoverable by reconnecting.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("MQTT connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),
    #[error("subscription to {0} rejected")]
    Rejected(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Other(String),
}

/// A message the handler could not process.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct HandlerError(pub String);

/// A live subscription. Any error means the connection is gone.
pub trait MessageStream: Send {
    fn next_message(&mut self) -> BoxFuture<'_, Result<Message, ConnectionError>>;
}

/// Opens a connection and subscribes.
pub trait Connector: Send + 'static {
    type Stream: MessageStream;

    fn connect(&mut self) -> BoxFuture<'_, Result<Self::Stream, ConnectionError>>;
}

pub trait MessageHandler: Send + 'static {
    fn handle<'a>(&'a mut self, message: &'a Message) -> BoxFuture<'a, Result<(), HandlerError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Connecting,
    Subscribed,
    BackingOff,
    /// Cancelled; nothing follows
    Stopped,
}

pub struct ReconnectingSubscriber<C, H> {
    name: String,
    connector: C,
    handler: H,
    backoff: Duration,
    connect_timeout: Duration,
    handler_timeout: Duration,
    state: watch::Sender<SubscriberState>,
}

impl<C: Connector, H: MessageHandler> ReconnectingSubscriber<C, H> {
    pub fn new(name: impl Into<String>, connector: C, handler: H, backoff: Duration) -> Self {
        let (state, _) = watch::channel(SubscriberState::Connecting);
        Self {
            name: name.into(),
            connector,
            handler,
            backoff,
            connect_timeout: Duration::from_secs(10),
            handler_timeout: Duration::from_secs(10),
            state,
        }
    }

    /// Bound each connect-and-subscribe attempt.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Bound the handling of each message; a message that takes longer is dropped.
    pub fn with_handler_timeout(mut self, handler_timeout: Duration) -> Self {
        self.handler_timeout = handler_timeout;
        self
    }

    /// Observe state transitions.
    pub fn state(&self) -> watch::Receiver<SubscriberState> {
        self.state.subscribe()
    }

    /// Run until cancelled. Connection faults never end the loop.
    pub async fn run(mut self, signal: CancellationSignal) -> TaskOutcome {
        let mut attempt: u64 = 0;
        while !signal.is_triggered() {
            attempt += 1;
            self.set_state(SubscriberState::Connecting);
            debug!(task = %self.name, attempt, "connecting");

            let connected = tokio::select! {
                _ = signal.cancelled() => break,
                connected = timeout(self.connect_timeout, self.connector.connect()) => connected,
            };
            match connected {
                Ok(Ok(stream)) => {
                    self.set_state(SubscriberState::Subscribed);
                    info!(task = %self.name, attempt, "subscribed");
                    attempt = 0;
                    match self.consume(stream, &signal).await {
                        Some(e) => warn!(task = %self.name, error = %e, "connection lost"),
                        None => break,
                    }
                }
                Ok(Err(e)) => warn!(task = %self.name, error = %e, "connect failed"),
                Err(_) => warn!(
                    task = %self.name,
                    error = %ConnectionError::Timeout(self.connect_timeout),
                    "connect failed"
                ),
            }

            self.set_state(SubscriberState::BackingOff);
            info!(task = %self.name, delay = ?self.backoff, "reconnecting after delay");
            if signal.sleep(self.backoff).await {
                break;
            }
        }

        self.set_state(SubscriberState::Stopped);
        info!(task = %self.name, "task stopped");
        TaskOutcome::Cancelled
    }

    /// Hand messages to the handler until the connection fails (`Some`) or
    /// the signal fires (`None`).
    async fn consume(
        &mut self,
        mut stream: C::Stream,
        signal: &CancellationSignal,
    ) -> Option<ConnectionError> {
        loop {
            let next = tokio::select! {
                _ = signal.cancelled() => return None,
                next = stream.next_message() => next,
            };
            match next {
                Ok(message) => {
                    let handled = tokio::select! {
                        _ = signal.cancelled() => return None,
                        handled = timeout(self.handler_timeout, self.handler.handle(&message)) => handled,
                    };
                    let error = match handled {
                        Ok(Ok(())) => continue,
                        Ok(Err(e)) => e,
                        Err(_) => HandlerError(format!("timed out after {:?}", self.handler_timeout)),
                    };
                    warn!(task = %self.name, topic = %message.topic, error = %error, "message dropped");
                }
                Err(e) => return Some(e),
            }
        }
    }

    fn set_state(&self, state: SubscriberState) {
        self.state.send_replace(state);
    }
}

impl<C: Connector, H: MessageHandler> Task for ReconnectingSubscriber<C, H> {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(self: Box<Self>, signal: CancellationSignal) -> BoxFuture<'static, TaskOutcome> {
        Box::pin(ReconnectingSubscriber::run(*self, signal))
    }
}
