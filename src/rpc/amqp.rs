//! # AMQP Transport
//!
//! RabbitMQ-backed [`Transport`] built on lapin.
//!
//! ## Topology:
//! - **Worker queue**: durable, declared at connect time (same declaration the worker makes)
//! - **Reply queue**: exclusive, auto-delete, server-named; one per gateway process,
//!   consumed on its own channel so a channel error while publishing does not stop replies
//! - **Publishing**: default exchange, routing key = queue name, persistent delivery,
//!   `correlation_id` and `reply_to` set as message properties. Bodies over
//!   `max_message_bytes` are refused locally; the broker would close the channel.
//!
//! ## Failure surfacing:
//! A connection error or the end of the reply consumer flips the transport to
//! disconnected and tells the dispatcher, so in-flight calls fail fast instead of
//! waiting for their deadline. Reconnecting is left to the process supervisor.

use crate::config::BrokerConfig;
use crate::rpc::envelope::{CommandEnvelope, ReplyEnvelope};
use crate::rpc::transport::{ReplyDispatcher, Transport, TransportError};
use async_trait::async_trait;
use futures_util::stream::StreamExt;
use lapin::options::{BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use std::collections::HashSet;
use tokio_executor_trait::Tokio as TokioExecutor;
use tokio_reactor_trait::Tokio as TokioReactor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const REPLY_CONSUMER_TAG: &str = "transcribe-gateway-replies";
const PERSISTENT: u8 = 2;

type SharedDispatcher = Arc<OnceLock<Arc<dyn ReplyDispatcher>>>;

pub struct AmqpTransport {
    connection: Connection,
    publish_channel: Channel,
    // Kept open for the lifetime of the reply consumer
    _reply_channel: Channel,
    reply_queue: String,
    destinations: HashSet<String>,
    max_message_bytes: usize,
    dispatcher: SharedDispatcher,
    connected: Arc<AtomicBool>,
    consumer_task: Mutex<Option<JoinHandle<()>>>,
}

impl AmqpTransport {
    /// Connect, declare the worker queue and a private reply queue, and start consuming replies.
    pub async fn connect(config: &BrokerConfig) -> Result<Self, TransportError> {
        let worker_queue = config.queue.as_str();
        let properties = ConnectionProperties::default()
            .with_executor(TokioExecutor::current())
            .with_reactor(TokioReactor);
        let connection = Connection::connect(&config.url, properties)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let publish_channel = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let reply_channel = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        publish_channel
            .queue_declare(
                worker_queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Connect(format!("declare {}: {}", worker_queue, e)))?;

        let reply = reply_channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Connect(format!("declare reply queue: {}", e)))?;
        let reply_queue = reply.name().as_str().to_string();

        let consumer = reply_channel
            .basic_consume(
                &reply_queue,
                REPLY_CONSUMER_TAG,
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Connect(format!("consume {}: {}", reply_queue, e)))?;

        let dispatcher: SharedDispatcher = Arc::new(OnceLock::new());
        let connected = Arc::new(AtomicBool::new(true));

        {
            let dispatcher = dispatcher.clone();
            let connected = connected.clone();
            connection.on_error(move |err| {
                error!(error = %err, "Broker connection error");
                connected.store(false, Ordering::SeqCst);
                if let Some(dispatcher) = dispatcher.get() {
                    dispatcher.connection_lost(&err.to_string());
                }
            });
        }

        let consumer_task = tokio::spawn(consume_replies(consumer, dispatcher.clone(), connected.clone()));

        info!(worker_queue, reply_queue = %reply_queue, "Connected to broker");

        Ok(Self {
            connection,
            publish_channel,
            _reply_channel: reply_channel,
            reply_queue,
            destinations: HashSet::from([worker_queue.to_string()]),
            max_message_bytes: config.max_message_bytes,
            dispatcher,
            connected,
            consumer_task: Mutex::new(Some(consumer_task)),
        })
    }

    /// Startup connect with a fixed pause between attempts.
    pub async fn connect_with_retry(config: &BrokerConfig) -> Result<Self, TransportError> {
        let mut attempt = 1;
        loop {
            match Self::connect(config).await {
                Ok(transport) => return Ok(transport),
                Err(e) if attempt < config.connect_attempts => {
                    warn!(
                        attempt,
                        max_attempts = config.connect_attempts,
                        error = %e,
                        "Broker not reachable yet, retrying"
                    );
                    tokio::time::sleep(config.connect_retry_delay()).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

async fn consume_replies(mut consumer: Consumer, dispatcher: SharedDispatcher, connected: Arc<AtomicBool>) {
    while let Some(delivery) = consumer.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(e) => {
                error!(error = %e, "Reply consumer failed");
                break;
            }
        };

        let property_id = delivery.properties.correlation_id().as_ref().map(|id| id.as_str());
        let Some(reply) = ReplyEnvelope::decode(property_id, &delivery.data) else {
            warn!(bytes = delivery.data.len(), "Dropping reply without correlation id");
            continue;
        };

        match dispatcher.get() {
            Some(dispatcher) => dispatcher.dispatch(reply),
            None => warn!(correlation_id = %reply.correlation_id, "No reply dispatcher registered, dropping reply"),
        }
    }

    connected.store(false, Ordering::SeqCst);
    if let Some(dispatcher) = dispatcher.get() {
        dispatcher.connection_lost("reply consumer stopped");
    }
}

/// Checks a publish could be accepted before anything reaches the broker.
fn check_outbound(
    destinations: &HashSet<String>,
    destination: &str,
    body_len: usize,
    max_message_bytes: usize,
) -> Result<(), TransportError> {
    if !destinations.contains(destination) {
        return Err(TransportError::UnknownDestination(destination.to_string()));
    }
    if body_len > max_message_bytes {
        return Err(TransportError::Publish(format!(
            "message of {} bytes exceeds the broker limit of {} bytes",
            body_len, max_message_bytes
        )));
    }
    Ok(())
}

fn classify_publish_error(err: lapin::Error) -> TransportError {
    match err {
        lapin::Error::InvalidChannelState(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::IOError(_) => TransportError::ConnectionLost(err.to_string()),
        other => TransportError::Publish(other.to_string()),
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn publish(&self, destination: &str, envelope: &CommandEnvelope) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::ConnectionLost("broker connection is down".to_string()));
        }
        let body = envelope.body();
        check_outbound(&self.destinations, destination, body.len(), self.max_message_bytes)?;

        let properties = BasicProperties::default()
            .with_correlation_id(envelope.correlation_id.to_string().into())
            .with_reply_to(self.reply_queue.clone().into())
            .with_content_type("application/json".into())
            .with_delivery_mode(PERSISTENT);

        self.publish_channel
            .basic_publish("", destination, BasicPublishOptions::default(), body, properties)
            .await
            .map_err(classify_publish_error)?;

        debug!(
            destination,
            command = %envelope.command,
            correlation_id = %envelope.correlation_id,
            bytes = body.len(),
            "Published command"
        );
        Ok(())
    }

    fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    fn on_reply(&self, dispatcher: Arc<dyn ReplyDispatcher>) -> Result<(), TransportError> {
        self.dispatcher
            .set(dispatcher)
            .map_err(|_| TransportError::AlreadySubscribed)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
            && self.connection.status().connected()
            && self.publish_channel.status().connected()
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Err(e) = self.connection.close(200, "gateway shutting down").await {
            warn!(error = %e, "Broker connection did not close cleanly");
        }
        let task = self
            .consumer_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn worker_queues() -> HashSet<String> {
        HashSet::from(["transcribe_queue".to_string()])
    }

    #[test]
    fn test_outbound_checks_destination_and_size() {
        let queues = worker_queues();

        assert_eq!(check_outbound(&queues, "transcribe_queue", 1024, 1024), Ok(()));
        assert_eq!(
            check_outbound(&queues, "other_queue", 10, 1024),
            Err(TransportError::UnknownDestination("other_queue".to_string()))
        );
        assert!(matches!(
            check_outbound(&queues, "transcribe_queue", 1025, 1024),
            Err(TransportError::Publish(msg)) if msg.contains("1025")
        ));
    }

    #[test]
    fn test_dead_channel_or_socket_is_connection_loss() {
        let closed_channel = lapin::Error::InvalidChannelState(lapin::ChannelState::Closed);
        let closed_connection = lapin::Error::InvalidConnectionState(lapin::ConnectionState::Closed);
        let socket = lapin::Error::IOError(Arc::new(io::Error::from(io::ErrorKind::ConnectionReset)));

        for err in [closed_channel, closed_connection, socket] {
            assert!(matches!(classify_publish_error(err), TransportError::ConnectionLost(_)));
        }

        assert!(matches!(
            classify_publish_error(lapin::Error::ChannelsLimitReached),
            TransportError::Publish(_)
        ));
    }
}
