//! In-memory transport for tests. Records every publish and optionally answers it.

use crate::rpc::envelope::{CommandEnvelope, ReplyEnvelope};
use crate::rpc::transport::{ReplyDispatcher, Transport, TransportError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

type Responder = Box<dyn Fn(&CommandEnvelope) -> Option<ReplyEnvelope> + Send + Sync>;

pub const MOCK_WORKER_QUEUE: &str = "transcribe_queue";

pub struct MockTransport {
    dispatcher: OnceLock<Arc<dyn ReplyDispatcher>>,
    published: Mutex<Vec<(String, CommandEnvelope)>>,
    responder: Option<Responder>,
    delay: Duration,
    connected: AtomicBool,
}

impl MockTransport {
    /// A worker that never answers.
    pub fn silent() -> Self {
        Self {
            dispatcher: OnceLock::new(),
            published: Mutex::new(Vec::new()),
            responder: None,
            delay: Duration::ZERO,
            connected: AtomicBool::new(true),
        }
    }

    /// A worker that answers immediately with whatever `responder` returns.
    pub fn replying<F>(responder: F) -> Self
    where
        F: Fn(&CommandEnvelope) -> Option<ReplyEnvelope> + Send + Sync + 'static,
    {
        Self {
            responder: Some(Box::new(responder)),
            ..Self::silent()
        }
    }

    /// A worker that answers from a spawned task after `delay`.
    pub fn replying_after<F>(delay: Duration, responder: F) -> Self
    where
        F: Fn(&CommandEnvelope) -> Option<ReplyEnvelope> + Send + Sync + 'static,
    {
        Self {
            delay,
            ..Self::replying(responder)
        }
    }

    pub fn published(&self) -> Vec<(String, CommandEnvelope)> {
        self.published.lock().unwrap().clone()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Push a reply as if it had arrived on the reply queue.
    pub fn deliver(&self, reply: ReplyEnvelope) {
        if let Some(dispatcher) = self.dispatcher.get() {
            dispatcher.dispatch(reply);
        }
    }

    pub fn drop_connection(&self, reason: &str) {
        self.set_connected(false);
        if let Some(dispatcher) = self.dispatcher.get() {
            dispatcher.connection_lost(reason);
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn publish(&self, destination: &str, envelope: &CommandEnvelope) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::ConnectionLost("mock disconnected".to_string()));
        }
        if destination != MOCK_WORKER_QUEUE {
            return Err(TransportError::UnknownDestination(destination.to_string()));
        }

        self.published
            .lock()
            .unwrap()
            .push((destination.to_string(), envelope.clone()));

        let reply = self.responder.as_ref().and_then(|respond| respond(envelope));
        if let (Some(reply), Some(dispatcher)) = (reply, self.dispatcher.get()) {
            if self.delay.is_zero() {
                dispatcher.dispatch(reply);
            } else {
                let dispatcher = dispatcher.clone();
                let delay = self.delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    dispatcher.dispatch(reply);
                });
            }
        }

        Ok(())
    }

    fn reply_queue(&self) -> &str {
        "mock.reply"
    }

    fn on_reply(&self, dispatcher: Arc<dyn ReplyDispatcher>) -> Result<(), TransportError> {
        self.dispatcher
            .set(dispatcher)
            .map_err(|_| TransportError::AlreadySubscribed)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.set_connected(false);
    }
}
