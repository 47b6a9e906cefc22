//! Seam between the RPC bridge and the message broker.

use crate::rpc::envelope::{CommandEnvelope, ReplyEnvelope};
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("broker connection failed: {0}")]
    Connect(String),
    #[error("broker connection lost: {0}")]
    ConnectionLost(String),
    #[error("unknown destination queue: {0}")]
    UnknownDestination(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("a reply dispatcher is already registered")]
    AlreadySubscribed,
}

/// Receives every reply the transport consumes from its reply queue.
///
/// Invoked from the transport's consumer task, one reply at a time, in the order the
/// broker delivered them. Implementations must not block.
pub trait ReplyDispatcher: Send + Sync {
    fn dispatch(&self, reply: ReplyEnvelope);

    /// The reply consumer stopped; no further replies will arrive.
    fn connection_lost(&self, reason: &str);
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish a command to `destination` with replies routed to [`Transport::reply_queue`].
    /// Returns once the broker accepted the message; never waits for the reply.
    async fn publish(&self, destination: &str, envelope: &CommandEnvelope) -> Result<(), TransportError>;

    /// Reply queue owned by this gateway instance.
    fn reply_queue(&self) -> &str;

    /// Register the single dispatcher for inbound replies.
    fn on_reply(&self, dispatcher: Arc<dyn ReplyDispatcher>) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    async fn close(&self);
}
