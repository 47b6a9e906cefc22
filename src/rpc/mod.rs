//! # Broker RPC
//!
//! Request/reply over a message broker, bridged into plain async calls.
//!
//! ## Key Components:
//! - **Envelopes**: Command and reply message shapes, audio byte payloads
//! - **Transport**: Broker seam (`Transport` / `ReplyDispatcher` traits) and its AMQP implementation
//! - **Pending Calls**: Registry of in-flight calls keyed by correlation id
//! - **Bridge**: `request(command, payload, timeout)` on top of the above

pub mod amqp;        // lapin-backed transport
pub mod bridge;      // Correlated, timeout-bounded request/reply
pub mod envelope;    // Wire shapes
pub mod pending;     // In-flight call registry
pub mod transport;   // Transport traits and errors

#[cfg(test)]
pub mod mock;

pub use amqp::AmqpTransport;
pub use bridge::{BridgeError, RpcBridge};
pub use envelope::{AudioPayload, ErrorDescriptor};
