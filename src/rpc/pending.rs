//! # Pending Call Registry
//!
//! Bookkeeping for RPCs that have been published but not yet answered. This map is the
//! only mutable state shared between HTTP tasks and the broker consumer task.
//!
//! ## Exactly-once resolution:
//! Every path that finishes a call (reply, timeout, connection loss, caller cancel)
//! first takes the entry out of the map under the lock. Whoever removes the entry owns
//! the resolver; everyone else finds nothing and does nothing. A second reply for the
//! same correlation id, or a reply after the deadline, is therefore a no-op.

use crate::rpc::bridge::BridgeError;
use crate::rpc::envelope::{ReplyBody, ReplyEnvelope};
use crate::rpc::transport::{ReplyDispatcher, TransportError};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

pub type CallOutcome = Result<Value, BridgeError>;

/// One outstanding RPC.
#[derive(Debug)]
pub struct PendingCall {
    pub command: String,
    pub created_at: Instant,
    resolver: oneshot::Sender<CallOutcome>,
}

impl PendingCall {
    pub(crate) fn finish(self, outcome: CallOutcome) {
        // The caller may have gone away already; nothing left to notify then.
        let _ = self.resolver.send(outcome);
    }
}

/// Ticket handed to the caller after registration.
#[derive(Debug)]
pub struct Registration {
    pub correlation_id: Uuid,
    pub deadline: Instant,
    pub receiver: oneshot::Receiver<CallOutcome>,
}

#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: Mutex<HashMap<Uuid, PendingCall>>,
    stats: BridgeStats,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, PendingCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new call with a fresh correlation id and `deadline = now + timeout`.
    pub fn register(&self, command: &str, timeout: Duration) -> Registration {
        let (resolver, receiver) = oneshot::channel();
        let created_at = Instant::now();
        let deadline = created_at + timeout;

        let mut calls = self.lock();
        let mut correlation_id = Uuid::new_v4();
        while calls.contains_key(&correlation_id) {
            correlation_id = Uuid::new_v4();
        }
        calls.insert(
            correlation_id,
            PendingCall {
                command: command.to_string(),
                created_at,
                resolver,
            },
        );

        Registration {
            correlation_id,
            deadline,
            receiver,
        }
    }

    /// Take the entry out of the registry. `None` means another path already finished it.
    pub fn remove(&self, correlation_id: &Uuid) -> Option<PendingCall> {
        self.lock().remove(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Reject every outstanding call. Returns how many were rejected.
    pub fn reject_all(&self, error: BridgeError) -> usize {
        let drained: Vec<PendingCall> = self.lock().drain().map(|(_, call)| call).collect();
        let count = drained.len();
        for call in drained {
            call.finish(Err(error.clone()));
        }
        count
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }
}

impl ReplyDispatcher for PendingCalls {
    fn dispatch(&self, reply: ReplyEnvelope) {
        let correlation_id = match Uuid::parse_str(&reply.correlation_id) {
            Ok(id) => id,
            Err(_) => {
                warn!(correlation_id = %reply.correlation_id, "Discarding reply with invalid correlation id");
                self.stats.discarded_replies.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let Some(call) = self.remove(&correlation_id) else {
            debug!(%correlation_id, "Discarding reply for unknown or expired call");
            self.stats.discarded_replies.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let elapsed_ms = call.created_at.elapsed().as_millis() as u64;
        match reply.body {
            ReplyBody::Success(value) => {
                debug!(%correlation_id, command = %call.command, elapsed_ms, "Call resolved");
                self.stats.resolved.fetch_add(1, Ordering::Relaxed);
                call.finish(Ok(value));
            }
            ReplyBody::Error(descriptor) => {
                debug!(
                    %correlation_id,
                    command = %call.command,
                    elapsed_ms,
                    message = %descriptor.message,
                    "Call rejected by worker"
                );
                self.stats.remote_errors.fetch_add(1, Ordering::Relaxed);
                call.finish(Err(BridgeError::Remote(descriptor)));
            }
        }
    }

    fn connection_lost(&self, reason: &str) {
        let rejected = self.reject_all(BridgeError::Transport(TransportError::ConnectionLost(
            reason.to_string(),
        )));
        self.stats
            .transport_failures
            .fetch_add(rejected as u64, Ordering::Relaxed);
        warn!(rejected, reason, "Broker connection lost, rejected in-flight calls");
    }
}

/// Lifetime counters for the bridge.
#[derive(Debug, Default)]
pub struct BridgeStats {
    pub published: AtomicU64,
    pub resolved: AtomicU64,
    pub remote_errors: AtomicU64,
    pub timed_out: AtomicU64,
    pub transport_failures: AtomicU64,
    pub cancelled: AtomicU64,
    pub discarded_replies: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BridgeStatsSnapshot {
    pub published: u64,
    pub resolved: u64,
    pub remote_errors: u64,
    pub timed_out: u64,
    pub transport_failures: u64,
    pub cancelled: u64,
    pub discarded_replies: u64,
}

impl BridgeStats {
    pub fn snapshot(&self) -> BridgeStatsSnapshot {
        BridgeStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            resolved: self.resolved.load(Ordering::Relaxed),
            remote_errors: self.remote_errors.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            transport_failures: self.transport_failures.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            discarded_replies: self.discarded_replies.load(Ordering::Relaxed),
        }
    }
}
