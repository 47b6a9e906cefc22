//! # RPC Bridge
//!
//! Turns a publish on the broker plus a later reply on the reply queue into one
//! awaitable call:
//!
//! ```text
//! request(command, payload, timeout)
//!   1. register pending call (fresh UUID, deadline = now + timeout)
//!   2. publish {pattern, data, id} to the worker queue, reply_to = our queue
//!   3. await: reply -> Ok(body) / Remote(err)
//!             deadline -> Timeout
//!             connection lost -> Transport
//! ```
//!
//! The awaiting task is suspended on a oneshot receiver, so one broker connection
//! serves any number of concurrent HTTP requests.

use crate::rpc::envelope::{CommandEnvelope, ErrorDescriptor};
use crate::rpc::pending::{BridgeStatsSnapshot, CallOutcome, PendingCalls};
use crate::rpc::transport::{Transport, TransportError};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    #[error("no reply from worker within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("worker error: {}", .0.message)]
    Remote(ErrorDescriptor),
    #[error("could not encode command: {0}")]
    Encode(String),
}

pub struct RpcBridge {
    transport: Arc<dyn Transport>,
    destination: String,
    pending: Arc<PendingCalls>,
}

impl RpcBridge {
    /// Build the bridge and register it as the transport's only reply dispatcher.
    pub fn new(transport: Arc<dyn Transport>, destination: impl Into<String>) -> Result<Self, TransportError> {
        let pending = Arc::new(PendingCalls::new());
        transport.on_reply(pending.clone())?;

        Ok(Self {
            transport,
            destination: destination.into(),
            pending,
        })
    }

    /// Send `command` to the worker and wait for its reply, at most `timeout`.
    ///
    /// `payload` is encoded directly into the published body.
    pub async fn request<P>(&self, command: &str, payload: &P, timeout: Duration) -> Result<Value, BridgeError>
    where
        P: Serialize + Sync,
    {
        let registration = self.pending.register(command, timeout);
        let correlation_id = registration.correlation_id;

        // Removes the entry if this future is dropped before an outcome (client went away).
        let mut guard = CancelOnDrop {
            pending: &self.pending,
            correlation_id,
            armed: true,
        };

        let envelope = match CommandEnvelope::encode(command, correlation_id, payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                guard.disarm();
                self.pending.remove(&correlation_id);
                error!(%correlation_id, command, error = %e, "Command encoding failed");
                return Err(BridgeError::Encode(e.to_string()));
            }
        };
        debug!(%correlation_id, command, bytes = envelope.body().len(), "Command encoded");

        if let Err(e) = self.transport.publish(&self.destination, &envelope).await {
            guard.disarm();
            self.pending.remove(&correlation_id);
            self.pending.stats().transport_failures.fetch_add(1, Ordering::Relaxed);
            warn!(%correlation_id, command, error = %e, "Publish failed");
            return Err(BridgeError::Transport(e));
        }
        self.pending.stats().published.fetch_add(1, Ordering::Relaxed);
        debug!(%correlation_id, command, destination = %self.destination, "Command published");

        let mut receiver = registration.receiver;
        let outcome = match tokio::time::timeout_at(registration.deadline.into(), &mut receiver).await {
            Ok(Ok(outcome)) => outcome,
            // Resolver dropped without an outcome: registry torn down under us.
            Ok(Err(_)) => Err(BridgeError::Transport(TransportError::ConnectionLost(
                "pending call dropped".to_string(),
            ))),
            Err(_) => self.settle_expired(command, correlation_id, receiver, timeout).await,
        };

        guard.disarm();
        outcome
    }

    /// The deadline passed. Whoever removes the entry decides the outcome: if a reply
    /// already took it, its outcome is in flight on `receiver` and wins.
    async fn settle_expired(
        &self,
        command: &str,
        correlation_id: Uuid,
        receiver: oneshot::Receiver<CallOutcome>,
        timeout: Duration,
    ) -> CallOutcome {
        if self.pending.remove(&correlation_id).is_some() {
            self.pending.stats().timed_out.fetch_add(1, Ordering::Relaxed);
            warn!(%correlation_id, command, ?timeout, "Call timed out");
            return Err(BridgeError::Timeout(timeout));
        }

        debug!(%correlation_id, command, "Reply raced the deadline and won");
        receiver.await.unwrap_or(Err(BridgeError::Timeout(timeout)))
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn reply_queue(&self) -> &str {
        self.transport.reply_queue()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> BridgeStatsSnapshot {
        self.pending.stats().snapshot()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub async fn shutdown(&self) {
        self.transport.close().await;
        self.pending.reject_all(BridgeError::Transport(TransportError::ConnectionLost(
            "gateway shutting down".to_string(),
        )));
    }
}

struct CancelOnDrop<'a> {
    pending: &'a PendingCalls,
    correlation_id: Uuid,
    armed: bool,
}

impl CancelOnDrop<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed && self.pending.remove(&self.correlation_id).is_some() {
            self.pending.stats().cancelled.fetch_add(1, Ordering::Relaxed);
            debug!(correlation_id = %self.correlation_id, "Caller went away, pending call cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::envelope::{AudioPayload, ReplyEnvelope};
    use crate::rpc::mock::MockTransport;
    use serde_json::json;

    const WORKER_QUEUE: &str = "transcribe_queue";

    fn bridge_with(transport: &Arc<MockTransport>) -> RpcBridge {
        RpcBridge::new(transport.clone(), WORKER_QUEUE).unwrap()
    }

    #[tokio::test]
    async fn test_request_resolves_with_reply_body() {
        let transport = Arc::new(MockTransport::replying(|cmd| {
            Some(ReplyEnvelope::success(
                cmd.correlation_id.to_string(),
                json!({"status": "healthy", "echo": cmd.payload()}),
            ))
        }));
        let bridge = bridge_with(&transport);

        let result = bridge
            .request("health_check", &json!({"message": "check"}), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(result["status"], "healthy");
        assert_eq!(result["echo"]["message"], "check");
        assert_eq!(bridge.pending_count(), 0);

        let published = transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, WORKER_QUEUE);
        assert_eq!(published[0].1.command, "health_check");
    }

    #[tokio::test]
    async fn test_remote_error_is_propagated() {
        let transport = Arc::new(MockTransport::replying(|cmd| {
            Some(ReplyEnvelope::error(
                cmd.correlation_id.to_string(),
                ErrorDescriptor::new("corrupt audio"),
            ))
        }));
        let bridge = bridge_with(&transport);

        let err = bridge
            .request("transcribe_file", &json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert_eq!(err, BridgeError::Remote(ErrorDescriptor::new("corrupt audio")));
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_then_late_reply_is_ignored() {
        let transport = Arc::new(MockTransport::silent());
        let bridge = bridge_with(&transport);

        let err = bridge
            .request("health_check", &json!({}), Duration::from_millis(30))
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::Timeout(Duration::from_millis(30)));
        assert_eq!(bridge.pending_count(), 0);

        let late_id = transport.published()[0].1.correlation_id;
        transport.deliver(ReplyEnvelope::success(late_id.to_string(), json!({"status": "late"})));

        let stats = bridge.stats();
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.resolved, 0);
        assert_eq!(stats.discarded_replies, 1);
    }

    #[tokio::test]
    async fn test_concurrent_calls_never_cross() {
        // Each reply comes from its own delayed task, so arrival order is arbitrary.
        let transport = Arc::new(MockTransport::replying_after(Duration::from_millis(5), |cmd| {
            let n = cmd.payload()["n"].as_u64().unwrap();
            Some(ReplyEnvelope::success(cmd.correlation_id.to_string(), json!({"n": n})))
        }));
        let bridge = Arc::new(bridge_with(&transport));

        let mut handles = Vec::new();
        for n in 0..20u64 {
            let bridge = bridge.clone();
            handles.push(tokio::spawn(async move {
                let reply = bridge
                    .request("echo", &json!({"n": n}), Duration::from_secs(2))
                    .await
                    .unwrap();
                (n, reply)
            }));
        }

        for handle in handles {
            let (n, reply) = handle.await.unwrap();
            assert_eq!(reply["n"], n);
        }

        let mut ids: Vec<Uuid> = transport.published().iter().map(|(_, env)| env.correlation_id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 20);
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_failure_leaves_no_pending_call() {
        let transport = Arc::new(MockTransport::silent());
        transport.set_connected(false);
        let bridge = bridge_with(&transport);

        let err = bridge
            .request("health_check", &json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::Transport(TransportError::ConnectionLost(_))));
        assert_eq!(bridge.pending_count(), 0);
        assert!(transport.published().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_destination_is_rejected() {
        let transport = Arc::new(MockTransport::silent());
        let bridge = RpcBridge::new(transport.clone(), "no_such_queue").unwrap();

        let err = bridge
            .request("health_check", &json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            BridgeError::Transport(TransportError::UnknownDestination("no_such_queue".to_string()))
        );
    }

    #[tokio::test]
    async fn test_connection_loss_rejects_in_flight_call() {
        let transport = Arc::new(MockTransport::silent());
        let bridge = Arc::new(bridge_with(&transport));

        let call = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                bridge
                    .request("transcribe_file", &json!({}), Duration::from_secs(5))
                    .await
            })
        };

        while transport.published().is_empty() {
            tokio::task::yield_now().await;
        }
        transport.drop_connection("socket reset");

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::Transport(TransportError::ConnectionLost(_))));
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_request_is_cancelled() {
        let transport = Arc::new(MockTransport::silent());
        let bridge = bridge_with(&transport);

        let outcome = tokio::time::timeout(
            Duration::from_millis(20),
            bridge.request("transcribe_file", &json!({}), Duration::from_secs(10)),
        )
        .await;

        assert!(outcome.is_err());
        assert_eq!(bridge.pending_count(), 0);
        assert_eq!(bridge.stats().cancelled, 1);
    }

    #[tokio::test]
    async fn test_audio_bytes_reach_the_envelope() {
        let transport = Arc::new(MockTransport::replying(|cmd| {
            Some(ReplyEnvelope::success(cmd.correlation_id.to_string(), json!({"text": "hi"})))
        }));
        let bridge = bridge_with(&transport);
        let audio = vec![0x52, 0x49, 0x46, 0x46, 0x00, 0xff];

        bridge
            .request(
                "transcribe_file",
                &json!({"audioBuffer": AudioPayload(audio.clone())}),
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        let published = transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].1.payload()["audioBuffer"]["data"], json!(audio));
    }

    #[tokio::test]
    async fn test_reply_that_beats_the_deadline_wins() {
        let transport = Arc::new(MockTransport::silent());
        let bridge = bridge_with(&transport);
        let timeout = Duration::from_millis(50);

        let registration = bridge.pending.register("health_check", timeout);
        let correlation_id = registration.correlation_id;

        // The reply has claimed the entry but not yet handed over its outcome.
        let claimed = bridge.pending.remove(&correlation_id).unwrap();
        let handover = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            claimed.finish(Ok(json!({"status": "healthy"})));
        });

        let outcome = bridge
            .settle_expired("health_check", correlation_id, registration.receiver, timeout)
            .await;
        handover.await.unwrap();

        assert_eq!(outcome.unwrap(), json!({"status": "healthy"}));
        assert_eq!(bridge.stats().timed_out, 0);
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unencodable_payload_leaves_no_pending_call() {
        let transport = Arc::new(MockTransport::silent());
        let bridge = bridge_with(&transport);
        // JSON object keys must be strings
        let payload = std::collections::HashMap::from([(vec![1u8], 1u8)]);

        let err = bridge
            .request("transcribe_file", &payload, Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::Encode(_)));
        assert_eq!(bridge.pending_count(), 0);
        assert!(transport.published().is_empty());
    }

    #[test]
    fn test_second_dispatcher_is_refused() {
        let transport = Arc::new(MockTransport::silent());
        let _bridge = bridge_with(&transport);
        assert!(matches!(
            RpcBridge::new(transport.clone(), WORKER_QUEUE),
            Err(TransportError::AlreadySubscribed)
        ));
    }
}
