//! # Broker Envelopes
//!
//! The structured message units exchanged with the transcription worker.
//!
//! ## Wire Format:
//! Commands are published as JSON in the shape the worker already consumes:
//! ```json
//! { "pattern": "transcribe_file", "data": { ... }, "id": "6f1c...-uuid" }
//! ```
//! Replies carry the correlation id as an AMQP message property and a free-form JSON
//! body. A body with `"status": "error"` (or a non-null `err`) is a failure reported by
//! the worker; anything else is the result, passed through verbatim.

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::io;
use uuid::Uuid;

/// A command sent to the worker, already encoded to its wire body.
///
/// The payload is serialized exactly once, straight into a buffer sized for it, so a
/// large audio upload costs its encoded size and nothing more. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandEnvelope {
    pub command: String,
    pub correlation_id: Uuid,
    body: Vec<u8>,
}

#[derive(Serialize)]
struct WireCommand<'a, P> {
    pattern: &'a str,
    data: &'a P,
    id: Uuid,
}

impl CommandEnvelope {
    pub fn encode<P: Serialize>(
        command: &str,
        correlation_id: Uuid,
        payload: &P,
    ) -> Result<Self, serde_json::Error> {
        let wire = WireCommand {
            pattern: command,
            data: payload,
            id: correlation_id,
        };

        let mut counter = ByteCounter(0);
        serde_json::to_writer(&mut counter, &wire)?;
        let mut body = Vec::with_capacity(counter.0);
        serde_json::to_writer(&mut body, &wire)?;

        Ok(Self {
            command: command.to_string(),
            correlation_id,
            body,
        })
    }

    /// JSON body published to the broker.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The `data` member decoded back into a tree, for assertions on small payloads.
    #[cfg(test)]
    pub fn payload(&self) -> Value {
        let mut wire: Value = serde_json::from_slice(&self.body).unwrap();
        wire["data"].take()
    }
}

/// Sink that only measures how long the encoded output will be.
struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Failure description reported by the worker.
///
/// Only `message` is guaranteed; `details` carries the worker's full reply body
/// so richer error fields reach the HTTP caller untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorDescriptor {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }
}

/// Outcome carried by a reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyBody {
    Success(Value),
    Error(ErrorDescriptor),
}

/// A reply from the worker, keyed by the correlation id of the command it answers.
///
/// The id is kept as the raw string received from the broker. Parsing happens at
/// dispatch time so that forged or garbled ids are discarded rather than rejected
/// by the consumer loop.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyEnvelope {
    pub correlation_id: String,
    pub body: ReplyBody,
}

impl ReplyEnvelope {
    #[cfg(test)]
    pub fn success(correlation_id: impl Into<String>, body: Value) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            body: ReplyBody::Success(body),
        }
    }

    #[cfg(test)]
    pub fn error(correlation_id: impl Into<String>, error: ErrorDescriptor) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            body: ReplyBody::Error(error),
        }
    }

    /// Decode a raw broker delivery.
    ///
    /// `property_id` is the AMQP `correlation_id` property; when the worker omits it
    /// the top-level `id` field of the body is used instead. Returns `None` when no
    /// correlation id can be found at all, since such a reply cannot match any call.
    pub fn decode(property_id: Option<&str>, data: &[u8]) -> Option<Self> {
        let parsed: Option<Value> = serde_json::from_slice(data).ok();

        let correlation_id = property_id
            .map(str::to_string)
            .or_else(|| {
                parsed
                    .as_ref()
                    .and_then(|v| v.get("id"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })?;

        let body = match parsed {
            Some(value) => classify(value),
            None => ReplyBody::Error(ErrorDescriptor::new("malformed reply from worker")),
        };

        Some(Self {
            correlation_id,
            body,
        })
    }
}

fn classify(value: Value) -> ReplyBody {
    let is_error_status = value.get("status").and_then(Value::as_str) == Some("error");
    let err_field = value.get("err").filter(|err| !err.is_null()).cloned();

    if !is_error_status && err_field.is_none() {
        return ReplyBody::Success(value);
    }

    let message = value
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| match &err_field {
            Some(Value::String(msg)) => Some(msg.clone()),
            Some(err) => err.get("message").and_then(Value::as_str).map(str::to_string),
            None => None,
        })
        .unwrap_or_else(|| "worker reported an error".to_string());

    ReplyBody::Error(ErrorDescriptor {
        message,
        details: Some(value),
    })
}

/// Raw audio bytes as carried inside a command payload.
///
/// Serialized in the byte-array form the worker decodes:
/// `{"type": "Buffer", "data": [82, 73, 70, 70, ...]}`
#[derive(Debug, Clone, PartialEq)]
pub struct AudioPayload(pub Vec<u8>);

impl Serialize for AudioPayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Buffer", 2)?;
        state.serialize_field("type", "Buffer")?;
        state.serialize_field("data", &self.0)?;
        state.end()
    }
}
