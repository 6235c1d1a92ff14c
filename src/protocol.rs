//! Wire messages exchanged between client proxies and the server.
//!
//! Three message kinds share one connection:
//!
//! - [`Request`]: client → server, carries a fresh [`RequestId`].
//! - [`Reply`]: server → client, tagged with the id of the request it answers.
//!   Exactly one per non-oneway request, none for oneway requests.
//! - [`EventNotification`]: server → client, carries no correlation id.
//!
//! Encoding is delegated to a [`Codec`]; [`JsonCodec`] is the default.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use bytes::Bytes;

use crate::error::{ErrorDescriptor, RemoteError, RemoteResult};

/// Correlation key matching a [`Reply`] to its [`Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    /// Fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// What a request asks the target thing to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum Operation {
    ReadProperty { name: String },
    WriteProperty { name: String, value: Value },
    ReadMultiple { names: Vec<String> },
    WriteMultiple { values: BTreeMap<String, Value> },
    InvokeAction {
        name: String,
        #[serde(default)]
        arguments: Value,
    },
    SubscribeEvent { name: String },
    UnsubscribeEvent { name: String },
    Describe,
}

impl Operation {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::ReadProperty { .. } => "read_property",
            Operation::WriteProperty { .. } => "write_property",
            Operation::ReadMultiple { .. } => "read_multiple",
            Operation::WriteMultiple { .. } => "write_multiple",
            Operation::InvokeAction { .. } => "invoke_action",
            Operation::SubscribeEvent { .. } => "subscribe_event",
            Operation::UnsubscribeEvent { .. } => "unsubscribe_event",
            Operation::Describe => "describe",
        }
    }

    /// Property, action or event name the operation targets, if any.
    pub fn target(&self) -> Option<&str> {
        match self {
            Operation::ReadProperty { name }
            | Operation::WriteProperty { name, .. }
            | Operation::InvokeAction { name, .. }
            | Operation::SubscribeEvent { name }
            | Operation::UnsubscribeEvent { name } => Some(name),
            _ => None,
        }
    }

    /// Whether the result is the whole point of the operation.
    ///
    /// Such operations cannot be sent oneway.
    pub fn requires_reply(&self) -> bool {
        matches!(
            self,
            Operation::ReadProperty { .. } | Operation::ReadMultiple { .. } | Operation::Describe
        )
    }
}

/// Client → server request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id
    pub id: RequestId,
    /// Target thing
    pub thing_id: String,
    /// What to do
    pub operation: Operation,
    /// Do not reply
    #[serde(default)]
    pub oneway: bool,
    /// Budget for acquiring the thing before executing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_timeout_ms: Option<u64>,
    /// Budget for the handler itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_timeout_ms: Option<u64>,
}

impl Request {
    /// Blocking request with no server-side timeouts.
    pub fn new(thing_id: impl Into<String>, operation: Operation) -> Self {
        Self {
            id: RequestId::new(),
            thing_id: thing_id.into(),
            operation,
            oneway: false,
            invocation_timeout_ms: None,
            execution_timeout_ms: None,
        }
    }

    /// Lock acquisition budget as a `Duration`.
    pub fn invocation_timeout(&self) -> Option<Duration> {
        self.invocation_timeout_ms.map(Duration::from_millis)
    }

    /// Handler budget as a `Duration`.
    pub fn execution_timeout(&self) -> Option<Duration> {
        self.execution_timeout_ms.map(Duration::from_millis)
    }
}

/// Success payload or structured error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum Outcome {
    Ok(Value),
    Err(ErrorDescriptor),
}

/// Server → client answer to one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Id of the request being answered
    pub id: RequestId,
    /// Result
    pub outcome: Outcome,
}

impl Reply {
    /// Build a reply from an execution result.
    pub fn from_result(id: RequestId, result: RemoteResult<Value>) -> Self {
        let outcome = match result {
            Ok(value) => Outcome::Ok(value),
            Err(e) => Outcome::Err(e.to_descriptor()),
        };
        Self { id, outcome }
    }

    /// Whether the request succeeded.
    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, Outcome::Ok(_))
    }

    /// Turn the reply back into a result, rebuilding the server's error.
    pub fn into_result(self) -> RemoteResult<Value> {
        match self.outcome {
            Outcome::Ok(value) => Ok(value),
            Outcome::Err(descriptor) => Err(RemoteError::from_descriptor(descriptor)),
        }
    }
}

/// Server → client event delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventNotification {
    /// Publishing thing
    pub thing_id: String,
    /// Canonical event name
    pub event: String,
    /// Event payload
    pub payload: Value,
}

/// Any frame on a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum Message {
    Request(Request),
    Reply(Reply),
    Event(EventNotification),
}

// =============================================================================
// Codec
// =============================================================================

/// Converts messages to and from frames.
pub trait Codec: Send + Sync + 'static {
    /// Codec name for logs
    fn name(&self) -> &'static str;

    /// Serialize one message into a frame.
    fn encode(&self, message: &Message) -> RemoteResult<Bytes>;

    /// Parse one frame. Malformed input is a `Protocol` error.
    fn decode(&self, frame: &[u8]) -> RemoteResult<Message>;
}

/// UTF-8 JSON frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, message: &Message) -> RemoteResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(message)?))
    }

    fn decode(&self, frame: &[u8]) -> RemoteResult<Message> {
        Ok(serde_json::from_slice(frame)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let mut request = Request::new(
            "energy-meter",
            Operation::InvokeAction {
                name: "measure".into(),
                arguments: json!([10]),
            },
        );
        request.oneway = true;
        let value = serde_json::to_value(Message::Request(request.clone())).unwrap();
        assert_eq!(value["type"], "request");
        assert_eq!(value["operation"]["op"], "invoke_action");
        assert_eq!(value["oneway"], true);
        assert!(value.get("execution_timeout_ms").is_none());

        let decoded = JsonCodec.decode(&JsonCodec.encode(&Message::Request(request.clone())).unwrap());
        assert_eq!(decoded.unwrap(), Message::Request(request));
    }

    #[test]
    fn test_reply_carries_error_kind() {
        let id = RequestId::new();
        let reply = Reply::from_result(id, Err(RemoteError::State("not in ON".into())));
        assert!(!reply.is_ok());
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["outcome"]["err"]["kind"], "state");

        let err = reply.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
    }

    #[test]
    fn test_decode_garbage_is_protocol_error() {
        let err = JsonCodec.decode(b"{not json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_reads_require_reply() {
        assert!(Operation::ReadProperty { name: "x".into() }.requires_reply());
        assert!(Operation::Describe.requires_reply());
        assert!(!Operation::WriteMultiple {
            values: BTreeMap::new()
        }
        .requires_reply());
    }

    #[test]
    fn test_missing_arguments_default_to_null() {
        let op: Operation = serde_json::from_value(json!({"op": "invoke_action", "name": "connect"})).unwrap();
        assert_eq!(
            op,
            Operation::InvokeAction {
                name: "connect".into(),
                arguments: Value::Null
            }
        );
    }
}
