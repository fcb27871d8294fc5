//! Wire protocol between client proxies and the storage core.
//!
//! Every message is a JSON object. Requests are tagged by `action`,
//! responses carry `action: "response"`, and change events travel on the
//! broadcast medium as `{key, action}`.
//!
//! ```text
//! → {"action":"set","key":"profile","value":{"name":"x"},"options":{"ttlSeconds":60},"requestId":1}
//! ← {"action":"response","requestId":1,"value":null}
//! ⇉ {"key":"profile","action":"set"}
//! ```

use crate::error::{ErrorKind, KvError, TransportError};
use crate::identity::RequestId;
use crate::item::SetOptions;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// REQUESTS
// ============================================================================

/// The operation a client asks the storage core to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    Set {
        key: String,
        value: Value,
        #[serde(default)]
        options: SetOptions,
    },
    Get {
        key: String,
    },
    Remove {
        key: String,
    },
    Clear,
    Keys,
}

impl Command {
    /// Wire name of the action, for logging.
    pub fn action(&self) -> &'static str {
        match self {
            Command::Set { .. } => "set",
            Command::Get { .. } => "get",
            Command::Remove { .. } => "remove",
            Command::Clear => "clear",
            Command::Keys => "keys",
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            Command::Set { key, .. } | Command::Get { key } | Command::Remove { key } => Some(key),
            Command::Clear | Command::Keys => None,
        }
    }
}

/// A correlated command. The tenant is never part of the payload; the
/// transport attaches it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    #[serde(flatten)]
    pub command: Command,
    pub request_id: RequestId,
}

impl Request {
    pub fn new(request_id: RequestId, command: Command) -> Self {
        Self {
            command,
            request_id,
        }
    }
}

// ============================================================================
// RESPONSES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ResponseTag {
    Response,
}

/// Error as it crosses the wire: a stable kind plus a human message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&KvError> for WireError {
    fn from(err: &KvError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Reply to exactly one request. Exactly one of `value` / `error` is
/// meaningful; a successful reply with no value means "nothing" (void or
/// absent key).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    action: ResponseTag,
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Response {
    pub fn ok(request_id: RequestId, value: Option<Value>) -> Self {
        Self {
            action: ResponseTag::Response,
            request_id,
            value: Some(value.unwrap_or(Value::Null)),
            error: None,
        }
    }

    pub fn err(request_id: RequestId, error: &KvError) -> Self {
        Self {
            action: ResponseTag::Response,
            request_id,
            value: None,
            error: Some(WireError::from(error)),
        }
    }

    /// Split into the success payload or the relayed error. A JSON `null`
    /// payload becomes `None`.
    pub fn into_result(self) -> Result<Option<Value>, WireError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.value.filter(|v| !v.is_null())),
        }
    }
}

// ============================================================================
// CHANGE EVENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Set,
    Remove,
}

/// Mutation notice used purely for cache invalidation. Carries no value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub key: String,
    pub action: ChangeAction,
}

impl ChangeEvent {
    pub fn set(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            action: ChangeAction::Set,
        }
    }

    pub fn remove(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            action: ChangeAction::Remove,
        }
    }
}

// ============================================================================
// FRAME CODEC
// ============================================================================

/// Encode any protocol message as a JSON text frame.
pub fn encode<T: Serialize>(message: &T) -> Result<String, TransportError> {
    serde_json::to_string(message).map_err(|e| TransportError::Malformed {
        reason: e.to_string(),
    })
}

/// Decode a JSON text frame into a protocol message.
pub fn decode<T: DeserializeOwned>(frame: &str) -> Result<T, TransportError> {
    serde_json::from_str(frame).map_err(|e| TransportError::Malformed {
        reason: e.to_string(),
    })
}

/// Best-effort extraction of `requestId` from a frame that failed to decode,
/// so the sender's pending call can still be rejected.
pub fn peek_request_id(frame: &str) -> Option<RequestId> {
    serde_json::from_str::<Value>(frame)
        .ok()?
        .get("requestId")?
        .as_u64()
}
