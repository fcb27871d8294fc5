//! Identity types for tenants, requests, and transport sessions

use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Per-proxy correlation id. Unique for the lifetime of one client proxy,
/// never persisted and meaningless to the storage core.
pub type RequestId = u64;

/// Identifier for a single transport session (one connected proxy).
/// UUIDv7 so sessions sort by connection time in logs.
pub type SessionId = Uuid;

/// Generate a new UUIDv7 SessionId.
pub fn new_session_id() -> SessionId {
    Uuid::now_v7()
}

/// The literal used on the wire for "every tenant".
pub const WILDCARD: &str = "*";

/// Tenant identity as attached by the transport.
///
/// An origin is opaque: the store never parses it beyond rejecting empty
/// strings and the wildcard literal, which has its own representation in
/// [`crate::AclEntry::Any`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Origin(String);

impl Origin {
    /// Parse and validate a tenant identity.
    pub fn parse(raw: impl Into<String>) -> Result<Self, ValidationError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "origin".to_string(),
            });
        }
        if trimmed == WILDCARD {
            return Err(ValidationError::InvalidValue {
                field: "origin".to_string(),
                reason: "the wildcard is not a tenant identity".to_string(),
            });
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Origin {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Origin> for String {
    fn from(origin: Origin) -> Self {
        origin.0
    }
}

impl AsRef<str> for Origin {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
