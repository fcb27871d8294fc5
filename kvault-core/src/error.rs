//! Error types for kvault operations

use crate::identity::{Origin, RequestId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Which ACL list an operation was checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Read => f.write_str("read"),
            Permission::Write => f.write_str("write"),
        }
    }
}

/// Access-control failures raised by the storage core.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AccessError {
    #[error("Permission denied: tenant {tenant} lacks {permission} permission on key '{key}'")]
    PermissionDenied {
        tenant: Origin,
        key: String,
        permission: Permission,
    },
}

/// Durable store faults.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage backend failure during {operation}: {reason}")]
    Backend { operation: String, reason: String },

    #[error("Record serialization failed for key '{key}': {reason}")]
    Serialization { key: String, reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Transport channel failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport setup failed for endpoint '{endpoint}': {reason}")]
    SetupFailed { endpoint: String, reason: String },

    #[error("Transport channel closed")]
    Closed,

    #[error("Malformed frame: {reason}")]
    Malformed { reason: String },

    #[error("A storage core is already attached to endpoint '{endpoint}'")]
    CoreAlreadyAttached { endpoint: String },
}

/// Failures observed by a client proxy while a request is outstanding.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("Storage core unavailable: {}", describe_cause(.cause))]
    CoreUnavailable { cause: Option<TransportError> },

    #[error("Request {request_id} timed out after {after:?}")]
    Timeout { request_id: RequestId, after: Duration },

    #[error("Rejected by storage core ({kind}): {message}")]
    Rejected { kind: ErrorKind, message: String },
}

fn describe_cause(cause: &Option<TransportError>) -> String {
    match cause {
        Some(cause) => cause.to_string(),
        None => "connection lost".to_string(),
    }
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to read config file: {reason}")]
    Io { reason: String },

    #[error("Failed to parse config: {reason}")]
    Parse { reason: String },
}

/// Master error type for all kvault errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    #[error("Access error: {0}")]
    Access(#[from] AccessError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for kvault operations.
pub type KvResult<T> = Result<T, KvError>;

// ============================================================================
// ERROR KINDS
// ============================================================================

/// Stable error categories shared by both ends of the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    PermissionDenied,
    CoreUnavailable,
    TransportSetupError,
    StorageBackendError,
    Timeout,
    InvalidRequest,
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::CoreUnavailable => "CoreUnavailable",
            ErrorKind::TransportSetupError => "TransportSetupError",
            ErrorKind::StorageBackendError => "StorageBackendError",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::InvalidRequest => "InvalidRequest",
            ErrorKind::Config => "Config",
        };
        f.write_str(name)
    }
}

impl KvError {
    /// Categorize this error. A rejection relayed from the storage core
    /// reports the kind the core assigned.
    pub fn kind(&self) -> ErrorKind {
        match self {
            KvError::Access(_) => ErrorKind::PermissionDenied,
            KvError::Storage(_) => ErrorKind::StorageBackendError,
            KvError::Transport(TransportError::SetupFailed { .. })
            | KvError::Transport(TransportError::CoreAlreadyAttached { .. }) => {
                ErrorKind::TransportSetupError
            }
            KvError::Transport(TransportError::Closed) => ErrorKind::CoreUnavailable,
            KvError::Transport(TransportError::Malformed { .. }) => ErrorKind::InvalidRequest,
            KvError::Client(ClientError::CoreUnavailable { .. }) => ErrorKind::CoreUnavailable,
            KvError::Client(ClientError::Timeout { .. }) => ErrorKind::Timeout,
            KvError::Client(ClientError::Rejected { kind, .. }) => *kind,
            KvError::Validation(_) => ErrorKind::InvalidRequest,
            KvError::Config(_) => ErrorKind::Config,
        }
    }

    /// Shorthand used by the storage core when an ACL check fails.
    pub fn permission_denied(tenant: &Origin, key: &str, permission: Permission) -> Self {
        AccessError::PermissionDenied {
            tenant: tenant.clone(),
            key: key.to_string(),
            permission,
        }
        .into()
    }

    /// Wrap a durable store fault.
    pub fn backend(operation: &str, reason: impl fmt::Display) -> Self {
        StorageError::Backend {
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
        .into()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn origin(raw: &str) -> Origin {
        Origin::parse(raw).expect("origin should parse")
    }

    #[test]
    fn test_permission_denied_names_tenant_key_and_permission() {
        let err = KvError::permission_denied(&origin("https://b"), "profile", Permission::Write);
        let msg = err.to_string();
        assert!(msg.contains("https://b"));
        assert!(msg.contains("profile"));
        assert!(msg.contains("write"));
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_backend_error_kind() {
        let err = KvError::backend("put", "disk full");
        assert_eq!(err.kind(), ErrorKind::StorageBackendError);
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_core_unavailable_carries_setup_cause() {
        let err = KvError::from(ClientError::CoreUnavailable {
            cause: Some(TransportError::SetupFailed {
                endpoint: "core".to_string(),
                reason: "no core attached".to_string(),
            }),
        });
        assert_eq!(err.kind(), ErrorKind::CoreUnavailable);
        assert!(err.to_string().contains("no core attached"));

        let lost = ClientError::CoreUnavailable { cause: None };
        assert!(lost.to_string().contains("connection lost"));
    }

    #[test]
    fn test_rejected_reports_remote_kind() {
        let err = KvError::from(ClientError::Rejected {
            kind: ErrorKind::PermissionDenied,
            message: "nope".to_string(),
        });
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_kv_error_from_variants() {
        let storage = KvError::from(StorageError::LockPoisoned);
        assert!(matches!(storage, KvError::Storage(_)));

        let transport = KvError::from(TransportError::Closed);
        assert_eq!(transport.kind(), ErrorKind::CoreUnavailable);

        let config = KvError::from(ConfigError::MissingRequired {
            field: "endpoint".to_string(),
        });
        assert_eq!(config.kind(), ErrorKind::Config);

        let timeout = KvError::from(ClientError::Timeout {
            request_id: 7,
            after: Duration::from_millis(250),
        });
        assert_eq!(timeout.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_error_kind_serde_names() {
        let json = serde_json::to_string(&ErrorKind::StorageBackendError)
            .expect("serialize should succeed");
        assert_eq!(json, "\"StorageBackendError\"");
    }
}
