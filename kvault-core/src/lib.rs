//! kvault Core - Data Types and Wire Protocol
//!
//! Pure data structures shared by the storage core and the client proxies.
//! All other crates depend on this. Nothing here performs I/O.

pub mod clock;
pub mod error;
pub mod identity;
pub mod item;
pub mod protocol;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{
    AccessError, ClientError, ConfigError, ErrorKind, KvError, KvResult, Permission,
    StorageError, TransportError, ValidationError,
};
pub use identity::{new_session_id, Origin, RequestId, SessionId, Timestamp, WILDCARD};
pub use item::{
    has_permission, Acl, AclEntry, AclPatch, SetOptions, StorageItem, MAX_TTL_SECONDS,
};
pub use protocol::{
    decode, encode, peek_request_id, ChangeAction, ChangeEvent, Command, Request, Response,
    WireError,
};
