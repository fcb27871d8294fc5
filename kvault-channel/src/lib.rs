//! kvault Channel - In-Process Transport
//!
//! An origin-authenticated point-to-point channel between tenants and the
//! storage core, plus a one-to-many broadcast medium for change events.
//!
//! ```ignore
//! let hub = LocalHub::new("core", 256);
//! let link = hub.attach_core()?;
//! let conn = hub.connector(origin).connect("core", timeout).await?;
//! ```

pub mod connector;
pub mod hub;

pub use connector::{Connection, ConnectionEvents, Connector, FrameSender, LocalConnector};
pub use hub::{CoreLink, HubPublisher, Inbound, LocalHub, ReplySender};
