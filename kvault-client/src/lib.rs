//! kvault Client - Per-Tenant Proxy
//!
//! [`ClientProxy`] turns application calls into correlated requests to the
//! storage core, queues them while the core is still coming up, and keeps a
//! read cache that every change broadcast invalidates.
//!
//! ```ignore
//! let config = ClientConfig::new(Origin::parse("https://a")?, "kvault-core");
//! let proxy = ClientProxy::for_hub(&hub, config)?;
//! proxy.set_item("profile", json!({"name": "x"})).await?;
//! ```

pub mod cache;
pub mod config;
pub mod pending;
pub mod proxy;

pub use cache::CacheStats;
pub use config::ClientConfig;
pub use proxy::{ClientProxy, ConnectionState};
