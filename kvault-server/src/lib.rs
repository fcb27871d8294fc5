//! kvault Server - The Storage Core Process
//!
//! Wires a configured durable store into a [`StorageCore`], attaches it to a
//! transport hub, and serves requests until shut down.

pub mod config;
pub mod service;
pub mod telemetry;

use std::sync::Arc;

use kvault_channel::LocalHub;
use kvault_core::{ConfigError, KvResult};
use kvault_storage::StorageCore;
use tracing::info;

pub use config::{LogFormat, ServerConfig, StoreConfig};
pub use service::{handle_frame, CoreService, ServerHandle};
pub use telemetry::init_tracing;

/// Open the configured store, attach to `hub`, and start serving.
///
/// Must be called from within a tokio runtime.
pub fn start(config: &ServerConfig, hub: &LocalHub) -> KvResult<ServerHandle> {
    config.validate()?;
    if config.endpoint != hub.endpoint() {
        return Err(ConfigError::InvalidValue {
            field: "endpoint".to_string(),
            value: config.endpoint.clone(),
            reason: format!("hub serves '{}'", hub.endpoint()),
        }
        .into());
    }

    let store = config.open_store()?;
    let link = hub.attach_core()?;
    let core = StorageCore::new(store, Arc::new(link.publisher()));

    info!(endpoint = %hub.endpoint(), store = ?config.store, "Starting storage core");
    Ok(CoreService::new(Arc::new(core), link).spawn())
}
