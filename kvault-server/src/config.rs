//! Storage core configuration.
//!
//! Loaded from a TOML file (path in `KVAULT_CONFIG`) when one is given,
//! otherwise from defaults, then overridden field by field from `KVAULT_*`
//! environment variables and validated.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kvault_channel::LocalHub;
use kvault_core::{ConfigError, KvResult};
use kvault_storage::{DurableStore, LmdbStore, MemoryStore};
use serde::{Deserialize, Serialize};

const DEFAULT_ENDPOINT: &str = "kvault-core";
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;
const DEFAULT_LMDB_MAX_SIZE_MB: usize = 256;

// ============================================================================
// SERVER CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServerConfig {
    /// Transport endpoint name the core listens on.
    pub endpoint: String,

    /// Broadcast medium capacity. Subscribers further behind than this
    /// observe a lag and drop their caches.
    pub channel_capacity: usize,

    pub store: StoreConfig,

    pub log_format: LogFormat,
}

/// Durable store backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    Memory,
    Lmdb {
        path: PathBuf,
        #[serde(default = "default_lmdb_max_size_mb")]
        max_size_mb: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

fn default_lmdb_max_size_mb() -> usize {
    DEFAULT_LMDB_MAX_SIZE_MB
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            store: StoreConfig::Memory,
            log_format: LogFormat::Plain,
        }
    }
}

impl ServerConfig {
    /// Load from `KVAULT_CONFIG` (if set), apply environment overrides, and
    /// validate.
    pub fn load() -> Result<Self, ConfigError> {
        let base = match std::env::var("KVAULT_CONFIG") {
            Ok(path) => Self::from_path(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        let config = base.with_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            reason: format!("{}: {}", path.display(), e),
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    /// Apply `KVAULT_*` overrides looked up through `lookup`.
    ///
    /// Variables:
    /// - `KVAULT_ENDPOINT`
    /// - `KVAULT_CHANNEL_CAPACITY`
    /// - `KVAULT_STORE`: "memory" or "lmdb"
    /// - `KVAULT_LMDB_PATH` (required when the store is lmdb)
    /// - `KVAULT_LMDB_MAX_SIZE_MB`
    /// - `KVAULT_LOG_FORMAT`: "plain" or "json"
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoint) = lookup("KVAULT_ENDPOINT") {
            self.endpoint = endpoint;
        }

        if let Some(raw) = lookup("KVAULT_CHANNEL_CAPACITY") {
            self.channel_capacity = parse_number("KVAULT_CHANNEL_CAPACITY", &raw)?;
        }

        let lmdb_path = lookup("KVAULT_LMDB_PATH").map(PathBuf::from);
        let lmdb_size = lookup("KVAULT_LMDB_MAX_SIZE_MB")
            .map(|raw| parse_number("KVAULT_LMDB_MAX_SIZE_MB", &raw))
            .transpose()?;

        match lookup("KVAULT_STORE").as_deref() {
            Some("memory") => self.store = StoreConfig::Memory,
            Some("lmdb") => {
                let (current_path, current_size) = match &self.store {
                    StoreConfig::Lmdb { path, max_size_mb } => (Some(path.clone()), *max_size_mb),
                    StoreConfig::Memory => (None, DEFAULT_LMDB_MAX_SIZE_MB),
                };
                let path = lmdb_path.clone().or(current_path).ok_or_else(|| {
                    ConfigError::MissingRequired {
                        field: "KVAULT_LMDB_PATH".to_string(),
                    }
                })?;
                self.store = StoreConfig::Lmdb {
                    path,
                    max_size_mb: lmdb_size.unwrap_or(current_size),
                };
            }
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    field: "KVAULT_STORE".to_string(),
                    value: other.to_string(),
                    reason: "expected 'memory' or 'lmdb'".to_string(),
                })
            }
            None => {
                if let StoreConfig::Lmdb { path, max_size_mb } = &mut self.store {
                    if let Some(p) = lmdb_path {
                        *path = p;
                    }
                    if let Some(size) = lmdb_size {
                        *max_size_mb = size;
                    }
                }
            }
        }

        match lookup("KVAULT_LOG_FORMAT").as_deref() {
            Some("plain") => self.log_format = LogFormat::Plain,
            Some("json") => self.log_format = LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    field: "KVAULT_LOG_FORMAT".to_string(),
                    value: other.to_string(),
                    reason: "expected 'plain' or 'json'".to_string(),
                })
            }
            None => {}
        }

        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "endpoint".to_string(),
            });
        }

        if self.channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "channel_capacity".to_string(),
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        if let StoreConfig::Lmdb { path, max_size_mb } = &self.store {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: "store.path".to_string(),
                });
            }
            if *max_size_mb == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "store.max_size_mb".to_string(),
                    value: "0".to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        Ok(())
    }

    /// A hub named after this config's endpoint.
    pub fn hub(&self) -> LocalHub {
        LocalHub::new(self.endpoint.clone(), self.channel_capacity)
    }

    /// Open the configured durable store.
    pub fn open_store(&self) -> KvResult<Arc<dyn DurableStore>> {
        match &self.store {
            StoreConfig::Memory => Ok(Arc::new(MemoryStore::new())),
            StoreConfig::Lmdb { path, max_size_mb } => {
                Ok(Arc::new(LmdbStore::open(path, *max_size_mb)?))
            }
        }
    }
}

fn parse_number(field: &str, raw: &str) -> Result<usize, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        value: raw.to_string(),
        reason: "expected a non-negative integer".to_string(),
    })
}
