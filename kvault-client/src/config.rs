//! Client proxy configuration.

use kvault_core::{ConfigError, Origin, SetOptions};
use serde::{Deserialize, Serialize};

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// The tenant this proxy acts for. Must match the connector's origin.
    pub origin: Origin,

    /// Transport endpoint of the storage core.
    pub endpoint: String,

    /// Merged under the caller's options on every `set_item`.
    #[serde(default)]
    pub default_options: SetOptions,

    /// How long to wait for the core to become reachable.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-request deadline. Absent means requests wait until answered or
    /// until the transport fails.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

impl ClientConfig {
    pub fn new(origin: Origin, endpoint: impl Into<String>) -> Self {
        Self {
            origin,
            endpoint: endpoint.into(),
            default_options: SetOptions::default(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            request_timeout_ms: None,
        }
    }

    pub fn with_default_options(mut self, options: SetOptions) -> Self {
        self.default_options = options;
        self
    }

    pub fn with_connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    pub fn with_request_timeout_ms(mut self, ms: u64) -> Self {
        self.request_timeout_ms = Some(ms);
        self
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "endpoint".to_string(),
            });
        }

        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "connect_timeout_ms".to_string(),
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        if self.request_timeout_ms == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout_ms".to_string(),
                value: "0".to_string(),
                reason: "must be greater than zero when set".to_string(),
            });
        }

        self.default_options
            .validate()
            .map_err(|e| ConfigError::InvalidValue {
                field: "default_options".to_string(),
                value: format!("{:?}", self.default_options),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let config = ClientConfig::from_toml_str(
            r#"
            origin = "https://a"
            endpoint = "core"
            "#,
        )
        .expect("config should parse");

        assert_eq!(config.origin.as_str(), "https://a");
        assert_eq!(config.connect_timeout_ms, DEFAULT_CONNECT_TIMEOUT_MS);
        assert_eq!(config.request_timeout_ms, None);
    }

    #[test]
    fn test_parse_default_options() {
        let config = ClientConfig::from_toml_str(
            r#"
            origin = "https://a"
            endpoint = "core"
            request_timeout_ms = 500

            [default_options]
            ttlSeconds = 60.0

            [default_options.acl]
            read = ["https://a", "https://b"]
            "#,
        )
        .expect("config should parse");

        assert_eq!(config.default_options.ttl_seconds, Some(60.0));
        let acl = config.default_options.acl.expect("acl should be set");
        assert_eq!(acl.read.map(|r| r.len()), Some(2));
        assert_eq!(config.request_timeout_ms, Some(500));
    }

    #[test]
    fn test_wildcard_origin_rejected() {
        let err = ClientConfig::from_toml_str("origin = \"*\"\nendpoint = \"core\"")
            .expect_err("wildcard is not a tenant");
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_validate() {
        let origin = Origin::parse("https://a").expect("origin should parse");
        assert!(ClientConfig::new(origin.clone(), "core").validate().is_ok());
        assert!(ClientConfig::new(origin.clone(), " ").validate().is_err());
        assert!(ClientConfig::new(origin.clone(), "core")
            .with_request_timeout_ms(0)
            .validate()
            .is_err());
        assert!(ClientConfig::new(origin, "core")
            .with_default_options(SetOptions::default().with_ttl_seconds(-1.0))
            .validate()
            .is_err());
    }
}
