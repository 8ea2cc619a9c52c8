mod connector;
mod discovery;
mod jobs;
mod observability;
mod store;

pub use connector::ConnectorConfig;
pub use discovery::{DiscoveryConfig, TieBreak};
pub use jobs::JobsConfig;
pub use observability::LoggingConfig;
pub use store::{StoreBackend, StoreConfig};

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cluster::MAX_TTL_SECS;
use crate::error::{BeaconError, Result};

/// Upper bound for connector backoff settings (one day).
pub const MAX_BACKOFF_SECS: u64 = 86_400;

/// Root configuration for a Beacon instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BeaconConfig {
    /// Identity of this instance.
    #[serde(default)]
    pub instance: InstanceConfig,

    /// Heartbeat, voting and view settings.
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Topology connector settings.
    #[serde(default)]
    pub connector: ConnectorConfig,

    /// Job distribution settings.
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Backing store.
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BeaconConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| BeaconError::Config(format!("Failed to read config file: {}", e)))?;

        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_toml(content: &str) -> Result<Self> {
        let content = substitute_env_vars(content);

        let config: Self = toml::from_str(&content)
            .map_err(|e| BeaconError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the discovery algorithms cannot work with.
    pub fn validate(&self) -> Result<()> {
        let d = &self.discovery;
        if d.heartbeat_interval_secs == 0 {
            return Err(BeaconError::Config(
                "discovery.heartbeat_interval_secs must be positive".into(),
            ));
        }
        if d.heartbeat_timeout_secs <= d.heartbeat_interval_secs {
            return Err(BeaconError::Config(
                "discovery.heartbeat_timeout_secs must exceed the heartbeat interval".into(),
            ));
        }
        if self.jobs.maintenance_interval_secs == 0 {
            return Err(BeaconError::Config(
                "jobs.maintenance_interval_secs must be positive".into(),
            ));
        }
        let c = &self.connector;
        if c.announcement_ttl_secs == 0 || c.announcement_ttl_secs > MAX_TTL_SECS {
            return Err(BeaconError::Config(format!(
                "connector.announcement_ttl_secs must be between 1 and {}",
                MAX_TTL_SECS
            )));
        }
        if c.backoff_max_secs > MAX_BACKOFF_SECS || c.server_backoff_secs > MAX_BACKOFF_SECS {
            return Err(BeaconError::Config(format!(
                "connector backoff settings must not exceed {} seconds",
                MAX_BACKOFF_SECS
            )));
        }
        if !d.root.starts_with('/') || !self.jobs.root.starts_with('/') {
            return Err(BeaconError::Config(
                "discovery.root and jobs.root must be absolute paths".into(),
            ));
        }
        if self.store.backend == StoreBackend::Postgres && self.store.url.is_empty() {
            return Err(BeaconError::Config(
                "store.url is required for the postgres backend".into(),
            ));
        }
        Ok(())
    }
}

/// Identity and metadata of this instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Stable instance id; generated at startup when absent.
    pub sling_id: Option<String>,

    /// Endpoints advertised in the heartbeat record.
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Custom instance properties.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Substitute environment variables in the format ${VAR_NAME}.
fn substitute_env_vars(content: &str) -> String {
    let Ok(re) = regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}") else {
        return content.to_string();
    };

    let mut result = content.to_string();
    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}
