use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Topology connector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Outbound connector endpoints.
    #[serde(default)]
    pub urls: Vec<String>,

    /// Lifetime of announcements we send (in seconds).
    #[serde(default = "default_announcement_ttl")]
    pub announcement_ttl_secs: u64,

    /// Upper bound for the per-connector backoff (in seconds).
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,

    /// Backoff interval suggested to peers pinging us (in seconds).
    #[serde(default)]
    pub server_backoff_secs: u64,

    /// Timeout for a single ping request (in seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Stop pinging connectors that loop back to this instance.
    #[serde(default = "default_true")]
    pub auto_stop_local_loops: bool,

    /// Address for the inbound connector endpoint.
    pub listen: Option<String>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            announcement_ttl_secs: default_announcement_ttl(),
            backoff_max_secs: default_backoff_max(),
            server_backoff_secs: 0,
            request_timeout_secs: default_request_timeout(),
            auto_stop_local_loops: true,
            listen: None,
        }
    }
}

impl ConnectorConfig {
    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_announcement_ttl() -> u64 {
    30
}

fn default_backoff_max() -> u64 {
    300
}

fn default_request_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}
