use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::job::QueueConfiguration;
use crate::store::child_path;

/// Job distribution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Store path of the job resource tree.
    #[serde(default = "default_root")]
    pub root: String,

    /// Topics this instance consumes.
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,

    /// Interval of the periodic maintenance pass (in seconds).
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,

    /// Maintenance passes between empty folder cleanups.
    #[serde(default = "default_cleanup_every")]
    pub cleanup_every: u64,

    /// Legacy job roots migrated on startup. Defaults to
    /// `<root>/anon` and `<root>/identified`.
    #[serde(default)]
    pub legacy_roots: Option<Vec<String>>,

    /// Configured queues.
    #[serde(default)]
    pub queues: Vec<QueueConfiguration>,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            topics: default_topics(),
            maintenance_interval_secs: default_maintenance_interval(),
            cleanup_every: default_cleanup_every(),
            legacy_roots: None,
            queues: Vec::new(),
        }
    }
}

impl JobsConfig {
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn legacy_roots(&self) -> Vec<String> {
        match &self.legacy_roots {
            Some(roots) => roots.clone(),
            None => vec![
                child_path(&self.root, "anon"),
                child_path(&self.root, "identified"),
            ],
        }
    }

    /// Value of the job topics instance property.
    pub fn topics_property(&self) -> String {
        self.topics.join(",")
    }
}

fn default_root() -> String {
    "/var/beacon/jobs".to_string()
}

fn default_topics() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_maintenance_interval() -> u64 {
    60
}

fn default_cleanup_every() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::QueueType;

    #[test]
    fn test_jobs_config_default() {
        let config = JobsConfig::default();
        assert_eq!(config.topics_property(), "*");
        assert_eq!(
            config.legacy_roots(),
            vec!["/var/beacon/jobs/anon", "/var/beacon/jobs/identified"]
        );
    }

    #[test]
    fn test_parse_queues() {
        let toml = r#"
            root = "/jobs"
            topics = ["a/*", "b"]

            [[queues]]
            name = "ordered"
            topics = ["a/x"]
            type = "ordered"

            [[queues]]
            name = "trash"
            topics = ["trash/**"]
            type = "drop"
        "#;
        let config: JobsConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.topics_property(), "a/*,b");
        assert_eq!(config.queues.len(), 2);
        assert_eq!(config.queues[1].queue_type, QueueType::Drop);
    }
}
