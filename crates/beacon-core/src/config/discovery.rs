use std::cmp::Ordering;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Discovery and liveness configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Store path under which discovery data lives.
    #[serde(default = "default_root")]
    pub root: String,

    /// Heartbeat interval in seconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Heartbeat age after which an instance counts as dead (in seconds).
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,

    /// Age after which an undecided voting round is abandoned (in seconds).
    #[serde(default = "default_voting_timeout")]
    pub voting_timeout_secs: u64,

    /// Leader tie-break rule.
    #[serde(default)]
    pub tie_break: TieBreak,

    /// Heartbeat records older than this are deleted (in seconds).
    #[serde(default = "default_record_retention")]
    pub record_retention_secs: u64,

    /// Minimum delay between topology events (in seconds). Unused when 0.
    #[serde(default)]
    pub min_event_delay_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            voting_timeout_secs: default_voting_timeout(),
            tie_break: TieBreak::default(),
            record_retention_secs: default_record_retention(),
            min_event_delay_secs: 0,
        }
    }
}

impl DiscoveryConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn voting_timeout(&self) -> Duration {
        Duration::from_secs(self.voting_timeout_secs)
    }

    pub fn record_retention(&self) -> Duration {
        Duration::from_secs(self.record_retention_secs)
    }
}

fn default_root() -> String {
    "/var/discovery/beacon".to_string()
}

fn default_heartbeat_interval() -> u64 {
    5
}

fn default_heartbeat_timeout() -> u64 {
    15
}

fn default_voting_timeout() -> u64 {
    60
}

fn default_record_retention() -> u64 {
    86_400
}

/// Rule deciding which candidate wins a leader vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TieBreak {
    /// Lowest id by string comparison.
    #[default]
    Lexicographic,
    /// Lowest id by numeric value; non-numeric ids sort after numeric
    /// ones and among themselves lexicographically.
    Numeric,
}

impl TieBreak {
    pub fn compare(&self, a: &str, b: &str) -> Ordering {
        match self {
            TieBreak::Lexicographic => a.cmp(b),
            TieBreak::Numeric => match (a.parse::<u128>(), b.parse::<u128>()) {
                (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
                (Ok(_), Err(_)) => Ordering::Less,
                (Err(_), Ok(_)) => Ordering::Greater,
                (Err(_), Err(_)) => a.cmp(b),
            },
        }
    }

    /// The winning candidate, if any.
    pub fn elect<'a, I>(&self, candidates: I) -> Option<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        candidates
            .into_iter()
            .min_by(|a, b| self.compare(a, b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_discovery_config() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(5));
        assert_eq!(config.heartbeat_timeout(), Duration::from_secs(15));
        assert_eq!(config.voting_timeout_secs, 60);
        assert_eq!(config.tie_break, TieBreak::Lexicographic);
    }

    #[test]
    fn test_lexicographic_election() {
        assert_eq!(TieBreak::Lexicographic.elect(["b", "a", "c"]), Some("a"));
        assert_eq!(TieBreak::Lexicographic.elect(["10", "9"]), Some("10"));
        assert_eq!(TieBreak::Lexicographic.elect(Vec::<&str>::new()), None);
    }

    #[test]
    fn test_numeric_election() {
        assert_eq!(TieBreak::Numeric.elect(["10", "9"]), Some("9"));
        assert_eq!(TieBreak::Numeric.elect(["b", "7", "a"]), Some("7"));
    }

    #[test]
    fn test_parse_discovery_config() {
        let toml = r#"
            heartbeat_interval_secs = 2
            tie_break = "numeric"
        "#;
        let config: DiscoveryConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.heartbeat_interval_secs, 2);
        assert_eq!(config.heartbeat_timeout_secs, 15);
        assert_eq!(config.tie_break, TieBreak::Numeric);
    }
}
