use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BeaconError;

/// Name of the queue used when no configured queue matches a topic.
pub const MAIN_QUEUE_NAME: &str = "<main queue>";

/// How a queue treats its jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    /// Jobs run one after another on a single instance.
    Ordered,
    /// Jobs run in parallel on any eligible instance.
    #[default]
    Unordered,
    /// Like unordered, distributing by topic across instances.
    TopicRoundRobin,
    /// Jobs are left untouched and never assigned.
    Ignore,
    /// Jobs are deleted.
    Drop,
}

impl QueueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ordered => "ordered",
            Self::Unordered => "unordered",
            Self::TopicRoundRobin => "topic_round_robin",
            Self::Ignore => "ignore",
            Self::Drop => "drop",
        }
    }

    /// Whether jobs of this queue get routed to a target instance.
    pub fn is_assignable(&self) -> bool {
        !matches!(self, Self::Ignore | Self::Drop)
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueType {
    type Err = BeaconError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ordered" => Ok(Self::Ordered),
            "unordered" => Ok(Self::Unordered),
            "topic_round_robin" | "topic-round-robin" => Ok(Self::TopicRoundRobin),
            "ignore" => Ok(Self::Ignore),
            "drop" => Ok(Self::Drop),
            other => Err(BeaconError::InvalidArgument(format!(
                "unknown queue type: {}",
                other
            ))),
        }
    }
}

/// A configured job queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfiguration {
    pub name: String,

    /// Topic patterns handled by this queue.
    #[serde(default)]
    pub topics: Vec<String>,

    #[serde(rename = "type", default)]
    pub queue_type: QueueType,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Keep jobs on the instance that created them when it is eligible.
    #[serde(default)]
    pub prefer_run_on_creation_instance: bool,

    /// Higher ranking wins when several queues match a topic.
    #[serde(default)]
    pub ranking: i32,
}

fn default_max_retries() -> u32 {
    10
}

fn default_retry_delay() -> u64 {
    2000
}

impl QueueConfiguration {
    /// Create a queue with default retry settings.
    pub fn new(name: impl Into<String>, queue_type: QueueType) -> Self {
        Self {
            name: name.into(),
            topics: Vec::new(),
            queue_type,
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay(),
            prefer_run_on_creation_instance: false,
            ranking: 0,
        }
    }

    /// The queue jobs fall into when nothing else matches.
    pub fn main_queue() -> Self {
        Self::new(MAIN_QUEUE_NAME, QueueType::Unordered)
    }

    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ranking(mut self, ranking: i32) -> Self {
        self.ranking = ranking;
        self
    }

    /// Whether one of the topic patterns matches `topic`.
    pub fn matches(&self, topic: &str) -> bool {
        self.topics.iter().any(|p| topic_matches(p, topic))
    }
}

/// Queue resolution result for one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub queue_name: String,
    pub config: QueueConfiguration,
}

impl QueueInfo {
    pub fn queue_type(&self) -> QueueType {
        self.config.queue_type
    }
}

/// Match a topic against a pattern.
///
/// `*` matches everything, `a/*` one level below `a`, `a/**` any depth
/// below `a`. Anything else must match exactly.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let pattern = pattern.trim();
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix("/**") {
        return topic
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/') && rest.len() > 1);
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        return topic.strip_prefix(prefix).is_some_and(|rest| {
            rest.strip_prefix('/')
                .is_some_and(|leaf| !leaf.is_empty() && !leaf.contains('/'))
        });
    }
    pattern == topic
}
