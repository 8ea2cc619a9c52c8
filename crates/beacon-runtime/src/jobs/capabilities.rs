use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use beacon_core::cluster::{TopologyView, JOB_TOPICS_PROPERTY};
use beacon_core::job::{props, topic_matches, QueueInfo, QueueType};
use beacon_core::store::Properties;

/// Immutable routing snapshot of one topology.
///
/// A new snapshot replaces the old one on every topology change and the
/// old one is deactivated. Long running passes check [`is_active`] between
/// steps and stop once superseded.
///
/// [`is_active`]: TopologyCapabilities::is_active
#[derive(Debug)]
pub struct TopologyCapabilities {
    local_id: String,
    leader: bool,
    change_count: u64,
    /// Local cluster members and the topic patterns they consume.
    instances: BTreeMap<String, Vec<String>>,
    active: AtomicBool,
    round_robin: Mutex<BTreeMap<String, usize>>,
}

impl TopologyCapabilities {
    /// Capture the routing information of a topology view.
    pub fn new(view: &TopologyView, change_count: u64) -> Self {
        let cluster = view.local_cluster();
        let instances = cluster
            .instances
            .iter()
            .map(|instance| {
                let topics = instance
                    .property(JOB_TOPICS_PROPERTY)
                    .map(|value| {
                        value
                            .split(',')
                            .map(str::trim)
                            .filter(|t| !t.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                (instance.sling_id.clone(), topics)
            })
            .collect();

        let local = view.local_instance();
        Self {
            local_id: local.map(|i| i.sling_id.clone()).unwrap_or_default(),
            leader: view.is_current() && local.is_some_and(|i| i.is_leader),
            change_count,
            instances,
            active: AtomicBool::new(true),
            round_robin: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Whether the local instance leads its cluster.
    pub fn is_leader(&self) -> bool {
        self.leader
    }

    pub fn change_count(&self) -> u64 {
        self.change_count
    }

    /// False once a newer snapshot replaced this one.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Mark these capabilities as superseded.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Whether `sling_id` is a live member of the local cluster.
    pub fn is_active_instance(&self, sling_id: &str) -> bool {
        self.instances.contains_key(sling_id)
    }

    pub fn active_instance_ids(&self) -> Vec<&str> {
        self.instances.keys().map(String::as_str).collect()
    }

    /// Instances consuming `topic`, ordered by id.
    pub fn potential_targets(&self, topic: &str) -> Vec<&str> {
        self.instances
            .iter()
            .filter(|(_, patterns)| patterns.iter().any(|p| topic_matches(p, topic)))
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// Choose the instance a job of `topic` should run on.
    pub fn detect_target(
        &self,
        topic: &str,
        job_properties: &Properties,
        queue: &QueueInfo,
    ) -> Option<String> {
        let targets = self.potential_targets(topic);
        if targets.is_empty() {
            return None;
        }

        if queue.config.prefer_run_on_creation_instance {
            let created = job_properties
                .get(props::CREATED_INSTANCE)
                .and_then(|v| v.as_str());
            if let Some(created) = created.filter(|c| targets.contains(c)) {
                return Some(created.to_string());
            }
        }

        match queue.queue_type() {
            QueueType::Ordered => targets.first().map(|t| t.to_string()),
            _ => {
                let mut counters = self.round_robin.lock().ok()?;
                let counter = counters.entry(queue.queue_name.clone()).or_insert(0);
                let target = targets[*counter % targets.len()];
                *counter = counter.wrapping_add(1);
                Some(target.to_string())
            }
        }
    }

    /// Same leadership and the same consumers.
    pub fn is_same(&self, other: &TopologyCapabilities) -> bool {
        self.leader == other.leader
            && self.local_id == other.local_id
            && self.instances == other.instances
    }
}
