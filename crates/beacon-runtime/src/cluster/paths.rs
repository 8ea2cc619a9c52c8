use beacon_core::store::child_path;

/// Store locations of discovery data below the configured root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryPaths {
    root: String,
}

impl DiscoveryPaths {
    /// Create the layout below `root`.
    pub fn new(root: impl Into<String>) -> Self {
        let root: String = root.into();
        Self {
            root: root.trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Parent of all heartbeat records.
    pub fn cluster_instances(&self) -> String {
        child_path(&self.root, "clusterInstances")
    }

    /// Heartbeat record of one instance.
    pub fn instance(&self, sling_id: &str) -> String {
        child_path(&self.cluster_instances(), sling_id)
    }

    /// Announcements registered by one instance.
    pub fn announcements(&self, sling_id: &str) -> String {
        child_path(&self.instance(sling_id), "announcements")
    }

    /// Parent of all ongoing voting rounds.
    pub fn ongoing_votings(&self) -> String {
        child_path(&self.root, "ongoingVotings")
    }

    pub fn voting(&self, round_id: &str) -> String {
        child_path(&self.ongoing_votings(), round_id)
    }

    pub fn votes(&self, round_id: &str) -> String {
        child_path(&self.voting(round_id), "votes")
    }

    /// Parent of the established view record.
    pub fn established_view(&self) -> String {
        child_path(&self.root, "establishedView")
    }

    pub fn previous_view(&self) -> String {
        child_path(&self.root, "previousView")
    }
}
