use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One instance as seen in a cluster view or an announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceDescription {
    pub sling_id: String,

    #[serde(default)]
    pub is_leader: bool,

    /// True only for the instance describing itself.
    #[serde(skip)]
    pub is_local: bool,

    /// Id of the cluster view this instance belongs to.
    #[serde(default)]
    pub cluster_id: String,

    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl InstanceDescription {
    /// Create a follower description with no properties.
    pub fn new(sling_id: impl Into<String>) -> Self {
        Self {
            sling_id: sling_id.into(),
            is_leader: false,
            is_local: false,
            cluster_id: String::new(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_leader(mut self, is_leader: bool) -> Self {
        self.is_leader = is_leader;
        self
    }

    pub fn with_local(mut self, is_local: bool) -> Self {
        self.is_local = is_local;
        self
    }

    pub fn with_cluster_id(mut self, cluster_id: impl Into<String>) -> Self {
        self.cluster_id = cluster_id.into();
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_properties(mut self, properties: BTreeMap<String, String>) -> Self {
        self.properties = properties;
        self
    }

    /// Value of a custom property.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// The instances sharing one backing store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterView {
    pub id: String,
    pub instances: Vec<InstanceDescription>,
}

impl ClusterView {
    /// Build a view, ordering instances by id and dropping duplicates.
    pub fn new(id: impl Into<String>, instances: Vec<InstanceDescription>) -> Self {
        let id = id.into();
        let mut instances = instances;
        instances.sort_by(|a, b| a.sling_id.cmp(&b.sling_id));
        instances.dedup_by(|a, b| a.sling_id == b.sling_id);
        for instance in &mut instances {
            instance.cluster_id = id.clone();
        }
        Self { id, instances }
    }

    pub fn leader(&self) -> Option<&InstanceDescription> {
        self.instances.iter().find(|i| i.is_leader)
    }

    pub fn local_instance(&self) -> Option<&InstanceDescription> {
        self.instances.iter().find(|i| i.is_local)
    }

    pub fn instance(&self, sling_id: &str) -> Option<&InstanceDescription> {
        self.instances.iter().find(|i| i.sling_id == sling_id)
    }

    pub fn contains(&self, sling_id: &str) -> bool {
        self.instance(sling_id).is_some()
    }

    pub fn instance_ids(&self) -> Vec<&str> {
        self.instances.iter().map(|i| i.sling_id.as_str()).collect()
    }
}
