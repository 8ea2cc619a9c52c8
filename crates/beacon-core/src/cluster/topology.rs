use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

use super::event::TopologyEventType;
use super::instance::{ClusterView, InstanceDescription};

/// Snapshot of every instance visible to this instance.
///
/// Contents never change after construction. Only the `current` flag
/// flips, when a newer computation failed and this view is being served
/// as the last known topology.
#[derive(Debug)]
pub struct TopologyView {
    local_cluster: ClusterView,
    instances: Vec<InstanceDescription>,
    current: AtomicBool,
}

impl TopologyView {
    /// Merge the local cluster with instances reached via announcements.
    pub fn new(local_cluster: ClusterView, remote: Vec<InstanceDescription>) -> Self {
        let mut seen: BTreeSet<String> = local_cluster
            .instances
            .iter()
            .map(|i| i.sling_id.clone())
            .collect();
        let mut instances = local_cluster.instances.clone();
        for instance in remote {
            if seen.insert(instance.sling_id.clone()) {
                instances.push(instance);
            }
        }

        Self {
            local_cluster,
            instances,
            current: AtomicBool::new(true),
        }
    }

    /// A view containing only this instance, used before any view was
    /// ever established. Starts out not current.
    pub fn isolated(local: InstanceDescription) -> Self {
        let cluster_id = format!("isolated-{}", local.sling_id);
        let local = local.with_local(true).with_leader(true);
        let view = Self::new(ClusterView::new(cluster_id, vec![local]), Vec::new());
        view.mark_old();
        view
    }

    /// Whether this view reflects the latest successful computation.
    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst)
    }

    /// Flag the view as no longer current.
    pub fn mark_old(&self) {
        self.current.store(false, Ordering::SeqCst);
    }

    pub fn local_cluster(&self) -> &ClusterView {
        &self.local_cluster
    }

    pub fn local_instance(&self) -> Option<&InstanceDescription> {
        self.local_cluster.local_instance()
    }

    /// Local and announced instances.
    pub fn instances(&self) -> &[InstanceDescription] {
        &self.instances
    }

    pub fn instance(&self, sling_id: &str) -> Option<&InstanceDescription> {
        self.instances.iter().find(|i| i.sling_id == sling_id)
    }

    pub fn cluster_ids(&self) -> BTreeSet<&str> {
        self.instances.iter().map(|i| i.cluster_id.as_str()).collect()
    }

    /// Classify the difference to an older view.
    ///
    /// Membership, cluster assignment and leadership changes count as
    /// `Changed`; differing properties alone as `PropertiesChanged`.
    pub fn compare(&self, older: &TopologyView) -> Option<TopologyEventType> {
        let mine = self.index();
        let theirs = older.index();

        if mine.len() != theirs.len() {
            return Some(TopologyEventType::Changed);
        }

        let mut properties_differ = false;
        for (id, (cluster, leader, props)) in &mine {
            match theirs.get(id) {
                None => return Some(TopologyEventType::Changed),
                Some((old_cluster, old_leader, old_props)) => {
                    if cluster != old_cluster || leader != old_leader {
                        return Some(TopologyEventType::Changed);
                    }
                    if props != old_props {
                        properties_differ = true;
                    }
                }
            }
        }

        properties_differ.then_some(TopologyEventType::PropertiesChanged)
    }

    #[allow(clippy::type_complexity)]
    fn index(&self) -> BTreeMap<&str, (&str, bool, &BTreeMap<String, String>)> {
        self.instances
            .iter()
            .map(|i| {
                (
                    i.sling_id.as_str(),
                    (i.cluster_id.as_str(), i.is_leader, &i.properties),
                )
            })
            .collect()
    }
}
