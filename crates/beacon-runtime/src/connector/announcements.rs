use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use beacon_core::cluster::{Announcement, ClusterView, InstanceDescription};
use beacon_core::error::Result;
use beacon_core::store::{child_path, Properties, ResourceStore, Session};
use beacon_core::time::Clock;

use crate::cluster::DiscoveryPaths;

const ANNOUNCEMENT: &str = "announcement";
const CREATED_AT: &str = "createdAt";

/// Result of registering an incoming announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// New or changed; persisted for the rest of the local cluster.
    Registered,
    /// Unchanged content; only the ping time moved.
    Refreshed,
    /// Structurally invalid.
    Invalid,
    /// The owner is already reachable through another announcement.
    AlreadyAttached,
}

/// Announcements received by this instance through its inbound
/// connector, and access to those received by its cluster peers.
///
/// Own announcements are cached in memory, refreshed on every ping and
/// persisted under `clusterInstances/<me>/announcements/<owner>` whenever
/// their content changes. Only the owning instance expires them.
pub struct AnnouncementRegistry {
    store: Arc<dyn ResourceStore>,
    paths: DiscoveryPaths,
    clock: Arc<dyn Clock>,
    sling_id: String,
    default_ttl_secs: u64,
    cache: Mutex<BTreeMap<String, Announcement>>,
}

impl AnnouncementRegistry {
    /// Create a registry. `default_ttl_secs` applies to announcements without a ttl.
    pub fn new(
        store: Arc<dyn ResourceStore>,
        paths: DiscoveryPaths,
        clock: Arc<dyn Clock>,
        sling_id: impl Into<String>,
        default_ttl_secs: u64,
    ) -> Self {
        Self {
            store,
            paths,
            clock,
            sling_id: sling_id.into(),
            default_ttl_secs,
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    /// Id of the local instance.
    pub fn sling_id(&self) -> &str {
        &self.sling_id
    }

    /// Store or refresh an announcement keyed by its owner.
    pub async fn register_announcement(&self, mut incoming: Announcement) -> Result<Registration> {
        if !incoming.is_valid() {
            tracing::warn!(owner = %incoming.owner_id, "Rejected invalid announcement");
            return Ok(Registration::Invalid);
        }

        let now = self.clock.now();
        if incoming.ttl_seconds == 0 {
            incoming.ttl_seconds = self.default_ttl_secs;
        }
        incoming.created_at = Some(now);
        let owner = incoming.owner_id.clone();

        let mut cache = self.cache.lock().await;
        if let Some(existing) = cache.get_mut(&owner) {
            if existing.corresponds_to(&incoming) {
                existing.created_at = Some(now);
                return Ok(Registration::Refreshed);
            }
            tracing::debug!(owner = %owner, "Announcement content changed");
            cache.remove(&owner);
        }

        let attached_elsewhere = cache
            .values()
            .filter(|a| a.owner_id != owner)
            .any(|a| a.contains_instance(&owner));
        if attached_elsewhere {
            tracing::info!(owner = %owner, "Instance already attached through another announcement");
            return Ok(Registration::AlreadyAttached);
        }

        let mut record = Properties::new();
        record.insert(ANNOUNCEMENT.into(), Value::from(incoming.to_json()?));
        record.insert(CREATED_AT.into(), Value::from(now.timestamp_millis()));

        let mut session = Session::new(self.store.clone());
        session.put(child_path(&self.paths.announcements(&self.sling_id), &owner), record);
        if let Err(e) = session.commit().await {
            session.refresh();
            return Err(e.into());
        }

        tracing::info!(owner = %owner, inherited = incoming.inherited, "Registered announcement");
        cache.insert(owner, incoming);
        Ok(Registration::Registered)
    }

    /// Forget the announcement of `owner_id`, in memory and in the store.
    pub async fn unregister_announcement(&self, owner_id: &str) -> Result<()> {
        let mut cache = self.cache.lock().await;
        cache.remove(owner_id);

        let path = child_path(&self.paths.announcements(&self.sling_id), owner_id);
        if self.store.get(&path).await?.is_some() {
            let mut session = Session::new(self.store.clone());
            session.delete(path);
            if let Err(e) = session.commit().await {
                session.refresh();
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Whether a non-expired announcement from `owner_id` is registered here.
    pub async fn has_active_announcement(&self, owner_id: &str) -> bool {
        let now = self.clock.now();
        self.cache
            .lock()
            .await
            .get(owner_id)
            .is_some_and(|a| !a.is_expired(now))
    }

    /// Announcements registered on this instance, expired or not.
    pub async fn list_local_announcements(&self) -> Vec<Announcement> {
        self.cache.lock().await.values().cloned().collect()
    }

    /// Announcements the peers pinged us with, excluding responses to our
    /// own outgoing pings.
    pub async fn list_local_incoming_announcements(&self) -> Vec<Announcement> {
        self.cache
            .lock()
            .await
            .values()
            .filter(|a| !a.inherited)
            .cloned()
            .collect()
    }

    /// Instances reachable through announcements held anywhere in the
    /// local cluster, minus the local cluster's own members.
    pub async fn list_instances(&self, local_view: &ClusterView) -> Vec<InstanceDescription> {
        let now = self.clock.now();
        let mut announcements: Vec<Announcement> = self
            .cache
            .lock()
            .await
            .values()
            .filter(|a| !a.is_expired(now))
            .cloned()
            .collect();

        for peer in local_view
            .instances
            .iter()
            .filter(|i| i.sling_id != self.sling_id)
        {
            match self.persisted_announcements(&peer.sling_id).await {
                Ok(persisted) => announcements.extend(persisted),
                Err(e) => {
                    tracing::warn!(sling_id = %peer.sling_id, "Failed to read peer announcements: {}", e)
                }
            }
        }

        let mut seen: BTreeSet<String> = local_view
            .instances
            .iter()
            .map(|i| i.sling_id.clone())
            .collect();
        let mut instances = Vec::new();
        for announcement in &announcements {
            for instance in announcement.list_instances() {
                if seen.insert(instance.sling_id.clone()) {
                    instances.push(instance);
                }
            }
        }
        instances
    }

    /// Nest every announcement held in the local cluster into `target`,
    /// skipping those owned by `exclude_owner`.
    pub async fn add_all_except(
        &self,
        target: &mut Announcement,
        local_view: &ClusterView,
        exclude_owner: Option<&str>,
    ) -> Result<()> {
        for instance in &local_view.instances {
            for announcement in self.persisted_announcements(&instance.sling_id).await? {
                if exclude_owner == Some(announcement.owner_id.as_str()) {
                    continue;
                }
                target.add_incoming(announcement);
            }
        }
        Ok(())
    }

    /// Remove expired announcements and leftovers persisted by an earlier
    /// run of this instance. Returns the number removed.
    pub async fn check_expired_announcements(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut cache = self.cache.lock().await;

        let mut removed: BTreeSet<String> = cache
            .values()
            .filter(|a| a.is_expired(now))
            .map(|a| a.owner_id.clone())
            .collect();
        for owner in &removed {
            tracing::info!(owner = %owner, "Announcement expired");
            cache.remove(owner);
        }

        let persisted = self
            .store
            .list_children(&self.paths.announcements(&self.sling_id))
            .await?;
        for resource in persisted {
            if cache.contains_key(resource.name()) {
                continue;
            }
            let mut session = Session::new(self.store.clone());
            session.delete(resource.path.clone());
            match session.commit().await {
                Ok(()) => {
                    removed.insert(resource.name().to_string());
                }
                Err(e) => {
                    tracing::warn!(owner = %resource.name(), "Failed to remove announcement: {}", e);
                    session.refresh();
                }
            }
        }

        Ok(removed.len())
    }

    async fn persisted_announcements(&self, sling_id: &str) -> Result<Vec<Announcement>> {
        let children = self
            .store
            .list_children(&self.paths.announcements(sling_id))
            .await?;
        let mut out = Vec::with_capacity(children.len());
        for child in children {
            let Some(json) = child.get_str(ANNOUNCEMENT) else {
                continue;
            };
            match Announcement::from_json(json) {
                Ok(announcement) => out.push(announcement),
                Err(e) => tracing::debug!(path = %child.path, "Skipping unreadable announcement: {}", e),
            }
        }
        Ok(out)
    }
}
