use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use beacon_core::cluster::{ClusterView, InstanceDescription};
use beacon_core::error::{StoreResult, UndefinedClusterView, UndefinedReason};
use beacon_core::store::{Properties, Resource, ResourceStore};

use super::heartbeat::HeartbeatStore;
use super::paths::DiscoveryPaths;

const LEADER_ID: &str = "leaderId";
const MEMBERS: &str = "members";
const PROMOTED_AT: &str = "promotedAt";
const PROMOTED_BY: &str = "promotedBy";

/// Outcome of the last decided voting, as persisted in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstablishedView {
    pub view_id: String,
    pub leader_id: String,
    pub members: BTreeSet<String>,
    pub promoted_at: Option<DateTime<Utc>>,
    pub promoted_by: Option<String>,
}

impl EstablishedView {
    pub(crate) fn from_resource(resource: &Resource) -> Option<Self> {
        Some(Self {
            view_id: resource.name().to_string(),
            leader_id: resource.get_str(LEADER_ID)?.to_string(),
            members: resource.get_strings(MEMBERS).into_iter().collect(),
            promoted_at: resource
                .get_i64(PROMOTED_AT)
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            promoted_by: resource.get_str(PROMOTED_BY).map(str::to_string),
        })
    }

    pub(crate) fn to_properties(&self) -> Properties {
        let mut props = Properties::new();
        props.insert(LEADER_ID.into(), Value::from(self.leader_id.clone()));
        props.insert(
            MEMBERS.into(),
            Value::Array(self.members.iter().cloned().map(Value::from).collect()),
        );
        if let Some(at) = self.promoted_at {
            props.insert(PROMOTED_AT.into(), Value::from(at.timestamp_millis()));
        }
        if let Some(by) = &self.promoted_by {
            props.insert(PROMOTED_BY.into(), Value::from(by.clone()));
        }
        props
    }
}

/// Read the established view; with several entries the lowest id wins.
pub async fn read_established_view(
    store: &dyn ResourceStore,
    paths: &DiscoveryPaths,
) -> StoreResult<Option<EstablishedView>> {
    let children = store.list_children(&paths.established_view()).await?;
    if children.len() > 1 {
        tracing::warn!(
            count = children.len(),
            "Multiple established views found, using the first"
        );
    }
    Ok(children.iter().find_map(EstablishedView::from_resource))
}

/// Computes the local cluster view from live heartbeats and the
/// established voting result.
pub struct ClusterViewService {
    heartbeats: Arc<HeartbeatStore>,
    store: Arc<dyn ResourceStore>,
    paths: DiscoveryPaths,
}

impl ClusterViewService {
    /// Create a view service reading heartbeats and the established view.
    pub fn new(
        heartbeats: Arc<HeartbeatStore>,
        store: Arc<dyn ResourceStore>,
        paths: DiscoveryPaths,
    ) -> Self {
        Self {
            heartbeats,
            store,
            paths,
        }
    }

    /// Id of the local instance.
    pub fn sling_id(&self) -> &str {
        self.heartbeats.sling_id()
    }

    /// The established view, if a voting was ever promoted.
    pub async fn established_view(&self) -> StoreResult<Option<EstablishedView>> {
        read_established_view(self.store.as_ref(), &self.paths).await
    }

    /// The current local cluster view.
    ///
    /// Defined only when our own heartbeat is fresh and the established
    /// view lists exactly the instances with fresh heartbeats.
    pub async fn local_cluster_view(&self) -> Result<ClusterView, UndefinedClusterView> {
        let me = self.sling_id();
        let live = self.heartbeats.live_records().await.map_err(|e| {
            UndefinedClusterView::new(UndefinedReason::RepositoryException, e.to_string())
        })?;

        if !live.iter().any(|r| r.sling_id == me) {
            return Err(UndefinedClusterView::new(
                UndefinedReason::IsolatedFromTopology,
                "own heartbeat is missing or stale",
            ));
        }

        let established = self
            .established_view()
            .await
            .map_err(|e| {
                UndefinedClusterView::new(UndefinedReason::RepositoryException, e.to_string())
            })?
            .ok_or_else(|| {
                UndefinedClusterView::new(UndefinedReason::NoEstablishedView, "no voting decided yet")
            })?;

        let live_ids: BTreeSet<String> = live.iter().map(|r| r.sling_id.clone()).collect();
        if established.members != live_ids {
            return Err(UndefinedClusterView::new(
                UndefinedReason::EstablishedViewMismatch,
                format!(
                    "established members {:?} differ from live instances {:?}",
                    established.members, live_ids
                ),
            ));
        }

        let instances = live
            .into_iter()
            .map(|record| {
                let id = record.sling_id;
                InstanceDescription::new(id.clone())
                    .with_leader(id == established.leader_id)
                    .with_local(id == me)
                    .with_properties(record.properties)
            })
            .collect();

        Ok(ClusterView::new(established.view_id, instances))
    }
}
