//! Wiring of one beacon instance.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Router;
use tokio::task::JoinHandle;
use uuid::Uuid;

use beacon_core::cluster::{InstanceDescription, TopologyView, JOB_TOPICS_PROPERTY};
use beacon_core::config::BeaconConfig;
use beacon_core::error::{BeaconError, Result};
use beacon_core::job::{JobLayout, JobResource};
use beacon_core::store::{Properties, ResourceStore};
use beacon_core::time::{Clock, SystemClock};

use crate::cluster::{
    ClusterViewService, DiscoveryPaths, DiscoveryService, HeartbeatHandler, HeartbeatParts,
    HeartbeatStore, VotingHandler,
};
use crate::connector::{
    connector_router, AnnouncementRegistry, ConnectorRegistry, ConnectorServer,
    ConnectorTransport, HttpConnectorTransport,
};
use crate::jobs::{
    JobStorage, JobTopologyManager, MaintenanceTask, QueueConfigurationManager, UpgradeTask,
};
use crate::store::MemoryStore;

/// Builder for a [`BeaconNode`].
///
/// Anything not supplied falls back to a default: an in-memory store, the
/// system clock and an HTTP connector transport.
pub struct NodeBuilder {
    config: BeaconConfig,
    store: Option<Arc<dyn ResourceStore>>,
    clock: Option<Arc<dyn Clock>>,
    transport: Option<Arc<dyn ConnectorTransport>>,
}

impl NodeBuilder {
    /// Create a builder for `config`.
    pub fn new(config: BeaconConfig) -> Self {
        Self {
            config,
            store: None,
            clock: None,
            transport: None,
        }
    }

    /// Use `store` instead of an in-memory store.
    pub fn with_store(mut self, store: Arc<dyn ResourceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use `transport` for outgoing connector pings.
    pub fn with_transport(mut self, transport: Arc<dyn ConnectorTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Validate the configuration and wire all services.
    pub fn build(self) -> Result<BeaconNode> {
        let config = self.config;
        config.validate()?;

        let sling_id = config
            .instance
            .sling_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn ResourceStore>);
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpConnectorTransport::new(
                config.connector.request_timeout(),
            )?),
        };

        let mut properties: BTreeMap<String, String> = config.instance.properties.clone();
        properties.insert(JOB_TOPICS_PROPERTY.to_string(), config.jobs.topics_property());
        let server_info = format!("beacon/{}", env!("CARGO_PKG_VERSION"));

        let paths = DiscoveryPaths::new(config.discovery.root.clone());
        let heartbeats = Arc::new(HeartbeatStore::new(
            store.clone(),
            paths.clone(),
            clock.clone(),
            sling_id.clone(),
            config.discovery.heartbeat_timeout(),
        ));
        let voting = Arc::new(VotingHandler::new(
            store.clone(),
            paths.clone(),
            clock.clone(),
            sling_id.clone(),
            config.discovery.tie_break,
            config.discovery.voting_timeout(),
        ));
        let views = Arc::new(ClusterViewService::new(
            heartbeats.clone(),
            store.clone(),
            paths.clone(),
        ));
        let announcements = Arc::new(AnnouncementRegistry::new(
            store.clone(),
            paths,
            clock.clone(),
            sling_id.clone(),
            config.connector.announcement_ttl_secs,
        ));
        let connectors = Arc::new(
            ConnectorRegistry::new(
                transport,
                announcements.clone(),
                views.clone(),
                clock.clone(),
                config.connector.clone(),
                config.discovery.heartbeat_interval(),
            )
            .with_server_info(server_info.clone()),
        );
        let connector_server = Arc::new(
            ConnectorServer::new(views.clone(), announcements.clone(), config.connector.clone())
                .with_server_info(server_info),
        );
        let local = InstanceDescription::new(sling_id.clone())
            .with_local(true)
            .with_properties(properties.clone());
        let discovery = Arc::new(DiscoveryService::new(
            views.clone(),
            announcements.clone(),
            local,
        ));
        let heartbeat = HeartbeatHandler::new(
            HeartbeatParts {
                heartbeats,
                voting,
                announcements: announcements.clone(),
                connectors: connectors.clone(),
                discovery: discovery.clone(),
            },
            &config.discovery,
            config.instance.endpoints.clone(),
            properties,
        );

        let layout = JobLayout::new(config.jobs.root.clone());
        let queues = Arc::new(QueueConfigurationManager::new(config.jobs.queues.clone()));
        let jobs = JobStorage::new(
            store.clone(),
            layout.clone(),
            clock.clone(),
            sling_id.clone(),
            queues.clone(),
        );
        let job_manager = Arc::new(JobTopologyManager::new(
            MaintenanceTask::new(
                store.clone(),
                layout.clone(),
                clock.clone(),
                queues.clone(),
                config.jobs.cleanup_every,
            ),
            UpgradeTask::new(
                store.clone(),
                layout,
                clock.clone(),
                queues.clone(),
                sling_id.clone(),
                config.jobs.legacy_roots(),
            ),
            queues.clone(),
            config.jobs.maintenance_interval(),
        ));
        discovery.add_listener(job_manager.clone());

        Ok(BeaconNode {
            sling_id,
            config,
            store,
            clock,
            heartbeat,
            views,
            discovery,
            announcements,
            connectors,
            connector_server,
            queues,
            jobs,
            job_manager,
        })
    }
}

/// One instance: heartbeats, discovery, connectors and job distribution
/// over a shared store.
pub struct BeaconNode {
    sling_id: String,
    config: BeaconConfig,
    store: Arc<dyn ResourceStore>,
    clock: Arc<dyn Clock>,
    heartbeat: HeartbeatHandler,
    views: Arc<ClusterViewService>,
    discovery: Arc<DiscoveryService>,
    announcements: Arc<AnnouncementRegistry>,
    connectors: Arc<ConnectorRegistry>,
    connector_server: Arc<ConnectorServer>,
    queues: Arc<QueueConfigurationManager>,
    jobs: JobStorage,
    job_manager: Arc<JobTopologyManager>,
}

impl BeaconNode {
    /// Create a [`NodeBuilder`].
    pub fn builder(config: BeaconConfig) -> NodeBuilder {
        NodeBuilder::new(config)
    }

    /// Id of this instance.
    pub fn sling_id(&self) -> &str {
        &self.sling_id
    }

    pub fn config(&self) -> &BeaconConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn heartbeat(&self) -> &HeartbeatHandler {
        &self.heartbeat
    }

    pub fn cluster_views(&self) -> &Arc<ClusterViewService> {
        &self.views
    }

    pub fn discovery(&self) -> &Arc<DiscoveryService> {
        &self.discovery
    }

    pub fn announcements(&self) -> &Arc<AnnouncementRegistry> {
        &self.announcements
    }

    pub fn connectors(&self) -> &Arc<ConnectorRegistry> {
        &self.connectors
    }

    pub fn queues(&self) -> &Arc<QueueConfigurationManager> {
        &self.queues
    }

    pub fn jobs(&self) -> &JobStorage {
        &self.jobs
    }

    pub fn job_manager(&self) -> &Arc<JobTopologyManager> {
        &self.job_manager
    }

    /// The current topology, or the last known one marked as old.
    pub async fn get_topology(&self) -> Arc<TopologyView> {
        self.discovery.get_topology().await
    }

    /// The inbound connector endpoint of this node.
    pub fn connector_router(&self) -> Router {
        connector_router(self.connector_server.clone())
    }

    /// Submit a job, routed with the capabilities of the current topology.
    pub async fn add_job(&self, topic: &str, properties: Properties) -> Result<Option<JobResource>> {
        if topic.is_empty() {
            return Err(BeaconError::InvalidArgument("job topic must not be empty".into()));
        }
        let caps = self.job_manager.current_capabilities();
        self.jobs.add_job(topic, properties, caps.as_deref()).await
    }

    /// Start heartbeating, job maintenance and, once the first tick went
    /// out, connector pings.
    pub async fn start(self: Arc<Self>) -> NodeHandle {
        let manager = self.job_manager.clone();
        let jobs_task = tokio::spawn(async move { manager.run().await });

        self.heartbeat.start().await;
        self.heartbeat.startup_finished().await;

        tracing::info!(
            sling_id = %self.sling_id,
            connectors = self.config.connector.urls.len(),
            "Beacon node started"
        );

        NodeHandle {
            node: self,
            jobs_task,
        }
    }
}

/// A started node. Dropping it leaves the background tasks running; call
/// [`NodeHandle::stop`] to shut down.
pub struct NodeHandle {
    node: Arc<BeaconNode>,
    jobs_task: JoinHandle<()>,
}

impl NodeHandle {
    pub fn node(&self) -> &Arc<BeaconNode> {
        &self.node
    }

    /// Stop heartbeating and job maintenance.
    pub async fn stop(self) -> Result<()> {
        let heartbeat = self.node.heartbeat.stop().await;
        self.node.job_manager.stop();
        if let Err(e) = self.jobs_task.await {
            tracing::warn!("Job topology manager task failed: {}", e);
        }
        tracing::info!(sling_id = %self.node.sling_id, "Beacon node stopped");

        heartbeat.map_err(|e| BeaconError::InvalidState(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;
    use beacon_core::config::StoreBackend;
    use beacon_core::time::ManualClock;

    fn config(id: &str) -> BeaconConfig {
        let mut config = BeaconConfig::default();
        config.instance.sling_id = Some(id.to_string());
        config.jobs.root = "/jobs".into();
        config
    }

    fn node(store: Arc<MemoryStore>, clock: Arc<ManualClock>, id: &str) -> BeaconNode {
        BeaconNode::builder(config(id))
            .with_store(store)
            .with_clock(clock)
            .with_transport(Arc::new(ScriptedTransport::new()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_generates_sling_id() {
        let node = BeaconNode::builder(BeaconConfig::default())
            .with_transport(Arc::new(ScriptedTransport::new()))
            .build()
            .unwrap();
        assert!(Uuid::parse_str(node.sling_id()).is_ok());
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = BeaconConfig::default();
        config.store.backend = StoreBackend::Postgres;
        assert!(BeaconNode::builder(config).build().is_err());

        let mut config = BeaconConfig::default();
        config.jobs.maintenance_interval_secs = 0;
        let result = BeaconNode::builder(config)
            .with_transport(Arc::new(ScriptedTransport::new()))
            .build();
        assert!(matches!(result, Err(BeaconError::Config(_))));
    }

    #[tokio::test]
    async fn test_single_node_topology_and_job() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let node = node(store.clone(), clock, "a");
        let manager = node.job_manager().clone();
        let jobs_task = tokio::spawn(async move { manager.run().await });

        node.heartbeat().activate();
        for _ in 0..2 {
            node.heartbeat().tick().await.unwrap();
        }
        let topology = node.get_topology().await;
        assert!(topology.is_current());
        let local = topology.local_instance().unwrap();
        assert!(local.is_leader);
        assert_eq!(local.property(JOB_TOPICS_PROPERTY), Some("*"));

        for _ in 0..100 {
            if node.job_manager().current_capabilities().is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(node.job_manager().current_capabilities().unwrap().is_leader());

        let job = node.add_job("t", Properties::new()).await.unwrap().unwrap();
        assert!(job.path.starts_with("/jobs/assigned/a/t/"));
        assert!(node.add_job("", Properties::new()).await.is_err());

        node.job_manager().stop();
        jobs_task.await.unwrap();
    }
}
