use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use beacon_core::config::DiscoveryConfig;

use super::discovery::DiscoveryService;
use super::heartbeat::{HeartbeatOutcome, HeartbeatStore};
use super::periodic::{PeriodicJob, TickError, TickFuture};
use super::voting::VotingHandler;
use crate::connector::{AnnouncementRegistry, ConnectorRegistry};

/// Collaborators driven by the heartbeat.
pub struct HeartbeatParts {
    pub heartbeats: Arc<HeartbeatStore>,
    pub voting: Arc<VotingHandler>,
    pub announcements: Arc<AnnouncementRegistry>,
    pub connectors: Arc<ConnectorRegistry>,
    pub discovery: Arc<DiscoveryService>,
}

struct HandlerInner {
    parts: HeartbeatParts,
    endpoints: Vec<String>,
    properties: BTreeMap<String, String>,
    retention: Duration,
    active: AtomicBool,
    force_ping: AtomicBool,
    startup_finished: AtomicBool,
    tick_lock: Mutex<()>,
}

/// Issues heartbeats and runs the liveness check on every tick.
///
/// A tick writes our heartbeat, pings outgoing connectors once startup
/// finished, then expires announcements and stale records, advances the
/// voting and lets discovery emit topology events.
pub struct HeartbeatHandler {
    inner: Arc<HandlerInner>,
    interval: Duration,
    job: Mutex<Option<PeriodicJob>>,
}

impl HeartbeatHandler {
    /// Create a heartbeat handler; nothing runs until [`start`](Self::start).
    pub fn new(
        parts: HeartbeatParts,
        config: &DiscoveryConfig,
        endpoints: Vec<String>,
        properties: BTreeMap<String, String>,
    ) -> Self {
        Self {
            inner: Arc::new(HandlerInner {
                parts,
                endpoints,
                properties,
                retention: config.record_retention(),
                active: AtomicBool::new(false),
                force_ping: AtomicBool::new(false),
                startup_finished: AtomicBool::new(false),
                tick_lock: Mutex::new(()),
            }),
            interval: config.heartbeat_interval(),
            job: Mutex::new(None),
        }
    }

    /// Whether heartbeats are currently issued.
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Start the periodic heartbeat and run the first tick right away.
    pub async fn start(&self) {
        let mut job = self.job.lock().await;
        if job.is_some() {
            return;
        }
        self.inner.active.store(true, Ordering::SeqCst);

        let inner = self.inner.clone();
        let periodic = PeriodicJob::start(self.interval, "heartbeat", move || -> TickFuture {
            let inner = inner.clone();
            Box::pin(async move { inner.tick().await })
        });
        periodic.trigger_now();
        *job = Some(periodic);

        tracing::info!(
            sling_id = %self.inner.parts.heartbeats.sling_id(),
            interval_secs = self.interval.as_secs(),
            "Heartbeat started"
        );
    }

    /// Stop heartbeating. Returns the fatal error that ended the worker,
    /// if any.
    pub async fn stop(&self) -> Result<(), TickError> {
        self.inner.active.store(false, Ordering::SeqCst);
        let job = self.job.lock().await.take();
        match job {
            Some(job) => {
                let result = job.stop().await;
                tracing::info!(sling_id = %self.inner.parts.heartbeats.sling_id(), "Heartbeat stopped");
                result
            }
            None => Ok(()),
        }
    }

    /// Heartbeat as soon as possible, pinging all connectors regardless
    /// of their backoff.
    pub async fn trigger_heartbeat(&self) {
        self.inner.force_ping.store(true, Ordering::SeqCst);
        if let Some(job) = self.job.lock().await.as_ref() {
            job.trigger_now();
        }
    }

    /// Allow outgoing connector pings from now on.
    pub async fn startup_finished(&self) {
        if !self.inner.startup_finished.swap(true, Ordering::SeqCst) {
            tracing::debug!("Startup finished, enabling connector pings");
            self.trigger_heartbeat().await;
        }
    }

    /// Run one heartbeat and liveness check in the caller's task.
    pub async fn tick(&self) -> Result<(), TickError> {
        self.inner.tick().await
    }

    /// Activate without a background worker; ticks are driven by the caller.
    pub fn activate(&self) {
        self.inner.active.store(true, Ordering::SeqCst);
    }
}

impl HandlerInner {
    async fn tick(&self) -> Result<(), TickError> {
        if !self.active.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.tick_lock.lock().await;
        if !self.active.load(Ordering::SeqCst) {
            return Ok(());
        }

        let issued = self.issue_heartbeat().await?;

        if self.startup_finished.load(Ordering::SeqCst) {
            let force = self.force_ping.swap(false, Ordering::SeqCst);
            self.parts.connectors.ping_outgoing_connectors(force).await;
        }

        if !self.active.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.check_view().await;

        issued.map_err(TickError::Recoverable)
    }

    /// Write our heartbeat. Store failures are reported after the liveness
    /// check so discovery still sees them.
    async fn issue_heartbeat(&self) -> Result<Result<(), String>, TickError> {
        let heartbeats = &self.parts.heartbeats;
        match heartbeats
            .write_heartbeat(&self.endpoints, &self.properties)
            .await
        {
            Ok(HeartbeatOutcome::Written) => Ok(Ok(())),
            Ok(HeartbeatOutcome::DuplicateInstance { other_runtime_id }) => {
                tracing::error!(
                    sling_id = %heartbeats.sling_id(),
                    runtime_id = %heartbeats.runtime_id(),
                    other_runtime_id = %other_runtime_id,
                    "Another process is running with this sling id, deactivating"
                );
                self.active.store(false, Ordering::SeqCst);
                Err(TickError::Fatal(format!(
                    "duplicate instance {} (runtime {})",
                    heartbeats.sling_id(),
                    other_runtime_id
                )))
            }
            Err(e) => {
                tracing::warn!("Failed to write heartbeat: {}", e);
                Ok(Err(format!("failed to write heartbeat: {}", e)))
            }
        }
    }

    async fn check_view(&self) {
        if let Err(e) = self.parts.announcements.check_expired_announcements().await {
            tracing::warn!("Failed to check expired announcements: {}", e);
        }
        if let Err(e) = self.parts.heartbeats.expire_stale_records(self.retention).await {
            tracing::warn!("Failed to expire heartbeat records: {}", e);
        }

        match self.parts.heartbeats.live_records().await {
            Ok(records) => {
                let live: BTreeSet<String> = records.into_iter().map(|r| r.sling_id).collect();
                if live.contains(self.parts.heartbeats.sling_id()) {
                    if let Err(e) = self.parts.voting.analyze_votings(&live).await {
                        tracing::warn!("Failed to analyze votings: {}", e);
                    }
                }
            }
            Err(e) => tracing::debug!("Skipping voting, heartbeats unreadable: {}", e),
        }

        self.parts.discovery.handle_potential_topology_change().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{read_established_view, ClusterViewService, DiscoveryPaths};
    use crate::store::MemoryStore;
    use crate::testing::ScriptedTransport;
    use beacon_core::cluster::InstanceDescription;
    use beacon_core::config::ConnectorConfig;
    use beacon_core::time::ManualClock;

    fn handler(store: Arc<MemoryStore>, clock: Arc<ManualClock>, id: &str) -> HeartbeatHandler {
        let config = DiscoveryConfig::default();
        let paths = DiscoveryPaths::new(config.root.clone());
        let heartbeats = Arc::new(HeartbeatStore::new(
            store.clone(),
            paths.clone(),
            clock.clone(),
            id,
            config.heartbeat_timeout(),
        ));
        let voting = Arc::new(VotingHandler::new(
            store.clone(),
            paths.clone(),
            clock.clone(),
            id,
            config.tie_break,
            config.voting_timeout(),
        ));
        let views = Arc::new(ClusterViewService::new(
            heartbeats.clone(),
            store.clone(),
            paths.clone(),
        ));
        let announcements = Arc::new(AnnouncementRegistry::new(
            store,
            paths,
            clock.clone(),
            id,
            30,
        ));
        let connectors = Arc::new(ConnectorRegistry::new(
            Arc::new(ScriptedTransport::new()),
            announcements.clone(),
            views.clone(),
            clock,
            ConnectorConfig::default(),
            config.heartbeat_interval(),
        ));
        let discovery = Arc::new(DiscoveryService::new(
            views,
            announcements.clone(),
            InstanceDescription::new(id),
        ));

        HeartbeatHandler::new(
            HeartbeatParts {
                heartbeats,
                voting,
                announcements,
                connectors,
                discovery,
            },
            &config,
            Vec::new(),
            BTreeMap::new(),
        )
    }

    #[tokio::test]
    async fn test_two_instances_elect_lowest() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let a = handler(store.clone(), clock.clone(), "a");
        let b = handler(store.clone(), clock.clone(), "b");
        a.activate();
        b.activate();

        for _ in 0..3 {
            b.tick().await.unwrap();
            a.tick().await.unwrap();
        }

        let paths = DiscoveryPaths::new(DiscoveryConfig::default().root);
        let view = read_established_view(store.as_ref(), &paths)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(view.leader_id, "a");
        assert_eq!(view.members.len(), 2);

        let topology = b.inner.parts.discovery.get_topology().await;
        assert!(topology.is_current());
        let leaders: Vec<&str> = topology
            .instances()
            .iter()
            .filter(|i| i.is_leader)
            .map(|i| i.sling_id.as_str())
            .collect();
        assert_eq!(leaders, vec!["a"]);
    }

    #[tokio::test]
    async fn test_duplicate_instance_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let first = handler(store.clone(), clock.clone(), "a");
        let second = handler(store, clock, "a");
        first.activate();
        second.activate();

        first.tick().await.unwrap();
        second.tick().await.unwrap();

        assert!(matches!(first.tick().await, Err(TickError::Fatal(_))));
        assert!(!first.is_active());
    }

    #[tokio::test]
    async fn test_store_outage_is_recoverable() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let a = handler(store.clone(), clock, "a");
        a.activate();
        a.tick().await.unwrap();

        store.set_offline(true);
        assert!(matches!(a.tick().await, Err(TickError::Recoverable(_))));
        assert!(a.is_active());
        assert!(!a.inner.parts.discovery.get_topology().await.is_current());
    }

    #[tokio::test]
    async fn test_tick_queued_behind_stop_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let a = Arc::new(handler(store.clone(), clock, "a"));
        a.activate();

        let guard = a.inner.tick_lock.lock().await;
        let ticker = a.clone();
        let queued = tokio::spawn(async move { ticker.tick().await });
        tokio::task::yield_now().await;

        a.stop().await.unwrap();
        drop(guard);
        queued.await.unwrap().unwrap();
        assert_eq!(store.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_inactive_tick_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let a = handler(store.clone(), clock, "a");
        a.tick().await.unwrap();
        assert_eq!(store.mutation_count(), 0);
    }
}
