use std::sync::{Arc, Mutex, RwLock};

use beacon_core::cluster::{
    InstanceDescription, TopologyEvent, TopologyEventType, TopologyListener, TopologyView,
};

use super::view::ClusterViewService;
use crate::connector::AnnouncementRegistry;

struct DiscoveryState {
    /// Last successfully computed view, served while newer ones fail.
    old_view: Arc<TopologyView>,
    isolated: bool,
    /// Last view delivered to listeners in an Init or Changed event.
    last_announced: Option<Arc<TopologyView>>,
    changing_sent: bool,
}

/// Topology as seen from this instance: the local cluster plus every
/// instance reachable through announcements.
///
/// `get_topology` never fails. When the local cluster view cannot be
/// determined it returns the last good view marked as not current.
pub struct DiscoveryService {
    views: Arc<ClusterViewService>,
    announcements: Arc<AnnouncementRegistry>,
    state: Mutex<DiscoveryState>,
    listeners: RwLock<Vec<Arc<dyn TopologyListener>>>,
}

impl DiscoveryService {
    /// Create a discovery service for the given local instance.
    pub fn new(
        views: Arc<ClusterViewService>,
        announcements: Arc<AnnouncementRegistry>,
        local: InstanceDescription,
    ) -> Self {
        Self {
            views,
            announcements,
            state: Mutex::new(DiscoveryState {
                old_view: Arc::new(TopologyView::isolated(local)),
                isolated: false,
                last_announced: None,
                changing_sent: false,
            }),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener. It receives an Init event right away when a
    /// current topology has already been announced.
    pub fn add_listener(&self, listener: Arc<dyn TopologyListener>) {
        let init = self.state.lock().ok().and_then(|state| {
            state
                .last_announced
                .clone()
                .filter(|v| !state.changing_sent && v.is_current())
        });
        if let Some(view) = init {
            listener.on_topology_changed(&TopologyEvent::init(view));
        }
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(listener);
        }
    }

    /// The current topology, or the last known one marked as old.
    pub async fn get_topology(&self) -> Arc<TopologyView> {
        match self.views.local_cluster_view().await {
            Ok(local) => {
                let remote = self.announcements.list_instances(&local).await;
                let view = Arc::new(TopologyView::new(local, remote));
                if let Ok(mut state) = self.state.lock() {
                    state.old_view = view.clone();
                    state.isolated = false;
                }
                view
            }
            Err(undefined) => {
                let (view, newly_isolated) = match self.state.lock() {
                    Ok(mut state) => {
                        state.old_view.mark_old();
                        let newly_isolated = undefined.is_isolation() && !state.isolated;
                        if undefined.is_isolation() {
                            state.isolated = true;
                        }
                        (state.old_view.clone(), newly_isolated)
                    }
                    Err(poisoned) => (poisoned.into_inner().old_view.clone(), false),
                };

                tracing::debug!("Serving last known topology: {}", undefined);
                if newly_isolated {
                    tracing::warn!("Isolated from topology: {}", undefined.message);
                    for listener in self.listeners() {
                        listener.on_isolated_from_topology();
                    }
                }
                view
            }
        }
    }

    /// Compare the latest topology to the last announced one and notify
    /// listeners. Returns the events sent.
    pub async fn handle_potential_topology_change(&self) -> Vec<TopologyEvent> {
        let view = self.get_topology().await;

        let events = {
            let Ok(mut state) = self.state.lock() else {
                return Vec::new();
            };
            let mut events = Vec::new();
            if view.is_current() {
                match state.last_announced.clone() {
                    None => events.push(TopologyEvent::init(view.clone())),
                    Some(last) if state.changing_sent => events.push(TopologyEvent::changed(
                        TopologyEventType::Changed,
                        last,
                        view.clone(),
                    )),
                    Some(last) => {
                        if let Some(kind) = view.compare(&last) {
                            events.push(TopologyEvent::changed(kind, last, view.clone()));
                        }
                    }
                }
                state.last_announced = Some(view);
                state.changing_sent = false;
            } else if let Some(last) = state.last_announced.clone() {
                if !state.changing_sent {
                    events.push(TopologyEvent::changing(last));
                    state.changing_sent = true;
                }
            }
            events
        };

        let listeners = self.listeners();
        for event in &events {
            tracing::info!(event = %event.event_type, listeners = listeners.len(), "Sending topology event");
            for listener in &listeners {
                listener.on_topology_changed(event);
            }
        }
        events
    }

    fn listeners(&self) -> Vec<Arc<dyn TopologyListener>> {
        self.listeners
            .read()
            .map(|l| l.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{DiscoveryPaths, HeartbeatStore, VotingHandler};
    use crate::store::MemoryStore;
    use beacon_core::cluster::{Announcement, ClusterView};
    use beacon_core::config::TieBreak;
    use beacon_core::time::ManualClock;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<TopologyEventType>>,
        isolations: AtomicUsize,
    }

    impl Recorder {
        fn events(&self) -> Vec<TopologyEventType> {
            self.events.lock().unwrap().clone()
        }
    }

    impl TopologyListener for Recorder {
        fn on_topology_changed(&self, event: &TopologyEvent) {
            self.events.lock().unwrap().push(event.event_type);
        }

        fn on_isolated_from_topology(&self) {
            self.isolations.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        heartbeats: Arc<HeartbeatStore>,
        voting: VotingHandler,
        announcements: Arc<AnnouncementRegistry>,
        discovery: DiscoveryService,
        recorder: Arc<Recorder>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let clock = Arc::new(ManualClock::default());
            let paths = DiscoveryPaths::new("/discovery");
            let heartbeats = Arc::new(HeartbeatStore::new(
                store.clone(),
                paths.clone(),
                clock.clone(),
                "a",
                Duration::from_secs(15),
            ));
            let voting = VotingHandler::new(
                store.clone(),
                paths.clone(),
                clock.clone(),
                "a",
                TieBreak::Lexicographic,
                Duration::from_secs(60),
            );
            let views = Arc::new(ClusterViewService::new(
                heartbeats.clone(),
                store.clone(),
                paths.clone(),
            ));
            let announcements = Arc::new(AnnouncementRegistry::new(
                store.clone(),
                paths,
                clock.clone(),
                "a",
                30,
            ));
            let discovery =
                DiscoveryService::new(views, announcements.clone(), InstanceDescription::new("a"));
            let recorder = Arc::new(Recorder::default());
            discovery.add_listener(recorder.clone());

            Self {
                store,
                clock,
                heartbeats,
                voting,
                announcements,
                discovery,
                recorder,
            }
        }

        async fn beat(&self, properties: &[(&str, &str)]) {
            let props: BTreeMap<String, String> = properties
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            self.heartbeats.write_heartbeat(&[], &props).await.unwrap();
            let live: BTreeSet<String> = ["a".to_string()].into_iter().collect();
            self.voting.analyze_votings(&live).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_initial_view_is_isolated_and_old() {
        let fx = Fixture::new();
        let view = fx.discovery.get_topology().await;
        assert!(!view.is_current());
        assert_eq!(view.instances().len(), 1);
        assert!(view.local_instance().is_some_and(|i| i.is_leader));
    }

    #[tokio::test]
    async fn test_failures_return_same_cached_view() {
        let fx = Fixture::new();
        fx.beat(&[]).await;
        let good = fx.discovery.get_topology().await;
        assert!(good.is_current());

        fx.store.set_offline(true);
        let first = fx.discovery.get_topology().await;
        let second = fx.discovery.get_topology().await;
        let third = fx.discovery.get_topology().await;
        assert!(Arc::ptr_eq(&first, &good));
        assert!(Arc::ptr_eq(&second, &good));
        assert!(Arc::ptr_eq(&third, &good));
        assert!(!third.is_current());
        assert_eq!(fx.recorder.isolations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_isolation_callback_once_per_episode() {
        let fx = Fixture::new();
        fx.beat(&[]).await;
        fx.discovery.get_topology().await;

        fx.clock.advance(Duration::from_secs(20));
        fx.discovery.get_topology().await;
        fx.discovery.get_topology().await;
        assert_eq!(fx.recorder.isolations.load(Ordering::SeqCst), 1);

        fx.beat(&[]).await;
        assert!(fx.discovery.get_topology().await.is_current());

        fx.clock.advance(Duration::from_secs(20));
        fx.discovery.get_topology().await;
        assert_eq!(fx.recorder.isolations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_event_sequence() {
        let fx = Fixture::new();

        assert!(fx.discovery.handle_potential_topology_change().await.is_empty());

        fx.beat(&[]).await;
        fx.discovery.handle_potential_topology_change().await;
        fx.discovery.handle_potential_topology_change().await;
        assert_eq!(fx.recorder.events(), vec![TopologyEventType::Init]);

        fx.beat(&[("region", "eu")]).await;
        fx.discovery.handle_potential_topology_change().await;

        fx.store.set_offline(true);
        fx.discovery.handle_potential_topology_change().await;
        fx.discovery.handle_potential_topology_change().await;
        fx.store.set_offline(false);
        fx.discovery.handle_potential_topology_change().await;

        assert_eq!(
            fx.recorder.events(),
            vec![
                TopologyEventType::Init,
                TopologyEventType::PropertiesChanged,
                TopologyEventType::Changing,
                TopologyEventType::Changed,
            ]
        );
    }

    #[tokio::test]
    async fn test_late_listener_gets_init() {
        let fx = Fixture::new();
        fx.beat(&[]).await;
        fx.discovery.handle_potential_topology_change().await;

        let late = Arc::new(Recorder::default());
        fx.discovery.add_listener(late.clone());
        assert_eq!(late.events(), vec![TopologyEventType::Init]);
    }

    #[tokio::test]
    async fn test_announced_instances_are_merged() {
        let fx = Fixture::new();
        fx.beat(&[]).await;
        let remote = Announcement::new("r1").with_cluster_view(ClusterView::new(
            "remote",
            vec![InstanceDescription::new("r1").with_leader(true)],
        ));
        fx.announcements.register_announcement(remote).await.unwrap();

        let view = fx.discovery.get_topology().await;
        let ids: Vec<&str> = view.instances().iter().map(|i| i.sling_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "r1"]);
        assert_eq!(view.cluster_ids().len(), 2);
        assert_eq!(view.instances().iter().filter(|i| i.is_local).count(), 1);
    }
}
