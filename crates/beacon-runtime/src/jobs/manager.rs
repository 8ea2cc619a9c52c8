use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex, Notify};

use beacon_core::cluster::{TopologyEvent, TopologyEventType, TopologyListener};
use beacon_core::job::QueueConfiguration;

use super::capabilities::TopologyCapabilities;
use super::maintenance::{MaintenanceReport, MaintenanceTask};
use super::queues::QueueConfigurationManager;
use super::upgrade::UpgradeTask;

/// Shortest period of the maintenance ticker.
const MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Keeps job distribution in step with the topology.
///
/// Topology callbacks only flip flags or enqueue events; the maintenance
/// passes they cause run on the task driving [`run`](Self::run).
pub struct JobTopologyManager {
    maintenance: MaintenanceTask,
    upgrade: UpgradeTask,
    queues: Arc<QueueConfigurationManager>,
    interval: Duration,
    capabilities: RwLock<Option<Arc<TopologyCapabilities>>>,
    change_count: AtomicU64,
    upgraded: AtomicBool,
    events_tx: mpsc::UnboundedSender<TopologyEvent>,
    events_rx: Mutex<mpsc::UnboundedReceiver<TopologyEvent>>,
    trigger: Notify,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl JobTopologyManager {
    /// Create a job topology manager; call [`run`](Self::run) to process events.
    pub fn new(
        maintenance: MaintenanceTask,
        upgrade: UpgradeTask,
        queues: Arc<QueueConfigurationManager>,
        interval: Duration,
    ) -> Self {
        let interval = interval.max(MIN_INTERVAL);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            maintenance,
            upgrade,
            queues,
            interval,
            capabilities: RwLock::new(None),
            change_count: AtomicU64::new(0),
            upgraded: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(events_rx),
            trigger: Notify::new(),
            running: AtomicBool::new(false),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Whether [`run`](Self::run) is looping.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Capabilities of the current topology, if one is known and active.
    pub fn current_capabilities(&self) -> Option<Arc<TopologyCapabilities>> {
        self.capabilities
            .read()
            .ok()
            .and_then(|caps| caps.clone())
            .filter(|caps| caps.is_active())
    }

    /// Replace the queue configuration and schedule a maintenance pass.
    pub fn update_queues(&self, queues: Vec<QueueConfiguration>) {
        self.queues.update(queues);
        self.trigger.notify_one();
    }

    /// Stop the loop driven by [`run`](Self::run).
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.running.store(false, Ordering::SeqCst);
    }

    /// Process topology events, periodic passes and queue updates until
    /// stopped.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut events = self.events_rx.lock().await;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => self.process_event(event).await,
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    self.maintain().await;
                }
                _ = self.trigger.notified() => {
                    self.maintain().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Job topology manager shutting down");
                        break;
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
    }

    fn deactivate_current(&self) {
        if let Ok(caps) = self.capabilities.read() {
            if let Some(caps) = caps.as_ref() {
                caps.deactivate();
            }
        }
    }

    /// Apply one topology event: rebuild capabilities when the view
    /// brought a relevant change, migrate legacy jobs on the first view
    /// and run a maintenance pass.
    pub async fn process_event(&self, event: TopologyEvent) {
        if event.event_type == TopologyEventType::Changing {
            self.deactivate_current();
            return;
        }
        let Some(view) = event.new_view.as_ref() else {
            return;
        };

        let count = self.change_count.load(Ordering::SeqCst) + 1;
        let candidate = Arc::new(TopologyCapabilities::new(view, count));
        let replaced = match self.capabilities.write() {
            Ok(mut current) => {
                let unchanged = current
                    .as_ref()
                    .is_some_and(|c| c.is_active() && c.is_same(&candidate));
                if unchanged {
                    false
                } else {
                    if let Some(old) = current.replace(candidate.clone()) {
                        old.deactivate();
                    }
                    self.change_count.store(count, Ordering::SeqCst);
                    true
                }
            }
            Err(_) => false,
        };
        if !replaced {
            return;
        }

        tracing::debug!(
            event = %event.event_type,
            leader = candidate.is_leader(),
            change_count = count,
            "Job topology capabilities updated"
        );

        if candidate.is_leader() && !self.upgraded.load(Ordering::SeqCst) {
            match self.upgrade.run(&candidate).await {
                Ok(report) if !report.aborted && report.failed == 0 => {
                    self.upgraded.store(true, Ordering::SeqCst);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Failed to migrate legacy jobs: {}", e),
            }
        }

        self.run_pass(&candidate).await;
    }

    /// A maintenance pass over the current capabilities.
    pub async fn maintain(&self) -> Option<MaintenanceReport> {
        let caps = self.current_capabilities()?;
        self.run_pass(&caps).await
    }

    async fn run_pass(&self, caps: &TopologyCapabilities) -> Option<MaintenanceReport> {
        match self.maintenance.run_cycle(caps).await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::warn!("Failed to run job maintenance: {}", e);
                None
            }
        }
    }
}

impl TopologyListener for JobTopologyManager {
    fn on_topology_changed(&self, event: &TopologyEvent) {
        if event.event_type == TopologyEventType::Changing {
            self.deactivate_current();
        }
        if self.events_tx.send(event.clone()).is_err() {
            tracing::debug!(event = %event.event_type, "Job topology manager is gone, dropping event");
        }
    }

    fn on_isolated_from_topology(&self) {
        tracing::info!("Isolated from topology, suspending job maintenance");
        self.deactivate_current();
    }
}
