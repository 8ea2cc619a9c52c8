use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use beacon_core::cluster::{Announcement, ClusterView};
use beacon_core::config::ConnectorConfig;
use beacon_core::time::{add_saturating, Clock};

use super::announcements::{AnnouncementRegistry, Registration};
use super::transport::ConnectorTransport;
use crate::cluster::ClusterViewService;

/// Health of one outgoing connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorStatus {
    /// Not pinged yet.
    Pending,
    Connected,
    Unreachable,
    /// The peer already sees our instances through another path.
    Looping,
    /// Looped back into the local cluster and was switched off.
    Stopped,
}

impl ConnectorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Connected => "connected",
            Self::Unreachable => "unreachable",
            Self::Looping => "looping",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ConnectorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of an outgoing connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorInfo {
    pub url: String,
    pub status: ConnectorStatus,
    pub failures: u32,
    pub next_ping_at: Option<DateTime<Utc>>,
    pub remote_owner: Option<String>,
}

struct ConnectorState {
    url: String,
    status: ConnectorStatus,
    failures: u32,
    backoff_until: Option<DateTime<Utc>>,
    warned: bool,
    remote_owner: Option<String>,
}

impl ConnectorState {
    fn new(url: String) -> Self {
        Self {
            url,
            status: ConnectorStatus::Pending,
            failures: 0,
            backoff_until: None,
            warned: false,
            remote_owner: None,
        }
    }

    fn info(&self) -> ConnectorInfo {
        ConnectorInfo {
            url: self.url.clone(),
            status: self.status,
            failures: self.failures,
            next_ping_at: self.backoff_until,
            remote_owner: self.remote_owner.clone(),
        }
    }
}

/// Outgoing topology connectors.
///
/// Each ping posts our local cluster view, plus the announcements held in
/// the local cluster, to the peer and registers its answer as an inherited
/// announcement. Failures back off per connector and are never returned
/// to the caller.
pub struct ConnectorRegistry {
    transport: Arc<dyn ConnectorTransport>,
    announcements: Arc<AnnouncementRegistry>,
    views: Arc<ClusterViewService>,
    clock: Arc<dyn Clock>,
    config: ConnectorConfig,
    base_interval: Duration,
    server_info: Option<String>,
    connectors: Mutex<Vec<ConnectorState>>,
}

impl ConnectorRegistry {
    /// Create a connector registry with one entry per configured url.
    pub fn new(
        transport: Arc<dyn ConnectorTransport>,
        announcements: Arc<AnnouncementRegistry>,
        views: Arc<ClusterViewService>,
        clock: Arc<dyn Clock>,
        config: ConnectorConfig,
        base_interval: Duration,
    ) -> Self {
        let connectors = config.urls.iter().cloned().map(ConnectorState::new).collect();
        Self {
            transport,
            announcements,
            views,
            clock,
            config,
            base_interval,
            server_info: None,
            connectors: Mutex::new(connectors),
        }
    }

    /// Server info sent with every outgoing announcement.
    pub fn with_server_info(mut self, info: impl Into<String>) -> Self {
        self.server_info = Some(info.into());
        self
    }

    /// Add an outgoing connector; false if the url is already registered.
    pub async fn register_outgoing(&self, url: impl Into<String>) -> bool {
        let url = url.into();
        let mut connectors = self.connectors.lock().await;
        if connectors.iter().any(|c| c.url == url) {
            return false;
        }
        tracing::info!(connector = %url, "Registered outgoing connector");
        connectors.push(ConnectorState::new(url));
        true
    }

    /// Stop pinging `url`. Returns false if it was not registered.
    pub async fn unregister_outgoing(&self, url: &str) -> bool {
        let mut connectors = self.connectors.lock().await;
        let before = connectors.len();
        connectors.retain(|c| c.url != url);
        connectors.len() != before
    }

    /// Snapshot of all outgoing connectors.
    pub async fn list_outgoing(&self) -> Vec<ConnectorInfo> {
        self.connectors
            .lock()
            .await
            .iter()
            .map(ConnectorState::info)
            .collect()
    }

    /// Ping every connector whose backoff elapsed, or all of them when
    /// `force` is set. Returns the number of pings sent.
    pub async fn ping_outgoing_connectors(&self, force: bool) -> usize {
        let mut connectors = self.connectors.lock().await;
        if connectors.is_empty() {
            return 0;
        }

        let local_view = match self.views.local_cluster_view().await {
            Ok(view) => view,
            Err(e) => {
                tracing::debug!("Skipping connector pings: {}", e);
                return 0;
            }
        };

        let mut sent = 0;
        for connector in connectors.iter_mut() {
            if connector.status == ConnectorStatus::Stopped {
                continue;
            }
            if force {
                connector.failures = 0;
                connector.backoff_until = None;
            } else if connector
                .backoff_until
                .is_some_and(|until| until > self.clock.now())
            {
                tracing::debug!(connector = %connector.url, "Connector backing off");
                continue;
            }

            self.ping(connector, &local_view).await;
            sent += 1;
        }
        sent
    }

    async fn ping(&self, connector: &mut ConnectorState, local_view: &ClusterView) {
        let mut announcement = Announcement::new(self.views.sling_id())
            .with_cluster_view(local_view.clone())
            .with_ttl(self.config.announcement_ttl_secs);
        announcement.server_info = self.server_info.clone();
        if let Err(e) = self
            .announcements
            .add_all_except(&mut announcement, local_view, connector.remote_owner.as_deref())
            .await
        {
            tracing::warn!(connector = %connector.url, "Failed to collect incoming announcements: {}", e);
        }

        match self.transport.ping(&connector.url, &announcement).await {
            Ok(Some(reply)) => self.handle_reply(connector, local_view, reply).await,
            Ok(None) => self.mark_connected(connector, None),
            Err(e) => self.handle_failure(connector, &e.to_string()),
        }
    }

    async fn handle_reply(
        &self,
        connector: &mut ConnectorState,
        local_view: &ClusterView,
        mut reply: Announcement,
    ) {
        if reply.loop_detected {
            let local_loop =
                reply.owner_id == self.views.sling_id() || local_view.contains(&reply.owner_id);
            if local_loop && self.config.auto_stop_local_loops {
                tracing::info!(connector = %connector.url, "Connector loops back into the local cluster, stopping it");
                connector.status = ConnectorStatus::Stopped;
            } else {
                tracing::debug!(connector = %connector.url, "Connector reported a loop");
                connector.status = ConnectorStatus::Looping;
                connector.backoff_until = self.backoff_from_reply(&reply);
            }
            return;
        }

        let backoff = self.backoff_from_reply(&reply);
        reply.inherited = true;
        let owner = reply.owner_id.clone();
        match self.announcements.register_announcement(reply).await {
            Ok(Registration::Registered | Registration::Refreshed) => {
                self.mark_connected(connector, Some(owner));
                connector.backoff_until = backoff;
            }
            Ok(Registration::AlreadyAttached) => {
                connector.status = ConnectorStatus::Looping;
                connector.backoff_until = backoff;
            }
            Ok(Registration::Invalid) => {
                self.handle_failure(connector, "peer answered with an invalid announcement")
            }
            Err(e) => self.handle_failure(connector, &e.to_string()),
        }
    }

    fn mark_connected(&self, connector: &mut ConnectorState, owner: Option<String>) {
        if connector.status == ConnectorStatus::Unreachable {
            tracing::info!(connector = %connector.url, "Connector reachable again");
        }
        connector.status = ConnectorStatus::Connected;
        connector.failures = 0;
        connector.backoff_until = None;
        connector.warned = false;
        if owner.is_some() {
            connector.remote_owner = owner;
        }
    }

    fn handle_failure(&self, connector: &mut ConnectorState, reason: &str) {
        connector.status = ConnectorStatus::Unreachable;
        connector.failures = connector.failures.saturating_add(1);
        let delay = self.failure_backoff(connector.failures);
        connector.backoff_until = Some(add_saturating(self.clock.now(), delay));

        if connector.warned {
            tracing::debug!(connector = %connector.url, failures = connector.failures, "Ping failed: {}", reason);
        } else {
            tracing::warn!(connector = %connector.url, "Ping failed: {}", reason);
            connector.warned = true;
        }
    }

    /// Exponential backoff starting at the heartbeat interval.
    fn failure_backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.base_interval
            .saturating_mul(1u32 << exponent)
            .min(self.config.backoff_max())
    }

    fn backoff_from_reply(&self, reply: &Announcement) -> Option<DateTime<Utc>> {
        if reply.reset_backoff {
            return None;
        }
        let secs = reply.backoff_interval_secs.filter(|s| *s > 0)?;
        let delay = Duration::from_secs(secs).min(self.config.backoff_max());
        Some(add_saturating(self.clock.now(), delay))
    }
}
