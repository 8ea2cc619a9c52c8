use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::instance::{ClusterView, InstanceDescription};
use crate::error::{BeaconError, Result};

/// Wire protocol version of announcements.
pub const PROTOCOL_VERSION: u32 = 1;

/// Longest ttl an announcement may carry (one day).
pub const MAX_TTL_SECS: u64 = 86_400;

/// A time-limited claim by `owner_id` that the instances it lists are
/// reachable through it.
///
/// The same structure is posted by a connector client and returned by the
/// receiving side. Announcements that the owner itself received from
/// elsewhere travel along nested in `topology_announcements`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub owner_id: String,

    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,

    /// When the receiving side last registered or refreshed it.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub ttl_seconds: u64,

    /// True when this is the response half of a connector exchange.
    #[serde(default)]
    pub inherited: bool,

    #[serde(default, rename = "loop")]
    pub loop_detected: bool,

    #[serde(default)]
    pub server_info: Option<String>,

    #[serde(default)]
    pub local_cluster_view: Option<ClusterView>,

    #[serde(default)]
    pub topology_announcements: Vec<Announcement>,

    #[serde(default)]
    pub backoff_interval_secs: Option<u64>,

    #[serde(default)]
    pub reset_backoff: bool,
}

fn default_protocol_version() -> u32 {
    PROTOCOL_VERSION
}

impl Announcement {
    /// Create an empty announcement owned by `owner_id`.
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            protocol_version: PROTOCOL_VERSION,
            created_at: None,
            ttl_seconds: 0,
            inherited: false,
            loop_detected: false,
            server_info: None,
            local_cluster_view: None,
            topology_announcements: Vec::new(),
            backoff_interval_secs: None,
            reset_backoff: false,
        }
    }

    pub fn with_cluster_view(mut self, view: ClusterView) -> Self {
        self.local_cluster_view = Some(view);
        self
    }

    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    pub fn with_server_info(mut self, info: impl Into<String>) -> Self {
        self.server_info = Some(info.into());
        self
    }

    /// A response telling the sender that it is already attached.
    pub fn loop_response(owner_id: impl Into<String>) -> Self {
        let mut announcement = Self::new(owner_id);
        announcement.loop_detected = true;
        announcement.inherited = true;
        announcement
    }

    /// Structural validity; the owner must be part of its own cluster view
    /// and the ttl must not exceed [`MAX_TTL_SECS`].
    pub fn is_valid(&self) -> bool {
        if self.owner_id.is_empty() || self.protocol_version != PROTOCOL_VERSION {
            return false;
        }
        if self.ttl_seconds > MAX_TTL_SECS {
            return false;
        }
        if self.loop_detected {
            return true;
        }
        let Some(view) = &self.local_cluster_view else {
            return false;
        };
        if !view.contains(&self.owner_id) {
            return false;
        }
        self.topology_announcements.iter().all(Announcement::is_valid)
    }

    /// All instances reachable through this announcement, nested ones
    /// included. May contain duplicates.
    pub fn list_instances(&self) -> Vec<InstanceDescription> {
        let mut out = Vec::new();
        self.collect_instances(&mut out);
        out
    }

    fn collect_instances(&self, out: &mut Vec<InstanceDescription>) {
        if let Some(view) = &self.local_cluster_view {
            out.extend(view.instances.iter().cloned().map(|i| i.with_local(false)));
        }
        for nested in &self.topology_announcements {
            nested.collect_instances(out);
        }
    }

    /// Whether `sling_id` is reachable through this announcement.
    pub fn contains_instance(&self, sling_id: &str) -> bool {
        if self
            .local_cluster_view
            .as_ref()
            .is_some_and(|v| v.contains(sling_id))
        {
            return true;
        }
        self.topology_announcements
            .iter()
            .any(|a| a.contains_instance(sling_id))
    }

    /// Nest an announcement received by the owner.
    pub fn add_incoming(&mut self, incoming: Announcement) {
        self.topology_announcements.push(incoming);
    }

    /// Same content, ignoring timing and backoff fields.
    pub fn corresponds_to(&self, other: &Announcement) -> bool {
        self.normalized() == other.normalized()
    }

    fn normalized(&self) -> Announcement {
        let mut copy = self.clone();
        copy.created_at = None;
        copy.backoff_interval_secs = None;
        copy.reset_backoff = false;
        copy.topology_announcements = copy
            .topology_announcements
            .iter()
            .map(Announcement::normalized)
            .collect();
        copy
    }

    /// Whether the announcement outlived its ttl. A ttl too large to
    /// represent never expires.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let Some(created) = self.created_at else {
            return false;
        };
        let expires = i64::try_from(self.ttl_seconds)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|ttl| created.checked_add_signed(ttl));
        match expires {
            Some(expires) => expires < now,
            None => false,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(BeaconError::from)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| BeaconError::Serialization(format!("invalid announcement: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(id: &str, ids: &[&str]) -> ClusterView {
        ClusterView::new(
            id,
            ids.iter()
                .enumerate()
                .map(|(i, s)| InstanceDescription::new(*s).with_leader(i == 0))
                .collect(),
        )
    }

    #[test]
    fn test_validity() {
        let valid = Announcement::new("x").with_cluster_view(cluster("c", &["x", "y"]));
        assert!(valid.is_valid());

        let foreign_owner = Announcement::new("z").with_cluster_view(cluster("c", &["x"]));
        assert!(!foreign_owner.is_valid());

        let no_view = Announcement::new("x");
        assert!(!no_view.is_valid());

        assert!(Announcement::loop_response("x").is_valid());

        let endless = Announcement::new("x")
            .with_cluster_view(cluster("c", &["x"]))
            .with_ttl(MAX_TTL_SECS + 1);
        assert!(!endless.is_valid());
    }

    #[test]
    fn test_nested_instances() {
        let mut outer = Announcement::new("x").with_cluster_view(cluster("c1", &["x"]));
        outer.add_incoming(Announcement::new("p").with_cluster_view(cluster("c2", &["p", "q"])));

        let ids: Vec<String> = outer
            .list_instances()
            .into_iter()
            .map(|i| i.sling_id)
            .collect();
        assert_eq!(ids, vec!["x", "p", "q"]);
        assert!(outer.contains_instance("q"));
        assert!(!outer.contains_instance("r"));
    }

    #[test]
    fn test_corresponds_ignores_timing() {
        let a = Announcement::new("x").with_cluster_view(cluster("c", &["x"]));
        let mut b = a.clone();
        b.created_at = Some(Utc::now());
        b.backoff_interval_secs = Some(30);
        assert!(a.corresponds_to(&b));

        b.local_cluster_view = Some(cluster("c", &["x", "y"]));
        assert!(!a.corresponds_to(&b));
    }

    #[test]
    fn test_json_wire_names() {
        let mut a = Announcement::loop_response("x");
        a.backoff_interval_secs = Some(5);
        let json = a.to_json().unwrap();
        assert!(json.contains("\"ownerId\":\"x\""));
        assert!(json.contains("\"loop\":true"));
        assert!(json.contains("\"backoffIntervalSecs\":5"));
        assert_eq!(Announcement::from_json(&json).unwrap(), a);
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let mut a = Announcement::new("x").with_ttl(10);
        assert!(!a.is_expired(now));
        a.created_at = Some(now - chrono::Duration::seconds(11));
        assert!(a.is_expired(now));
    }

    #[test]
    fn test_huge_ttl_never_expires() {
        let now = Utc::now();
        let mut a = Announcement::new("x").with_ttl(10_000_000_000_000_000);
        a.created_at = Some(now);
        assert!(!a.is_expired(now + chrono::Duration::days(365)));

        a.ttl_seconds = u64::MAX;
        assert!(!a.is_expired(now));
    }
}
