use std::fmt;
use std::sync::Arc;

use super::topology::TopologyView;

/// Kind of topology event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopologyEventType {
    /// First defined view after startup.
    Init,
    /// The view became undefined; a change is in progress.
    Changing,
    /// Membership, leadership or cluster assignment changed.
    Changed,
    /// Only instance properties changed.
    PropertiesChanged,
}

impl TopologyEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "TOPOLOGY_INIT",
            Self::Changing => "TOPOLOGY_CHANGING",
            Self::Changed => "TOPOLOGY_CHANGED",
            Self::PropertiesChanged => "PROPERTIES_CHANGED",
        }
    }
}

impl fmt::Display for TopologyEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A topology transition delivered to listeners.
#[derive(Debug, Clone)]
pub struct TopologyEvent {
    pub event_type: TopologyEventType,
    pub old_view: Option<Arc<TopologyView>>,
    pub new_view: Option<Arc<TopologyView>>,
}

impl TopologyEvent {
    /// The first event, carrying the first current view.
    pub fn init(new_view: Arc<TopologyView>) -> Self {
        Self {
            event_type: TopologyEventType::Init,
            old_view: None,
            new_view: Some(new_view),
        }
    }

    /// The current view became undefined.
    pub fn changing(old_view: Arc<TopologyView>) -> Self {
        Self {
            event_type: TopologyEventType::Changing,
            old_view: Some(old_view),
            new_view: None,
        }
    }

    pub fn changed(
        event_type: TopologyEventType,
        old_view: Arc<TopologyView>,
        new_view: Arc<TopologyView>,
    ) -> Self {
        Self {
            event_type,
            old_view: Some(old_view),
            new_view: Some(new_view),
        }
    }
}

/// Receiver of topology notifications.
///
/// Callbacks run on the heartbeat task and must not block.
pub trait TopologyListener: Send + Sync {
    fn on_topology_changed(&self, event: &TopologyEvent);

    /// This instance lost sight of its own heartbeat. Called once per
    /// isolation episode.
    fn on_isolated_from_topology(&self) {}
}
