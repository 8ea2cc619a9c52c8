mod announcement;
mod event;
mod instance;
mod topology;

pub use announcement::{Announcement, MAX_TTL_SECS, PROTOCOL_VERSION};
pub use event::{TopologyEvent, TopologyEventType, TopologyListener};
pub use instance::{ClusterView, InstanceDescription};
pub use topology::TopologyView;

/// Instance property listing the job topics an instance consumes.
pub const JOB_TOPICS_PROPERTY: &str = "beacon.jobs.topics";
