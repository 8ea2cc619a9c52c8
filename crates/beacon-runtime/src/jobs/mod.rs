//! Job storage and topology-driven redistribution.

mod capabilities;
mod maintenance;
mod manager;
mod queues;
mod storage;
mod upgrade;

pub use capabilities::TopologyCapabilities;
pub use maintenance::{MaintenanceReport, MaintenanceTask};
pub use manager::JobTopologyManager;
pub use queues::QueueConfigurationManager;
pub use storage::{JobCursor, JobStorage};
pub use upgrade::{encode_legacy_properties, UpgradeReport, UpgradeTask};
