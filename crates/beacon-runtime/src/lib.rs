pub mod cluster;
pub mod connector;
pub mod jobs;
pub mod node;
pub mod store;
pub mod testing;

pub use cluster::{DiscoveryService, HeartbeatHandler, PeriodicJob, TickError};
pub use connector::{connector_router, AnnouncementRegistry, ConnectorRegistry};
pub use jobs::{JobStorage, JobTopologyManager, MaintenanceTask, UpgradeTask};
pub use node::{BeaconNode, NodeBuilder, NodeHandle};
pub use store::{MemoryStore, PgResourceStore};
