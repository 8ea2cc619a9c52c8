//! Topology connectors: announcements exchanged with instances outside
//! the local cluster.

mod announcements;
mod registry;
mod server;
mod transport;

pub use announcements::{AnnouncementRegistry, Registration};
pub use registry::{ConnectorInfo, ConnectorRegistry, ConnectorStatus};
pub use server::{connector_router, ConnectorServer, PingReply};
pub use transport::{ConnectorTransport, HttpConnectorTransport, CONNECTOR_PATH};
