//! Local cluster discovery over the shared store.

mod discovery;
mod handler;
mod heartbeat;
mod paths;
mod periodic;
mod view;
mod voting;

pub use discovery::DiscoveryService;
pub use handler::{HeartbeatHandler, HeartbeatParts};
pub use heartbeat::{HeartbeatOutcome, HeartbeatRecord, HeartbeatStore};
pub use paths::DiscoveryPaths;
pub use periodic::{PeriodicJob, TickError, TickFuture};
pub use view::{read_established_view, ClusterViewService, EstablishedView};
pub use voting::{VotingAction, VotingHandler, VotingRound, VotingState};
