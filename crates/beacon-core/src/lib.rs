pub mod cluster;
pub mod config;
pub mod error;
pub mod job;
pub mod store;
pub mod time;

pub use config::BeaconConfig;
pub use error::{BeaconError, Result, StoreError, StoreResult, UndefinedClusterView, UndefinedReason};
pub use time::{Clock, ManualClock, SystemClock};
