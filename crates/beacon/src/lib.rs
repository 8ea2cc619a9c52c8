//! Beacon: cluster topology discovery and job redistribution over a
//! shared resource store.
//!
//! The [`Beacon`] runtime turns a [`BeaconConfig`] into a running node
//! with its store, connector transport and inbound connector endpoint.

mod runtime;

pub use beacon_core::BeaconConfig;
pub use beacon_runtime::{BeaconNode, NodeHandle};
pub use runtime::{init_logging, open_store, Beacon, BeaconBuilder};
