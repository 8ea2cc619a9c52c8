#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use beacon_core::config::BeaconConfig;
use beacon_core::time::ManualClock;
use beacon_runtime::testing::ScriptedTransport;
use beacon_runtime::{BeaconNode, MemoryStore};

pub struct Cluster {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub transport: Arc<ScriptedTransport>,
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            clock: Arc::new(ManualClock::default()),
            transport: Arc::new(ScriptedTransport::new()),
        }
    }

    /// An activated node without background heartbeat; tests drive ticks.
    pub fn node(&self, id: &str, configure: impl FnOnce(&mut BeaconConfig)) -> Arc<BeaconNode> {
        let mut config = BeaconConfig::default();
        config.instance.sling_id = Some(id.to_string());
        config.jobs.root = "/jobs".into();
        configure(&mut config);

        let node = BeaconNode::builder(config)
            .with_store(self.store.clone())
            .with_clock(self.clock.clone())
            .with_transport(self.transport.clone())
            .build()
            .unwrap();
        node.heartbeat().activate();
        Arc::new(node)
    }

    pub fn advance(&self, secs: u64) {
        self.clock.advance(Duration::from_secs(secs));
    }
}

/// Spawn the job topology manager of `node`.
pub fn spawn_job_manager(node: &Arc<BeaconNode>) -> tokio::task::JoinHandle<()> {
    let manager = node.job_manager().clone();
    tokio::spawn(async move { manager.run().await })
}

/// Tick all nodes until every one of them sees a current topology with
/// `expected` members.
pub async fn converge(nodes: &[&Arc<BeaconNode>], expected: usize) {
    for _ in 0..10 {
        for node in nodes {
            node.heartbeat().tick().await.unwrap();
        }
        let mut settled = true;
        for node in nodes {
            let topology = node.get_topology().await;
            settled &= topology.is_current() && topology.local_cluster().instances.len() == expected;
        }
        if settled {
            return;
        }
    }
    panic!("cluster did not converge to {} members", expected);
}

/// Poll `check` until it holds, yielding to background tasks in between.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
