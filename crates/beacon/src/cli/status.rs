use std::sync::Arc;

use anyhow::Result;
use beacon::{open_store, BeaconConfig};
use beacon_core::store::ResourceStore;
use beacon_core::time::{Clock, SystemClock};
use beacon_runtime::cluster::{read_established_view, DiscoveryPaths, HeartbeatStore};
use clap::Parser;
use console::style;
use serde_json::{json, Value};

use super::load_config;

/// Show the instances and the established view recorded in the store.
#[derive(Parser)]
pub struct StatusCommand {
    /// Configuration file path.
    #[arg(short, long, default_value = "beacon.toml")]
    pub config: String,

    /// Print machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusCommand {
    /// Execute the status command.
    pub async fn execute(self) -> Result<()> {
        dotenvy::dotenv().ok();

        let config = load_config(&self.config)?;
        let store = open_store(&config).await?;
        let status = collect_status(store, &config, Arc::new(SystemClock)).await?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&status)?);
        } else {
            print_status(&status);
        }
        Ok(())
    }
}

async fn collect_status(
    store: Arc<dyn ResourceStore>,
    config: &BeaconConfig,
    clock: Arc<dyn Clock>,
) -> Result<Value> {
    let paths = DiscoveryPaths::new(config.discovery.root.clone());
    let heartbeats = HeartbeatStore::new(
        store.clone(),
        paths.clone(),
        clock.clone(),
        "beacon-status",
        config.discovery.heartbeat_timeout(),
    );

    let mut records = heartbeats.read_records().await?;
    records.sort_by(|a, b| a.sling_id.cmp(&b.sling_id));
    let now = clock.now();
    let instances: Vec<Value> = records
        .iter()
        .map(|r| {
            json!({
                "slingId": r.sling_id,
                "lastHeartbeat": r.last_heartbeat.to_rfc3339(),
                "ageSecs": r.age(now).num_seconds(),
                "alive": heartbeats.is_fresh(r),
                "runtimeId": r.runtime_id,
                "endpoints": r.endpoints,
                "properties": r.properties,
            })
        })
        .collect();

    let view = read_established_view(store.as_ref(), &paths).await?.map(|v| {
        json!({
            "viewId": v.view_id,
            "leaderId": v.leader_id,
            "members": v.members,
            "promotedAt": v.promoted_at.map(|t| t.to_rfc3339()),
            "promotedBy": v.promoted_by,
        })
    });

    Ok(json!({
        "instances": instances,
        "establishedView": view,
    }))
}

fn print_status(status: &Value) {
    println!();
    println!("  {}", style("Instances").bold());
    let instances = status["instances"].as_array().cloned().unwrap_or_default();
    if instances.is_empty() {
        println!("    {}", style("none").dim());
    }
    for instance in &instances {
        let id = instance["slingId"].as_str().unwrap_or_default();
        let age = instance["ageSecs"].as_i64().unwrap_or_default();
        if instance["alive"].as_bool().unwrap_or(false) {
            println!("    {} {} ({}s ago)", style("●").green(), id, age);
        } else {
            println!("    {} {} ({}s ago, stale)", style("●").red(), id, age);
        }
    }

    println!();
    println!("  {}", style("Established view").bold());
    match status["establishedView"].as_object() {
        Some(view) => {
            println!("    id:      {}", view["viewId"].as_str().unwrap_or_default());
            println!(
                "    leader:  {}",
                style(view["leaderId"].as_str().unwrap_or_default()).cyan()
            );
            let members: Vec<&str> = view["members"]
                .as_array()
                .map(|m| m.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            println!("    members: {}", members.join(", "));
        }
        None => println!("    {}", style("none").dim()),
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use beacon_core::time::ManualClock;
    use beacon_runtime::MemoryStore;

    #[tokio::test]
    async fn test_collect_status_lists_instances() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let config = BeaconConfig::default();
        let paths = DiscoveryPaths::new(config.discovery.root.clone());

        for id in ["b", "a"] {
            HeartbeatStore::new(store.clone(), paths.clone(), clock.clone(), id, Duration::from_secs(15))
                .write_heartbeat(&[], &BTreeMap::new())
                .await
                .unwrap();
        }
        clock.advance(Duration::from_secs(600));
        HeartbeatStore::new(store.clone(), paths, clock.clone(), "a", Duration::from_secs(15))
            .write_heartbeat(&[], &BTreeMap::new())
            .await
            .unwrap();

        let status = collect_status(store, &config, clock).await.unwrap();
        let instances = status["instances"].as_array().unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0]["slingId"], "a");
        assert_eq!(instances[0]["alive"], true);
        assert_eq!(instances[1]["slingId"], "b");
        assert_eq!(instances[1]["alive"], false);
        assert!(status["establishedView"].is_null());
    }
}
