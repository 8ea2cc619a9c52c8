use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use uuid::Uuid;

use beacon_core::error::StoreResult;
use beacon_core::store::{Properties, Resource, ResourceStore, Session};
use beacon_core::time::{chrono_duration, Clock};

use super::paths::DiscoveryPaths;

const LAST_HEARTBEAT: &str = "lastHeartbeat";
const RUNTIME_ID: &str = "runtimeId";
const ENDPOINTS: &str = "endpoints";
const PROPERTIES: &str = "properties";

/// Liveness record of one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatRecord {
    pub sling_id: String,
    pub last_heartbeat: DateTime<Utc>,
    pub runtime_id: Option<String>,
    pub endpoints: Vec<String>,
    pub properties: BTreeMap<String, String>,
}

impl HeartbeatRecord {
    fn from_resource(resource: &Resource) -> Option<Self> {
        let millis = resource.get_i64(LAST_HEARTBEAT)?;
        let last_heartbeat = Utc.timestamp_millis_opt(millis).single()?;
        let properties = resource
            .properties
            .get(PROPERTIES)
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            sling_id: resource.name().to_string(),
            last_heartbeat,
            runtime_id: resource.get_str(RUNTIME_ID).map(str::to_string),
            endpoints: resource.get_strings(ENDPOINTS),
            properties,
        })
    }

    /// Time since the last heartbeat.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_heartbeat
    }
}

/// Result of writing our own heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Written,
    /// Another process overwrote our record with its own runtime id.
    DuplicateInstance { other_runtime_id: String },
}

/// Reads and writes heartbeat records in the shared store.
pub struct HeartbeatStore {
    store: Arc<dyn ResourceStore>,
    paths: DiscoveryPaths,
    clock: Arc<dyn Clock>,
    sling_id: String,
    runtime_id: String,
    staleness: Duration,
    written: AtomicBool,
}

impl HeartbeatStore {
    /// Create a heartbeat store with a fresh runtime id.
    pub fn new(
        store: Arc<dyn ResourceStore>,
        paths: DiscoveryPaths,
        clock: Arc<dyn Clock>,
        sling_id: impl Into<String>,
        staleness: Duration,
    ) -> Self {
        Self {
            store,
            paths,
            clock,
            sling_id: sling_id.into(),
            runtime_id: Uuid::new_v4().to_string(),
            staleness,
            written: AtomicBool::new(false),
        }
    }

    /// Id of the local instance.
    pub fn sling_id(&self) -> &str {
        &self.sling_id
    }

    /// Id of this process, rewritten with every heartbeat.
    pub fn runtime_id(&self) -> &str {
        &self.runtime_id
    }

    /// Maximum heartbeat age of a live instance.
    pub fn staleness(&self) -> Duration {
        self.staleness
    }

    /// Clock used for heartbeat timestamps.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Write this instance's heartbeat.
    ///
    /// Once we have written a record, finding a different runtime id in
    /// it means a second process runs with our sling id.
    pub async fn write_heartbeat(
        &self,
        endpoints: &[String],
        properties: &BTreeMap<String, String>,
    ) -> StoreResult<HeartbeatOutcome> {
        let path = self.paths.instance(&self.sling_id);

        if self.written.load(Ordering::SeqCst) {
            if let Some(existing) = self.store.get(&path).await? {
                match existing.get_str(RUNTIME_ID) {
                    Some(other) if other != self.runtime_id => {
                        return Ok(HeartbeatOutcome::DuplicateInstance {
                            other_runtime_id: other.to_string(),
                        });
                    }
                    _ => {}
                }
            }
        }

        let mut record = Properties::new();
        record.insert(LAST_HEARTBEAT.into(), Value::from(self.clock.now_millis()));
        record.insert(RUNTIME_ID.into(), Value::from(self.runtime_id.clone()));
        record.insert(
            ENDPOINTS.into(),
            Value::Array(endpoints.iter().cloned().map(Value::from).collect()),
        );
        record.insert(
            PROPERTIES.into(),
            Value::Object(
                properties
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from(v.clone())))
                    .collect(),
            ),
        );

        let mut session = Session::new(self.store.clone());
        session.put(path, record);
        session.commit().await?;
        self.written.store(true, Ordering::SeqCst);

        Ok(HeartbeatOutcome::Written)
    }

    /// All heartbeat records, fresh or not.
    pub async fn read_records(&self) -> StoreResult<Vec<HeartbeatRecord>> {
        let children = self
            .store
            .list_children(&self.paths.cluster_instances())
            .await?;
        Ok(children.iter().filter_map(HeartbeatRecord::from_resource).collect())
    }

    /// Records younger than the staleness threshold.
    pub async fn live_records(&self) -> StoreResult<Vec<HeartbeatRecord>> {
        let records = self.read_records().await?;
        Ok(records.into_iter().filter(|r| self.is_fresh(r)).collect())
    }

    /// Whether the record is younger than the staleness threshold.
    pub fn is_fresh(&self, record: &HeartbeatRecord) -> bool {
        record.age(self.clock.now()) <= chrono_duration(self.staleness)
    }

    /// Delete records of other instances older than `retention`,
    /// including their announcements.
    pub async fn expire_stale_records(&self, retention: Duration) -> StoreResult<usize> {
        let now = self.clock.now();
        let retention = chrono_duration(retention);
        let mut removed = 0;

        for record in self.read_records().await? {
            if record.sling_id == self.sling_id || record.age(now) <= retention {
                continue;
            }
            let mut session = Session::new(self.store.clone());
            session.delete(self.paths.instance(&record.sling_id));
            match session.commit().await {
                Ok(()) => {
                    tracing::info!(sling_id = %record.sling_id, "Removed expired heartbeat record");
                    removed += 1;
                }
                Err(e) => {
                    tracing::debug!(sling_id = %record.sling_id, "Could not remove heartbeat record: {}", e);
                    session.refresh();
                }
            }
        }

        Ok(removed)
    }
}
