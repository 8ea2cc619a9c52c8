use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::Value;

use beacon_core::error::{BeaconError, Result, StoreResult};
use beacon_core::job::{props, JobLayout, JobResource, QueueType};
use beacon_core::store::{Change, Properties, Resource, ResourceStore, Session};
use beacon_core::time::Clock;

use super::capabilities::TopologyCapabilities;
use super::queues::QueueConfigurationManager;

/// Outcome of a legacy migration pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeReport {
    pub migrated: usize,
    pub dropped: usize,
    pub failed: usize,
    pub roots_removed: usize,
    pub aborted: bool,
}

enum Migration {
    Migrated,
    Dropped,
}

/// Encode job properties the way legacy job resources store them: a
/// MessagePack map kept as a byte array property.
pub fn encode_legacy_properties(properties: &BTreeMap<String, Value>) -> Result<Value> {
    let bytes =
        rmp_serde::to_vec(properties).map_err(|e| BeaconError::Serialization(e.to_string()))?;
    Ok(Value::Array(bytes.into_iter().map(Value::from).collect()))
}

fn decode_legacy_properties(value: &Value) -> Result<BTreeMap<String, Value>> {
    let bytes = value
        .as_array()
        .ok_or_else(|| BeaconError::Serialization("legacy properties are not a byte array".into()))?
        .iter()
        .map(|b| {
            b.as_u64()
                .and_then(|b| u8::try_from(b).ok())
                .ok_or_else(|| BeaconError::Serialization("invalid byte in legacy properties".into()))
        })
        .collect::<Result<Vec<u8>>>()?;
    rmp_serde::from_slice(&bytes).map_err(|e| BeaconError::Serialization(e.to_string()))
}

/// One-time migration of jobs stored in the legacy layout.
///
/// Runs on the leader only. A legacy root is deleted once every job below
/// it migrated; jobs that failed stay in place for the next attempt.
pub struct UpgradeTask {
    store: Arc<dyn ResourceStore>,
    layout: JobLayout,
    clock: Arc<dyn Clock>,
    queues: Arc<QueueConfigurationManager>,
    sling_id: String,
    legacy_roots: Vec<String>,
}

impl UpgradeTask {
    /// Create an upgrade task over the given legacy roots.
    pub fn new(
        store: Arc<dyn ResourceStore>,
        layout: JobLayout,
        clock: Arc<dyn Clock>,
        queues: Arc<QueueConfigurationManager>,
        sling_id: impl Into<String>,
        legacy_roots: Vec<String>,
    ) -> Self {
        Self {
            store,
            layout,
            clock,
            queues,
            sling_id: sling_id.into(),
            legacy_roots,
        }
    }

    /// Migrate all legacy jobs. Only the leader does any work.
    pub async fn run(&self, caps: &TopologyCapabilities) -> StoreResult<UpgradeReport> {
        let mut report = UpgradeReport::default();
        if !caps.is_leader() {
            return Ok(report);
        }

        for root in &self.legacy_roots {
            if self.store.get(root).await?.is_none() {
                continue;
            }
            let failed_before = report.failed;

            for resource in self.legacy_jobs(root).await? {
                if !caps.is_active() {
                    report.aborted = true;
                    return Ok(report);
                }
                let path = resource.path.clone();
                match self.migrate(resource, caps).await {
                    Ok(Migration::Migrated) => report.migrated += 1,
                    Ok(Migration::Dropped) => report.dropped += 1,
                    Err(e) => {
                        tracing::warn!(path = %path, "Failed to migrate legacy job: {}", e);
                        report.failed += 1;
                    }
                }
            }

            if report.failed == failed_before {
                match self.store.commit(vec![Change::Delete { path: root.clone() }]).await {
                    Ok(()) => report.roots_removed += 1,
                    Err(e) => tracing::warn!(root = %root, "Failed to remove legacy root: {}", e),
                }
            }
        }

        if report.migrated + report.dropped + report.failed > 0 {
            tracing::info!(
                migrated = report.migrated,
                dropped = report.dropped,
                failed = report.failed,
                "Legacy job migration finished"
            );
        }
        Ok(report)
    }

    async fn legacy_jobs(&self, root: &str) -> StoreResult<Vec<Resource>> {
        let mut folders = vec![root.to_string()];
        let mut jobs = Vec::new();
        while let Some(folder) = folders.pop() {
            let children = self.store.list_children(&folder).await?;
            for child in children.into_iter().rev() {
                if child.get_str(props::RESOURCE_TYPE) == Some(props::LEGACY_JOB_RESOURCE_TYPE) {
                    jobs.push(child);
                } else {
                    folders.push(child.path);
                }
            }
        }
        jobs.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(jobs)
    }

    async fn migrate(&self, resource: Resource, caps: &TopologyCapabilities) -> Result<Migration> {
        let topic = resource
            .get_str(props::LEGACY_TOPIC)
            .ok_or_else(|| BeaconError::Job(format!("legacy job {} has no topic", resource.path)))?
            .to_string();
        let info = self.queues.get_queue_info(&topic);

        let mut session = Session::new(self.store.clone());
        if info.queue_type() == QueueType::Drop {
            session.delete(resource.path.clone());
            return match session.commit().await {
                Ok(()) => Ok(Migration::Dropped),
                Err(e) => {
                    session.refresh();
                    Err(e.into())
                }
            };
        }

        let decoded = match resource.properties.get(props::LEGACY_PROPERTIES) {
            Some(value) => decode_legacy_properties(value)?,
            None => BTreeMap::new(),
        };

        let mut user = Properties::new();
        for (key, value) in &resource.properties {
            match key.as_str() {
                props::RESOURCE_TYPE
                | props::LEGACY_TOPIC
                | props::LEGACY_PROPERTIES
                | props::QUEUE_NAME
                | props::TARGET_INSTANCE
                | props::STARTED_TIME => {}
                _ => {
                    user.insert(key.clone(), value.clone());
                }
            }
        }
        user.extend(decoded);

        let created = resource
            .get_i64(props::CREATED)
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(|| self.clock.now());
        let id = resource
            .get_str(props::ID)
            .map(str::to_string)
            .unwrap_or_else(|| JobLayout::new_job_id(created, &self.sling_id));
        let retries = user.get(props::RETRIES).cloned();
        let retry_count = user.get(props::RETRY_COUNT).cloned();

        let created_instance = format!("old:{}", self.sling_id);
        let mut properties = JobResource::new_properties(
            &id,
            &topic,
            &created_instance,
            created,
            info.config.max_retries,
            user,
        );
        if let Some(retries) = retries {
            properties.insert(props::RETRIES.into(), retries);
        }
        if let Some(retry_count) = retry_count {
            properties.insert(props::RETRY_COUNT.into(), retry_count);
        }

        let target = if info.queue_type().is_assignable() {
            caps.detect_target(&topic, &properties, &info)
        } else {
            None
        };
        let path = self.layout.job_path(target.as_deref(), &topic, created, &id);
        if let Some(target) = &target {
            let job = JobResource {
                path: path.clone(),
                properties,
            };
            properties = job.assigned_properties(target, &info.queue_name);
        }

        session.put(path, properties);
        session.delete(resource.path.clone());
        if let Err(e) = session.commit().await {
            session.refresh();
            return Err(e.into());
        }
        Ok(Migration::Migrated)
    }
}
