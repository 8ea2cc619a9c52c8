use std::sync::Arc;

use chrono::{DateTime, Duration, Months, TimeZone, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Mutex;

use beacon_core::error::StoreResult;
use beacon_core::job::{JobLayout, JobResource, QueueType, BUCKET_DEPTH};
use beacon_core::store::{name_of, Change, Properties, ResourceStore, Session};
use beacon_core::time::Clock;

use super::capabilities::TopologyCapabilities;
use super::queues::QueueConfigurationManager;
use super::storage::JobCursor;

/// Outcome of one maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub moved_to_unassigned: usize,
    pub assigned: usize,
    pub dropped: usize,
    pub failed: usize,
    /// The capabilities were superseded while the pass ran.
    pub aborted: bool,
    pub folders_removed: usize,
}

#[derive(Default)]
struct PassState {
    topology_change_count: Option<u64>,
    queue_change_count: Option<u64>,
    passes: u64,
}

/// Leader-driven redistribution of jobs after topology or queue changes.
pub struct MaintenanceTask {
    store: Arc<dyn ResourceStore>,
    layout: JobLayout,
    clock: Arc<dyn Clock>,
    queues: Arc<QueueConfigurationManager>,
    cleanup_every: u64,
    state: Mutex<PassState>,
}

impl MaintenanceTask {
    /// Create a maintenance task. A `cleanup_every` of 0 disables folder cleanup.
    pub fn new(
        store: Arc<dyn ResourceStore>,
        layout: JobLayout,
        clock: Arc<dyn Clock>,
        queues: Arc<QueueConfigurationManager>,
        cleanup_every: u64,
    ) -> Self {
        Self {
            store,
            layout,
            clock,
            queues,
            cleanup_every,
            state: Mutex::new(PassState::default()),
        }
    }

    /// Run a pass, detecting changes since the last completed pass from
    /// the change counters. Every `cleanup_every` passes empty bucket
    /// folders are pruned as well.
    pub async fn run_cycle(&self, caps: &TopologyCapabilities) -> StoreResult<MaintenanceReport> {
        let mut state = self.state.lock().await;
        let queue_changes = self.queues.change_count();
        let topology_changed = state.topology_change_count != Some(caps.change_count());
        let config_changed = state.queue_change_count != Some(queue_changes);

        let mut report = self.run(caps, topology_changed, config_changed).await?;
        if !report.aborted {
            state.topology_change_count = Some(caps.change_count());
            state.queue_change_count = Some(queue_changes);
        }

        state.passes += 1;
        if self.cleanup_every > 0 && state.passes % self.cleanup_every == 0 {
            report.folders_removed = self.cleanup_empty_folders(caps).await?;
        }
        Ok(report)
    }

    /// One maintenance pass. Only the leader mutates anything.
    pub async fn run(
        &self,
        caps: &TopologyCapabilities,
        topology_changed: bool,
        config_changed: bool,
    ) -> StoreResult<MaintenanceReport> {
        let mut report = MaintenanceReport::default();
        if !caps.is_leader() {
            return Ok(report);
        }

        if topology_changed {
            self.unassign_from_inactive(caps, &mut report).await?;
        }
        if (topology_changed || config_changed) && !report.aborted {
            self.assign_unassigned(caps, &mut report).await?;
        }

        if report != MaintenanceReport::default() {
            tracing::info!(
                moved_to_unassigned = report.moved_to_unassigned,
                assigned = report.assigned,
                dropped = report.dropped,
                failed = report.failed,
                aborted = report.aborted,
                "Job maintenance finished"
            );
        }
        Ok(report)
    }

    /// Move the jobs of instances that left the cluster to the unassigned
    /// subtree.
    async fn unassign_from_inactive(
        &self,
        caps: &TopologyCapabilities,
        report: &mut MaintenanceReport,
    ) -> StoreResult<()> {
        let assigned_root = self.layout.assigned_root();
        for instance in self.store.list_children(&assigned_root).await? {
            if caps.is_active_instance(instance.name()) {
                continue;
            }
            tracing::debug!(instance = %instance.name(), "Reassigning jobs of inactive instance");

            for topic_folder in self.store.list_children(&instance.path).await? {
                let topic = JobLayout::topic_from_dir_name(topic_folder.name());
                let info = self.queues.get_queue_info(&topic);
                if info.queue_type() == QueueType::Ignore {
                    continue;
                }

                let mut cursor = JobCursor::new(self.store.clone(), topic_folder.path.clone());
                while let Some(job) = cursor.next().await? {
                    if !caps.is_active() {
                        report.aborted = true;
                        return Ok(());
                    }
                    if info.queue_type() == QueueType::Drop {
                        self.drop_job(&job, report).await;
                        continue;
                    }

                    let relative = &job.path[instance.path.len()..];
                    let new_path = format!("{}{}", self.layout.unassigned_root(), relative);
                    if self.move_job(&job, new_path, job.unassigned_properties()).await {
                        report.moved_to_unassigned += 1;
                    } else {
                        report.failed += 1;
                    }
                }
            }
        }
        Ok(())
    }

    async fn assign_unassigned(
        &self,
        caps: &TopologyCapabilities,
        report: &mut MaintenanceReport,
    ) -> StoreResult<()> {
        let unassigned_root = self.layout.unassigned_root();
        for topic_folder in self.store.list_children(&unassigned_root).await? {
            let folder_topic = JobLayout::topic_from_dir_name(topic_folder.name());
            let info = self.queues.get_queue_info(&folder_topic);
            if info.queue_type() == QueueType::Ignore {
                continue;
            }

            let mut cursor = JobCursor::new(self.store.clone(), topic_folder.path.clone());
            while let Some(job) = cursor.next().await? {
                if !caps.is_active() {
                    report.aborted = true;
                    return Ok(());
                }
                if info.queue_type() == QueueType::Drop {
                    self.drop_job(&job, report).await;
                    continue;
                }

                let topic = job.topic().unwrap_or(&folder_topic).to_string();
                let Some(target) = caps.detect_target(&topic, &job.properties, &info) else {
                    continue;
                };
                let created = job.created().unwrap_or_else(|| self.clock.now());
                let id = job.id().unwrap_or_else(|| name_of(&job.path)).to_string();
                let new_path = self.layout.job_path(Some(&target), &topic, created, &id);
                let properties = job.assigned_properties(&target, &info.queue_name);
                if self.move_job(&job, new_path, properties).await {
                    report.assigned += 1;
                } else {
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }

    async fn drop_job(&self, job: &JobResource, report: &mut MaintenanceReport) {
        let mut session = Session::new(self.store.clone());
        session.delete(job.path.clone());
        match session.commit().await {
            Ok(()) => report.dropped += 1,
            Err(e) => {
                session.refresh();
                tracing::warn!(path = %job.path, "Failed to drop job: {}", e);
                report.failed += 1;
            }
        }
    }

    /// Write the job at `new_path` and remove the old resource in one
    /// commit. Returns false when the commit failed.
    async fn move_job(&self, job: &JobResource, new_path: String, properties: Properties) -> bool {
        let mut session = Session::new(self.store.clone());
        session.put(new_path.clone(), properties);
        session.delete(job.path.clone());
        match session.commit().await {
            Ok(()) => {
                tracing::debug!(from = %job.path, to = %new_path, "Moved job");
                true
            }
            Err(e) => {
                session.refresh();
                tracing::warn!(path = %job.path, "Failed to move job: {}", e);
                false
            }
        }
    }

    /// Remove empty bucket folders whose period ended more than an hour
    /// ago. The leader cleans the unassigned subtree, every instance its
    /// own assigned subtree.
    pub async fn cleanup_empty_folders(&self, caps: &TopologyCapabilities) -> StoreResult<usize> {
        let mut roots = vec![self.layout.instance_root(caps.local_id())];
        if caps.is_leader() {
            roots.push(self.layout.unassigned_root());
        }

        let now = self.clock.now();
        let mut removed = 0;
        for root in roots {
            for topic_folder in self.store.list_children(&root).await? {
                if !caps.is_active() {
                    return Ok(removed);
                }
                let state = self
                    .clean_bucket(topic_folder.path.clone(), Vec::new(), now)
                    .await?;
                removed += state.removed;
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "Removed empty job folders");
        }
        Ok(removed)
    }

    fn clean_bucket(
        &self,
        path: String,
        parts: Vec<u32>,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, StoreResult<BucketState>> {
        async move {
            let mut state = BucketState::default();
            let mut remaining = 0usize;
            for child in self.store.list_children(&path).await? {
                let bucket = if parts.len() < BUCKET_DEPTH {
                    child.name().parse::<u32>().ok()
                } else {
                    None
                };
                let Some(value) = bucket else {
                    remaining += 1;
                    continue;
                };

                let mut child_parts = parts.clone();
                child_parts.push(value);
                let child_state = self
                    .clean_bucket(child.path.clone(), child_parts.clone(), now)
                    .await?;
                state.removed += child_state.removed;

                let expired = bucket_end(&child_parts)
                    .is_some_and(|end| end + Duration::hours(1) <= now);
                if !(child_state.empty && expired) {
                    remaining += 1;
                    continue;
                }
                match self.store.commit(vec![Change::Delete { path: child.path.clone() }]).await {
                    Ok(()) => state.removed += 1,
                    Err(e) => {
                        tracing::warn!(path = %child.path, "Failed to remove empty folder: {}", e);
                        remaining += 1;
                    }
                }
            }
            state.empty = remaining == 0;
            Ok(state)
        }
        .boxed()
    }
}

#[derive(Debug, Default)]
struct BucketState {
    empty: bool,
    removed: usize,
}

/// End of the period a bucket folder covers, from its year, month, day,
/// hour and minute components.
fn bucket_end(parts: &[u32]) -> Option<DateTime<Utc>> {
    let year = i32::try_from(*parts.first()?).ok()?;
    let month = parts.get(1).copied().unwrap_or(1);
    let day = parts.get(2).copied().unwrap_or(1);
    let hour = parts.get(3).copied().unwrap_or(0);
    let minute = parts.get(4).copied().unwrap_or(0);
    let start = Utc
        .with_ymd_and_hms(year, month, day, hour, minute, 0)
        .single()?;

    match parts.len() {
        1 => Utc.with_ymd_and_hms(year + 1, 1, 1, 0, 0, 0).single(),
        2 => start.checked_add_months(Months::new(1)),
        3 => Some(start + Duration::days(1)),
        4 => Some(start + Duration::hours(1)),
        _ => Some(start + Duration::minutes(1)),
    }
}
