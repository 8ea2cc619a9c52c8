use std::collections::VecDeque;
use std::sync::Arc;

use beacon_core::error::{Result, StoreResult};
use beacon_core::job::{JobLayout, JobResource, QueueType};
use beacon_core::store::{Properties, ResourceStore, Session};
use beacon_core::time::Clock;

use super::capabilities::TopologyCapabilities;
use super::queues::QueueConfigurationManager;

/// Depth-first walk over the job resources below a folder.
///
/// Folders are expanded lazily, one `list_children` call at a time, and
/// jobs come out in path order.
pub struct JobCursor {
    store: Arc<dyn ResourceStore>,
    folders: Vec<String>,
    ready: VecDeque<JobResource>,
}

impl JobCursor {
    /// Walk all jobs below `root`.
    pub fn new(store: Arc<dyn ResourceStore>, root: impl Into<String>) -> Self {
        Self {
            store,
            folders: vec![root.into()],
            ready: VecDeque::new(),
        }
    }

    /// The next job in depth-first order.
    pub async fn next(&mut self) -> StoreResult<Option<JobResource>> {
        loop {
            if let Some(job) = self.ready.pop_front() {
                return Ok(Some(job));
            }
            let Some(folder) = self.folders.pop() else {
                return Ok(None);
            };

            let children = self.store.list_children(&folder).await?;
            let mut subfolders = Vec::new();
            for child in children {
                let path = child.path.clone();
                match JobResource::from_resource(child) {
                    Some(job) => self.ready.push_back(job),
                    None => subfolders.push(path),
                }
            }
            self.folders.extend(subfolders.into_iter().rev());
        }
    }
}

/// Submission and listing of jobs.
pub struct JobStorage {
    store: Arc<dyn ResourceStore>,
    layout: JobLayout,
    clock: Arc<dyn Clock>,
    sling_id: String,
    queues: Arc<QueueConfigurationManager>,
}

impl JobStorage {
    /// Create job storage for the local instance.
    pub fn new(
        store: Arc<dyn ResourceStore>,
        layout: JobLayout,
        clock: Arc<dyn Clock>,
        sling_id: impl Into<String>,
        queues: Arc<QueueConfigurationManager>,
    ) -> Self {
        Self {
            store,
            layout,
            clock,
            sling_id: sling_id.into(),
            queues,
        }
    }

    pub fn layout(&self) -> &JobLayout {
        &self.layout
    }

    /// Store a new job.
    ///
    /// Returns `None` when the topic's queue drops jobs. Jobs of ignoring
    /// queues, and jobs without an eligible target, land in the
    /// unassigned subtree.
    pub async fn add_job(
        &self,
        topic: &str,
        properties: Properties,
        capabilities: Option<&TopologyCapabilities>,
    ) -> Result<Option<JobResource>> {
        let info = self.queues.get_queue_info(topic);
        if info.queue_type() == QueueType::Drop {
            tracing::debug!(topic = %topic, queue = %info.queue_name, "Dropping job");
            return Ok(None);
        }

        let created = self.clock.now();
        let id = JobLayout::new_job_id(created, &self.sling_id);
        let mut job_properties = JobResource::new_properties(
            &id,
            topic,
            &self.sling_id,
            created,
            info.config.max_retries,
            properties,
        );

        let target = match (info.queue_type().is_assignable(), capabilities) {
            (true, Some(caps)) if caps.is_active() => {
                caps.detect_target(topic, &job_properties, &info)
            }
            _ => None,
        };
        let path = self.layout.job_path(target.as_deref(), topic, created, &id);
        if let Some(target) = &target {
            let job = JobResource {
                path: path.clone(),
                properties: job_properties,
            };
            job_properties = job.assigned_properties(target, &info.queue_name);
        }

        let mut session = Session::new(self.store.clone());
        session.create(path.clone(), job_properties.clone());
        if let Err(e) = session.commit().await {
            session.refresh();
            return Err(e.into());
        }

        tracing::debug!(job_id = %id, topic = %topic, target = ?target, "Added job");
        Ok(Some(JobResource {
            path,
            properties: job_properties,
        }))
    }

    /// All jobs below `root`, in path order.
    pub async fn list_jobs(&self, root: &str) -> StoreResult<Vec<JobResource>> {
        let mut cursor = JobCursor::new(self.store.clone(), root);
        let mut jobs = Vec::new();
        while let Some(job) = cursor.next().await? {
            jobs.push(job);
        }
        Ok(jobs)
    }

    /// Delete the job at `path`.
    pub async fn remove_job(&self, path: &str) -> StoreResult<()> {
        let mut session = Session::new(self.store.clone());
        session.delete(path);
        if let Err(e) = session.commit().await {
            session.refresh();
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use beacon_core::cluster::{ClusterView, InstanceDescription, TopologyView, JOB_TOPICS_PROPERTY};
    use beacon_core::job::{props, QueueConfiguration};
    use beacon_core::time::ManualClock;
    use serde_json::Value;

    fn storage(store: Arc<MemoryStore>, queues: Vec<QueueConfiguration>) -> JobStorage {
        JobStorage::new(
            store,
            JobLayout::new("/jobs"),
            Arc::new(ManualClock::default()),
            "a",
            Arc::new(QueueConfigurationManager::new(queues)),
        )
    }

    fn caps() -> TopologyCapabilities {
        let local = InstanceDescription::new("a")
            .with_leader(true)
            .with_local(true)
            .with_property(JOB_TOPICS_PROPERTY, "*");
        TopologyCapabilities::new(
            &TopologyView::new(ClusterView::new("c", vec![local]), Vec::new()),
            1,
        )
    }

    #[tokio::test]
    async fn test_add_job_assigns_to_target() {
        let store = Arc::new(MemoryStore::new());
        let storage = storage(store, Vec::new());

        let mut user = Properties::new();
        user.insert("to".into(), Value::from("ops@example.com"));
        let job = storage
            .add_job("mail/send", user, Some(&caps()))
            .await
            .unwrap()
            .unwrap();

        assert!(job.path.starts_with("/jobs/assigned/a/mail.send/"));
        assert_eq!(job.target_instance(), Some("a"));
        assert_eq!(job.properties.get("to"), Some(&Value::from("ops@example.com")));
        assert_eq!(job.retries(), Some(10));
    }

    #[tokio::test]
    async fn test_add_job_without_capabilities_is_unassigned() {
        let store = Arc::new(MemoryStore::new());
        let storage = storage(store, Vec::new());
        let job = storage
            .add_job("t", Properties::new(), None)
            .await
            .unwrap()
            .unwrap();
        assert!(job.path.starts_with("/jobs/unassigned/t/"));
        assert_eq!(job.target_instance(), None);
    }

    #[tokio::test]
    async fn test_drop_and_ignore_queues() {
        let store = Arc::new(MemoryStore::new());
        let storage = storage(
            store,
            vec![
                QueueConfiguration::new("dropped", QueueType::Drop).with_topics(["d"]),
                QueueConfiguration::new("ignored", QueueType::Ignore).with_topics(["i"]),
            ],
        );

        assert!(storage
            .add_job("d", Properties::new(), Some(&caps()))
            .await
            .unwrap()
            .is_none());

        let ignored = storage
            .add_job("i", Properties::new(), Some(&caps()))
            .await
            .unwrap()
            .unwrap();
        assert!(ignored.path.starts_with("/jobs/unassigned/i/"));
        assert!(!ignored.properties.contains_key(props::QUEUE_NAME));
    }

    #[tokio::test]
    async fn test_list_and_remove() {
        let store = Arc::new(MemoryStore::new());
        let storage = storage(store, Vec::new());
        let first = storage.add_job("t1", Properties::new(), None).await.unwrap().unwrap();
        storage.add_job("t2", Properties::new(), None).await.unwrap();

        let jobs = storage.list_jobs("/jobs/unassigned").await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].topic(), Some("t1"));
        assert_eq!(jobs[1].topic(), Some("t2"));

        storage.remove_job(&first.path).await.unwrap();
        assert_eq!(storage.list_jobs("/jobs").await.unwrap().len(), 1);
    }
}
