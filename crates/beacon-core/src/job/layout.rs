use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::store::child_path;

/// Paths of the job resource tree.
///
/// ```text
/// <root>/unassigned/<topic>/<yyyy>/<mm>/<dd>/<hh>/<mm>/<jobId>
/// <root>/assigned/<instance>/<topic>/<yyyy>/<mm>/<dd>/<hh>/<mm>/<jobId>
/// ```
///
/// Topics are stored with `/` replaced by `.` so each topic is a single
/// folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLayout {
    root: String,
}

/// Number of time bucket levels below a topic folder.
pub const BUCKET_DEPTH: usize = 5;

impl JobLayout {
    /// Create the layout below `root`.
    pub fn new(root: impl Into<String>) -> Self {
        let root: String = root.into();
        Self {
            root: root.trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn assigned_root(&self) -> String {
        child_path(&self.root, "assigned")
    }

    pub fn unassigned_root(&self) -> String {
        child_path(&self.root, "unassigned")
    }

    /// Jobs assigned to one instance.
    pub fn instance_root(&self, sling_id: &str) -> String {
        child_path(&self.assigned_root(), sling_id)
    }

    /// Folder name of a topic.
    pub fn topic_dir_name(topic: &str) -> String {
        topic.replace('/', ".")
    }

    pub fn topic_from_dir_name(name: &str) -> String {
        name.replace('.', "/")
    }

    /// Time bucket relative path for a creation time.
    pub fn bucket(created: DateTime<Utc>) -> String {
        created.format("%Y/%m/%d/%H/%M").to_string()
    }

    /// Full path of a job, assigned to `target` or unassigned.
    pub fn job_path(
        &self,
        target: Option<&str>,
        topic: &str,
        created: DateTime<Utc>,
        id: &str,
    ) -> String {
        let base = match target {
            Some(target) => self.instance_root(target),
            None => self.unassigned_root(),
        };
        format!(
            "{}/{}/{}/{}",
            base,
            Self::topic_dir_name(topic),
            Self::bucket(created),
            id
        )
    }

    /// A fresh job id, unique across instances.
    pub fn new_job_id(created: DateTime<Utc>, sling_id: &str) -> String {
        let short: String = sling_id.chars().filter(|c| *c != '-').take(8).collect();
        format!(
            "{}_{}_{}",
            created.format("%Y%m%d%H%M%S"),
            short,
            Uuid::new_v4().simple()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_job_paths() {
        let layout = JobLayout::new("/var/jobs/");
        let created = Utc.with_ymd_and_hms(2024, 3, 7, 9, 5, 0).unwrap();

        assert_eq!(
            layout.job_path(None, "a/b", created, "j1"),
            "/var/jobs/unassigned/a.b/2024/03/07/09/05/j1"
        );
        assert_eq!(
            layout.job_path(Some("x"), "t", created, "j1"),
            "/var/jobs/assigned/x/t/2024/03/07/09/05/j1"
        );
    }

    #[test]
    fn test_topic_dir_round_trip() {
        assert_eq!(JobLayout::topic_dir_name("org/acme/job"), "org.acme.job");
        assert_eq!(JobLayout::topic_from_dir_name("org.acme.job"), "org/acme/job");
    }

    #[test]
    fn test_new_job_id_is_path_safe() {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let id = JobLayout::new_job_id(created, "abcd-ef01-2345");
        assert!(id.starts_with("20240101000000_abcdef01_"));
        assert!(!id.contains('/'));
        assert_ne!(id, JobLayout::new_job_id(created, "abcd-ef01-2345"));
    }
}
