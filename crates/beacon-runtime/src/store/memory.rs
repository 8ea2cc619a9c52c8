use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use beacon_core::error::{StoreError, StoreResult};
use beacon_core::store::{parent_of, Change, Properties, Resource, ResourceStore};

/// In-process resource store.
///
/// Suitable for a single instance or for tests that run several instances
/// against one shared `Arc<MemoryStore>`. Supports failure injection so
/// tests can simulate an unreachable store or conflicting commits.
#[derive(Default)]
pub struct MemoryStore {
    nodes: RwLock<BTreeMap<String, Properties>>,
    offline: AtomicBool,
    failing_commits: AtomicUsize,
    mutations: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `Unavailable` until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `n` commits with a conflict.
    pub fn fail_next_commits(&self, n: usize) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    /// Number of successfully committed changes so far.
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Paths of all resources below `prefix`, in order.
    pub fn paths_under(&self, prefix: &str) -> Vec<String> {
        let Ok(nodes) = self.nodes.read() else {
            return Vec::new();
        };
        let below = format!("{}/", prefix.trim_end_matches('/'));
        nodes
            .keys()
            .filter(|p| p.starts_with(&below))
            .cloned()
            .collect()
    }

    fn check_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".into()));
        }
        Ok(())
    }

    fn ensure_ancestors(nodes: &mut BTreeMap<String, Properties>, path: &str) {
        let mut current = parent_of(path);
        while let Some(parent) = current {
            nodes.entry(parent.to_string()).or_default();
            current = parent_of(parent);
        }
    }

    fn apply(nodes: &mut BTreeMap<String, Properties>, change: Change) -> StoreResult<()> {
        match change {
            Change::Create { path, properties } => {
                if nodes.contains_key(&path) {
                    return Err(StoreError::conflict(path, "resource already exists"));
                }
                Self::ensure_ancestors(nodes, &path);
                nodes.insert(path, properties);
            }
            Change::Put { path, properties } => {
                Self::ensure_ancestors(nodes, &path);
                nodes.insert(path, properties);
            }
            Change::Delete { path } => {
                if nodes.remove(&path).is_none() {
                    return Err(StoreError::conflict(path, "resource does not exist"));
                }
                let below = format!("{}/", path);
                nodes.retain(|p, _| !p.starts_with(&below));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, path: &str) -> StoreResult<Option<Resource>> {
        self.check_online()?;
        let nodes = self
            .nodes
            .read()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(nodes
            .get(path)
            .map(|props| Resource::new(path, props.clone())))
    }

    async fn list_children(&self, path: &str) -> StoreResult<Vec<Resource>> {
        self.check_online()?;
        let nodes = self
            .nodes
            .read()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        Ok(nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter(|(p, _)| !p[prefix.len()..].contains('/'))
            .map(|(p, props)| Resource::new(p.clone(), props.clone()))
            .collect())
    }

    async fn commit(&self, changes: Vec<Change>) -> StoreResult<()> {
        self.check_online()?;
        if changes.is_empty() {
            return Ok(());
        }

        let remaining = self.failing_commits.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_commits.store(remaining - 1, Ordering::SeqCst);
            let path = changes[0].path().to_string();
            return Err(StoreError::conflict(path, "injected commit failure"));
        }

        let mut nodes = self
            .nodes
            .write()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut working = nodes.clone();
        let count = changes.len() as u64;
        for change in changes {
            Self::apply(&mut working, change)?;
        }
        *nodes = working;
        self.mutations.fetch_add(count, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: serde_json::Value) -> Properties {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_create_builds_ancestors() {
        let store = MemoryStore::new();
        store
            .commit(vec![Change::Create {
                path: "/a/b/c".into(),
                properties: props(json!({"k": 1})),
            }])
            .await
            .unwrap();

        assert!(store.get("/a").await.unwrap().is_some());
        let children = store.list_children("/a").await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].path, "/a/b");
        assert_eq!(
            store.get("/a/b/c").await.unwrap().unwrap().get_i64("k"),
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_list_children_is_direct_only() {
        let store = MemoryStore::new();
        store
            .commit(vec![
                Change::Put { path: "/r/x".into(), properties: Properties::new() },
                Change::Put { path: "/r/x/y".into(), properties: Properties::new() },
                Change::Put { path: "/r/z".into(), properties: Properties::new() },
                Change::Put { path: "/rr".into(), properties: Properties::new() },
            ])
            .await
            .unwrap();

        let names: Vec<String> = store
            .list_children("/r")
            .await
            .unwrap()
            .iter()
            .map(|r| r.name().to_string())
            .collect();
        assert_eq!(names, vec!["x", "z"]);
    }

    #[tokio::test]
    async fn test_commit_is_atomic() {
        let store = MemoryStore::new();
        let result = store
            .commit(vec![
                Change::Create { path: "/a".into(), properties: Properties::new() },
                Change::Delete { path: "/missing".into() },
            ])
            .await;

        assert!(matches!(result, Err(StoreError::Conflict { .. })));
        assert!(store.get("/a").await.unwrap().is_none());
        assert_eq!(store.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_removes_subtree() {
        let store = MemoryStore::new();
        store
            .commit(vec![Change::Put { path: "/a/b/c".into(), properties: Properties::new() }])
            .await
            .unwrap();
        store
            .commit(vec![Change::Delete { path: "/a/b".into() }])
            .await
            .unwrap();
        assert!(store.paths_under("/a").is_empty());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = MemoryStore::new();
        store.set_offline(true);
        assert!(matches!(store.get("/a").await, Err(StoreError::Unavailable(_))));
        store.set_offline(false);

        store.fail_next_commits(1);
        let change = Change::Put { path: "/a".into(), properties: Properties::new() };
        assert!(store.commit(vec![change.clone()]).await.is_err());
        assert!(store.commit(vec![change]).await.is_ok());
    }
}
