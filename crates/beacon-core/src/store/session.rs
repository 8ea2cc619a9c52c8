use std::sync::Arc;

use super::{Change, Properties, Resource, ResourceStore};
use crate::error::StoreResult;

/// A unit of work against a [`ResourceStore`].
///
/// Reads go straight to the store. Writes are buffered until [`commit`],
/// which drains the buffer whether or not the store accepts it, so a
/// failed commit leaves the session clean for the next attempt.
///
/// [`commit`]: Session::commit
pub struct Session {
    store: Arc<dyn ResourceStore>,
    pending: Vec<Change>,
}

impl Session {
    /// Create a session with nothing pending.
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self {
            store,
            pending: Vec::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    pub async fn get(&self, path: &str) -> StoreResult<Option<Resource>> {
        self.store.get(path).await
    }

    pub async fn list_children(&self, path: &str) -> StoreResult<Vec<Resource>> {
        self.store.list_children(path).await
    }

    /// Queue the creation of a new resource.
    pub fn create(&mut self, path: impl Into<String>, properties: Properties) {
        self.pending.push(Change::Create {
            path: path.into(),
            properties,
        });
    }

    /// Queue an upsert.
    pub fn put(&mut self, path: impl Into<String>, properties: Properties) {
        self.pending.push(Change::Put {
            path: path.into(),
            properties,
        });
    }

    /// Queue the deletion of a resource and its subtree.
    pub fn delete(&mut self, path: impl Into<String>) {
        self.pending.push(Change::Delete { path: path.into() });
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Commit buffered changes atomically.
    pub async fn commit(&mut self) -> StoreResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let changes = std::mem::take(&mut self.pending);
        self.store.commit(changes).await
    }

    /// Drop buffered changes so the next read observes other writers.
    pub fn refresh(&mut self) {
        self.pending.clear();
    }
}
