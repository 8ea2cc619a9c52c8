//! Contract for the shared tree store used as the coordination medium.
//!
//! Instances never talk to each other directly within a local cluster.
//! Heartbeats, votes, announcements and job resources are all nodes in a
//! tree of property maps, written through [`Session`]s and committed
//! atomically.

mod path;
mod session;

pub use path::{child_path, name_of, parent_of};
pub use session::Session;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreResult;

/// Named properties of a resource.
pub type Properties = serde_json::Map<String, Value>;

/// A node in the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub path: String,
    pub properties: Properties,
}

impl Resource {
    pub fn new(path: impl Into<String>, properties: Properties) -> Self {
        Self {
            path: path.into(),
            properties,
        }
    }

    /// Last path segment.
    pub fn name(&self) -> &str {
        name_of(&self.path)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.properties.get(key).and_then(Value::as_i64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.properties.get(key).and_then(Value::as_bool)
    }

    /// String array property, ignoring non-string entries.
    pub fn get_strings(&self, key: &str) -> Vec<String> {
        self.properties
            .get(key)
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A single mutation inside a commit.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Create a new resource; fails if it already exists.
    Create { path: String, properties: Properties },
    /// Create or replace a resource.
    Put { path: String, properties: Properties },
    /// Delete an existing resource and its subtree; fails if missing.
    Delete { path: String },
}

impl Change {
    pub fn path(&self) -> &str {
        match self {
            Change::Create { path, .. } | Change::Put { path, .. } | Change::Delete { path } => {
                path
            }
        }
    }
}

/// A tree of property maps with atomic multi-change commits.
///
/// Missing ancestors are created empty by `Create` and `Put`.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch a single resource.
    async fn get(&self, path: &str) -> StoreResult<Option<Resource>>;

    /// Direct children of a resource, ordered by path.
    async fn list_children(&self, path: &str) -> StoreResult<Vec<Resource>>;

    /// Apply all changes or none.
    async fn commit(&self, changes: Vec<Change>) -> StoreResult<()>;
}
