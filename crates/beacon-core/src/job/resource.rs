use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::store::{Properties, Resource};

/// Property names used on job resources.
pub mod props {
    pub const RESOURCE_TYPE: &str = "beacon:resourceType";
    pub const JOB_RESOURCE_TYPE: &str = "beacon/job";
    pub const LEGACY_JOB_RESOURCE_TYPE: &str = "beacon/legacy-job";

    pub const ID: &str = "job:id";
    pub const TOPIC: &str = "job:topic";
    pub const QUEUE_NAME: &str = "job:queueName";
    pub const TARGET_INSTANCE: &str = "job:targetInstance";
    pub const RETRIES: &str = "job:retries";
    pub const RETRY_COUNT: &str = "job:retryCount";
    pub const CREATED_INSTANCE: &str = "job:createdInstance";
    pub const CREATED: &str = "job:created";
    pub const STARTED_TIME: &str = "job:startedTime";

    pub const LEGACY_TOPIC: &str = "legacy:topic";
    pub const LEGACY_PROPERTIES: &str = "legacy:properties";
}

/// A job stored in the resource tree.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResource {
    pub path: String,
    pub properties: Properties,
}

impl JobResource {
    /// Wrap a resource if it is a job.
    pub fn from_resource(resource: Resource) -> Option<Self> {
        let is_job = resource.get_str(props::RESOURCE_TYPE) == Some(props::JOB_RESOURCE_TYPE);
        is_job.then(|| Self {
            path: resource.path,
            properties: resource.properties,
        })
    }

    /// Properties for a freshly submitted job.
    pub fn new_properties(
        id: &str,
        topic: &str,
        created_instance: &str,
        created: DateTime<Utc>,
        retries: u32,
        user_properties: Properties,
    ) -> Properties {
        let mut properties = user_properties;
        properties.insert(
            props::RESOURCE_TYPE.into(),
            Value::from(props::JOB_RESOURCE_TYPE),
        );
        properties.insert(props::ID.into(), Value::from(id));
        properties.insert(props::TOPIC.into(), Value::from(topic));
        properties.insert(props::CREATED_INSTANCE.into(), Value::from(created_instance));
        properties.insert(props::CREATED.into(), Value::from(created.timestamp_millis()));
        properties.insert(props::RETRIES.into(), Value::from(retries));
        properties.insert(props::RETRY_COUNT.into(), Value::from(0));
        properties
    }

    fn str_prop(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    pub fn id(&self) -> Option<&str> {
        self.str_prop(props::ID)
    }

    pub fn topic(&self) -> Option<&str> {
        self.str_prop(props::TOPIC)
    }

    pub fn queue_name(&self) -> Option<&str> {
        self.str_prop(props::QUEUE_NAME)
    }

    pub fn target_instance(&self) -> Option<&str> {
        self.str_prop(props::TARGET_INSTANCE)
    }

    pub fn created_instance(&self) -> Option<&str> {
        self.str_prop(props::CREATED_INSTANCE)
    }

    pub fn retries(&self) -> Option<u64> {
        self.properties.get(props::RETRIES).and_then(Value::as_u64)
    }

    pub fn retry_count(&self) -> Option<u64> {
        self.properties.get(props::RETRY_COUNT).and_then(Value::as_u64)
    }

    pub fn has_started(&self) -> bool {
        self.properties.contains_key(props::STARTED_TIME)
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.properties
            .get(props::CREATED)
            .and_then(Value::as_i64)
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }

    /// Properties for the job after assignment to `target`.
    pub fn assigned_properties(&self, target: &str, queue_name: &str) -> Properties {
        let mut properties = self.properties.clone();
        properties.insert(props::QUEUE_NAME.into(), Value::from(queue_name));
        properties.insert(props::TARGET_INSTANCE.into(), Value::from(target));
        properties.remove(props::STARTED_TIME);
        properties
    }

    /// Properties for the job after it lost its target.
    pub fn unassigned_properties(&self) -> Properties {
        let mut properties = self.properties.clone();
        properties.remove(props::QUEUE_NAME);
        properties.remove(props::TARGET_INSTANCE);
        properties.remove(props::STARTED_TIME);
        properties
    }
}
