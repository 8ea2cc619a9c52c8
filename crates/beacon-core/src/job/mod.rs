mod layout;
mod queue;
mod resource;

pub use layout::{JobLayout, BUCKET_DEPTH};
pub use queue::{topic_matches, QueueConfiguration, QueueInfo, QueueType, MAIN_QUEUE_NAME};
pub use resource::{props, JobResource};
