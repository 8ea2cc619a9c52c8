use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use beacon_core::job::{QueueConfiguration, QueueInfo, MAIN_QUEUE_NAME};

/// Resolves topics to queues.
///
/// Every update bumps a change counter that maintenance compares against
/// to decide whether unassigned jobs need another look.
pub struct QueueConfigurationManager {
    queues: RwLock<Vec<QueueConfiguration>>,
    change_count: AtomicU64,
}

impl QueueConfigurationManager {
    /// Create a manager holding the given queues.
    pub fn new(queues: Vec<QueueConfiguration>) -> Self {
        Self {
            queues: RwLock::new(Self::ordered(queues)),
            change_count: AtomicU64::new(0),
        }
    }

    fn ordered(mut queues: Vec<QueueConfiguration>) -> Vec<QueueConfiguration> {
        queues.sort_by(|a, b| b.ranking.cmp(&a.ranking));
        queues
    }

    /// The highest ranked queue matching `topic`, or the main queue.
    pub fn get_queue_info(&self, topic: &str) -> QueueInfo {
        let matched = self
            .queues
            .read()
            .ok()
            .and_then(|queues| queues.iter().find(|q| q.matches(topic)).cloned());

        match matched {
            Some(config) => QueueInfo {
                queue_name: config.name.clone(),
                config,
            },
            None => QueueInfo {
                queue_name: MAIN_QUEUE_NAME.to_string(),
                config: QueueConfiguration::main_queue(),
            },
        }
    }

    /// Replace all queue configurations.
    pub fn update(&self, queues: Vec<QueueConfiguration>) {
        let count = queues.len();
        if let Ok(mut current) = self.queues.write() {
            *current = Self::ordered(queues);
        }
        let changes = self.change_count.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(queues = count, change_count = changes, "Queue configuration updated");
    }

    /// Bumped by every update.
    pub fn change_count(&self) -> u64 {
        self.change_count.load(Ordering::SeqCst)
    }

    /// Snapshot of the configured queues.
    pub fn queues(&self) -> Vec<QueueConfiguration> {
        self.queues.read().map(|q| q.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::job::QueueType;

    #[test]
    fn test_falls_back_to_main_queue() {
        let manager = QueueConfigurationManager::new(Vec::new());
        let info = manager.get_queue_info("any/topic");
        assert_eq!(info.queue_name, MAIN_QUEUE_NAME);
        assert_eq!(info.queue_type(), QueueType::Unordered);
    }

    #[test]
    fn test_highest_ranking_wins() {
        let manager = QueueConfigurationManager::new(vec![
            QueueConfiguration::new("low", QueueType::Ordered).with_topics(["mail/*"]),
            QueueConfiguration::new("high", QueueType::Drop)
                .with_topics(["mail/spam"])
                .with_ranking(10),
        ]);
        assert_eq!(manager.get_queue_info("mail/spam").queue_name, "high");
        assert_eq!(manager.get_queue_info("mail/send").queue_name, "low");
    }

    #[test]
    fn test_update_bumps_change_count() {
        let manager = QueueConfigurationManager::new(Vec::new());
        assert_eq!(manager.change_count(), 0);
        manager.update(vec![
            QueueConfiguration::new("drop", QueueType::Drop).with_topics(["t"]),
        ]);
        assert_eq!(manager.change_count(), 1);
        assert_eq!(manager.get_queue_info("t").queue_type(), QueueType::Drop);
    }
}
