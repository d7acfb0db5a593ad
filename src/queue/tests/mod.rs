mod unit;

use crate::{
    config::QueueConfig,
    models::{Task, TaskType},
    queue::TaskQueue,
};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

pub(crate) fn small_config() -> QueueConfig {
    let mut priority_quotas = HashMap::new();
    priority_quotas.insert("high".to_string(), 3);
    priority_quotas.insert("medium".to_string(), 4);
    priority_quotas.insert("low".to_string(), 3);

    QueueConfig {
        max_queue_size: 10,
        priority_quotas,
        ..QueueConfig::default()
    }
}

pub(crate) fn queue_with(config: QueueConfig) -> TaskQueue {
    TaskQueue::new(config).unwrap()
}

pub(crate) fn payload(goal: &str) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("goal".to_string(), json!(goal));
    map
}

pub(crate) fn task(task_type: TaskType, priority: u8) -> Task {
    Task::new(task_type, priority, payload("test")).unwrap()
}
