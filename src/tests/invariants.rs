use super::{assert_queue_invariants, task_with};
use crate::{
    config::QueueConfig,
    models::{TaskError, TaskState, TaskType},
    queue::TaskQueue,
    CoScientistError,
};
use serde_json::Map;
use std::collections::HashMap;

fn tight_config() -> QueueConfig {
    let mut priority_quotas = HashMap::new();
    priority_quotas.insert("high".to_string(), 2);
    priority_quotas.insert("medium".to_string(), 2);
    priority_quotas.insert("low".to_string(), 2);
    QueueConfig {
        max_queue_size: 6,
        priority_quotas,
        ..QueueConfig::default()
    }
}

#[tokio::test]
async fn test_invariants_hold_across_mixed_workload() {
    let queue = TaskQueue::new(QueueConfig::default()).unwrap();

    // Interleave enqueues, dequeues, acks, completions and failures and
    // re-check the structural invariants after every step.
    let mut live_ids = Vec::new();
    for index in 0..6u8 {
        let id = queue
            .enqueue(task_with(TaskType::GenerateHypothesis, 1 + index % 3, "mix"))
            .await
            .unwrap();
        live_ids.push(id);
        assert_queue_invariants(&queue).await;
    }

    let first = queue.dequeue("w1").await.unwrap().unwrap();
    assert_queue_invariants(&queue).await;
    assert!(queue.acknowledge_task("w1", &first.assignment_id).await);
    assert_queue_invariants(&queue).await;
    assert!(
        queue
            .complete_task("w1", &first.task.id.to_string(), Map::new())
            .await
    );
    assert_queue_invariants(&queue).await;

    let second = queue.dequeue("w2").await.unwrap().unwrap();
    assert!(queue.acknowledge_task("w2", &second.assignment_id).await);
    assert!(
        queue
            .fail_task(
                "w2",
                &second.task.id.to_string(),
                TaskError::retryable("hiccup"),
            )
            .await
    );
    assert_queue_invariants(&queue).await;

    let third = queue.dequeue("w3").await.unwrap().unwrap();
    assert!(queue.acknowledge_task("w3", &third.assignment_id).await);
    assert!(
        queue
            .fail_task("w3", &third.task.id.to_string(), TaskError::fatal("poison"))
            .await
    );
    assert_queue_invariants(&queue).await;

    queue.mark_worker_failed("w1", "test crash").await;
    assert_queue_invariants(&queue).await;
}

#[tokio::test]
async fn test_band_quota_or_displacement_counter() {
    let queue = TaskQueue::new(tight_config()).unwrap();

    queue
        .enqueue(task_with(TaskType::GenerateHypothesis, 1, "a"))
        .await
        .unwrap();
    queue
        .enqueue(task_with(TaskType::GenerateHypothesis, 3, "b"))
        .await
        .unwrap();
    queue
        .enqueue(task_with(TaskType::GenerateHypothesis, 3, "c"))
        .await
        .unwrap();

    // The high band is at quota; the next high enqueue displaces from the
    // low band and the counter records it.
    queue
        .enqueue(task_with(TaskType::RankHypotheses, 3, "d"))
        .await
        .unwrap();
    assert_eq!(queue.size_by_priority("high").await, 3);
    assert_eq!(queue.size_by_priority("low").await, 0);
    assert_eq!(queue.get_overflow_statistics().await.total_displaced, 1);
    assert_queue_invariants(&queue).await;
}

#[tokio::test]
async fn test_displacement_never_touches_equal_priority() {
    let queue = TaskQueue::new(tight_config()).unwrap();

    for goal in ["a", "b"] {
        queue
            .enqueue(task_with(TaskType::GenerateHypothesis, 2, goal))
            .await
            .unwrap();
    }

    // Medium band at quota, no lower band entries: a medium enqueue cannot
    // displace its own band.
    assert!(matches!(
        queue
            .enqueue(task_with(TaskType::GenerateHypothesis, 2, "c"))
            .await,
        Err(CoScientistError::BandFull { band: "medium" })
    ));
    assert_eq!(queue.size_by_priority("medium").await, 2);
}

#[tokio::test]
async fn test_effective_priority_monotone_over_time() {
    let queue = TaskQueue::new(QueueConfig::default()).unwrap();
    let task_id = queue
        .enqueue(task_with(TaskType::GenerateHypothesis, 1, "waiting"))
        .await
        .unwrap();

    let mut last = queue
        .get_task_info(&task_id)
        .await
        .unwrap()
        .effective_priority;

    for backdate_minutes in [2i64, 5, 30] {
        {
            let mut st = queue.state.lock().await;
            st.task_enqueue_times.insert(
                task_id.clone(),
                chrono::Utc::now() - chrono::Duration::minutes(backdate_minutes),
            );
            let interval = queue.config().priority_boost_interval;
            let amount = queue.config().priority_boost_amount;
            st.apply_priority_boosts(interval, amount);
        }
        let current = queue
            .get_task_info(&task_id)
            .await
            .unwrap()
            .effective_priority;
        assert!(current >= last, "boost must be monotone non-decreasing");
        last = current;
    }
}

#[tokio::test]
async fn test_completed_task_leaves_queue_accounting_balanced() {
    let queue = TaskQueue::new(QueueConfig::default()).unwrap();

    let task_id = queue
        .enqueue(task_with(TaskType::MetaReview, 2, "audit"))
        .await
        .unwrap();
    let assignment = queue.dequeue("w1").await.unwrap().unwrap();
    queue.acknowledge_task("w1", &assignment.assignment_id).await;
    queue.complete_task("w1", &task_id, Map::new()).await;

    let stats = queue.get_queue_statistics().await;
    assert_eq!(stats.total_tasks, 0);
    assert_eq!(stats.task_states.completed, 1);
    assert_eq!(stats.active_assignments, 0);
    assert_eq!(queue.get_task_state(&task_id).await, Some(TaskState::Completed));
    assert_queue_invariants(&queue).await;
}
