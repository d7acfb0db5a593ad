use super::{payload, queue_with, small_config, task};
use crate::{
    config::QueueConfig,
    models::{AgentType, Task, TaskError, TaskState, TaskType},
    queue::{DlqReason, WorkerCapabilities, WorkerState},
    CoScientistError,
};
use chrono::{Duration, Utc};
use serde_json::Map;

#[tokio::test]
async fn test_enqueue_dequeue_basics() {
    let queue = queue_with(QueueConfig::default());
    let task = task(TaskType::GenerateHypothesis, 2);
    let task_id = queue.enqueue(task.clone()).await.unwrap();

    assert_eq!(queue.size().await, 1);
    assert_eq!(queue.size_by_priority("medium").await, 1);
    assert_eq!(queue.get_task_state(&task_id).await, Some(TaskState::Pending));

    let assignment = queue.dequeue("w1").await.unwrap().unwrap();
    assert_eq!(assignment.task.id, task.id);
    assert_eq!(assignment.worker_id, "w1");
    assert!(assignment.acknowledgment_required_by < assignment.deadline);
    assert_eq!(queue.size().await, 0);
    assert_eq!(
        queue.get_task_state(&task_id).await,
        Some(TaskState::Assigned)
    );
    assert_eq!(queue.active_workers().await, 1);
}

#[tokio::test]
async fn test_dequeue_empty_returns_none() {
    let queue = queue_with(QueueConfig::default());
    assert!(queue.dequeue("w1").await.unwrap().is_none());
    // The worker was auto-registered on the way
    assert!(queue.is_worker_registered("w1").await);
}

#[tokio::test]
async fn test_invalid_priority_rejected() {
    let queue = queue_with(QueueConfig::default());
    let mut bad = task(TaskType::GenerateHypothesis, 3);
    bad.priority = 7;
    assert!(matches!(
        queue.enqueue(bad).await,
        Err(CoScientistError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_priority_ordering_across_bands() {
    let queue = queue_with(QueueConfig::default());
    let low = task(TaskType::GenerateHypothesis, 1);
    let high = task(TaskType::RankHypotheses, 3);
    let medium = task(TaskType::ReflectOnHypothesis, 2);

    queue.enqueue(low.clone()).await.unwrap();
    queue.enqueue(high.clone()).await.unwrap();
    queue.enqueue(medium.clone()).await.unwrap();

    let first = queue.dequeue("w1").await.unwrap().unwrap();
    queue.acknowledge_task("w1", &first.assignment_id).await;
    queue
        .complete_task("w1", &first.task.id.to_string(), Map::new())
        .await;
    let second = queue.dequeue("w1").await.unwrap().unwrap();
    queue.acknowledge_task("w1", &second.assignment_id).await;
    queue
        .complete_task("w1", &second.task.id.to_string(), Map::new())
        .await;
    let third = queue.dequeue("w1").await.unwrap().unwrap();

    assert_eq!(first.task.id, high.id);
    assert_eq!(second.task.id, medium.id);
    assert_eq!(third.task.id, low.id);
}

#[tokio::test]
async fn test_fifo_within_band() {
    let queue = queue_with(QueueConfig::default());
    let first = task(TaskType::GenerateHypothesis, 2);
    let second = task(TaskType::GenerateHypothesis, 2);
    queue.enqueue(first.clone()).await.unwrap();
    queue.enqueue(second.clone()).await.unwrap();

    let assignment = queue.dequeue("w1").await.unwrap().unwrap();
    assert_eq!(assignment.task.id, first.id);
}

#[tokio::test]
async fn test_peek_does_not_mutate() {
    let queue = queue_with(QueueConfig::default());
    let high = task(TaskType::RankHypotheses, 3);
    queue.enqueue(task(TaskType::GenerateHypothesis, 1)).await.unwrap();
    queue.enqueue(high.clone()).await.unwrap();

    let peeked = queue.peek().await.unwrap();
    assert_eq!(peeked.id, high.id);
    assert_eq!(queue.size().await, 2);
    assert_eq!(
        queue.get_task_state(&high.id.to_string()).await,
        Some(TaskState::Pending)
    );
}

#[tokio::test]
async fn test_capability_matching() {
    let queue = queue_with(QueueConfig::default());
    queue.enable_capability_matching().await;

    queue
        .register_worker(
            "gen-worker",
            WorkerCapabilities::for_agents([AgentType::Generation]),
        )
        .await;
    queue
        .register_worker(
            "rank-worker",
            WorkerCapabilities::for_agents([AgentType::Ranking]),
        )
        .await;

    let rank_task = task(TaskType::RankHypotheses, 3);
    queue.enqueue(rank_task.clone()).await.unwrap();

    // The generation worker cannot take the ranking task
    assert!(queue.dequeue("gen-worker").await.unwrap().is_none());
    assert_eq!(
        queue.get_task_state(&rank_task.id.to_string()).await,
        Some(TaskState::Pending)
    );

    let assignment = queue.dequeue("rank-worker").await.unwrap().unwrap();
    assert_eq!(assignment.task.id, rank_task.id);
}

#[tokio::test]
async fn test_capability_matching_disabled_allows_all() {
    let queue = queue_with(QueueConfig::default());
    queue
        .register_worker("w1", WorkerCapabilities::default())
        .await;
    queue.enqueue(task(TaskType::MetaReview, 2)).await.unwrap();

    assert!(queue.dequeue("w1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_acknowledge_wrong_worker_rejected() {
    let queue = queue_with(QueueConfig::default());
    queue.enqueue(task(TaskType::GenerateHypothesis, 2)).await.unwrap();
    let assignment = queue.dequeue("w1").await.unwrap().unwrap();

    assert!(!queue.acknowledge_task("w2", &assignment.assignment_id).await);
    assert!(queue.acknowledge_task("w1", &assignment.assignment_id).await);
    // Double acknowledgement is rejected: the task already left `assigned`
    assert!(!queue.acknowledge_task("w1", &assignment.assignment_id).await);
}

#[tokio::test]
async fn test_complete_requires_ownership() {
    let queue = queue_with(QueueConfig::default());
    let task = task(TaskType::GenerateHypothesis, 2);
    let task_id = queue.enqueue(task).await.unwrap();
    let assignment = queue.dequeue("w1").await.unwrap().unwrap();
    queue.acknowledge_task("w1", &assignment.assignment_id).await;

    assert!(!queue.complete_task("w2", &task_id, Map::new()).await);
    assert!(queue.complete_task("w1", &task_id, Map::new()).await);
    assert_eq!(queue.get_task_state(&task_id).await, Some(TaskState::Completed));
    // Already terminal
    assert!(!queue.complete_task("w1", &task_id, Map::new()).await);
    assert_eq!(queue.active_workers().await, 0);
    assert_eq!(queue.idle_workers().await, 1);
}

#[tokio::test]
async fn test_retryable_failure_requeues_at_tail() {
    let queue = queue_with(QueueConfig::default());
    let failing = task(TaskType::GenerateHypothesis, 2);
    let other = task(TaskType::GenerateHypothesis, 2);
    let failing_id = queue.enqueue(failing).await.unwrap();
    queue.enqueue(other.clone()).await.unwrap();

    let assignment = queue.dequeue("w1").await.unwrap().unwrap();
    assert_eq!(assignment.task.id.to_string(), failing_id);
    queue.acknowledge_task("w1", &assignment.assignment_id).await;
    assert!(
        queue
            .fail_task("w1", &failing_id, TaskError::retryable("transient"))
            .await
    );

    assert_eq!(queue.get_task_state(&failing_id).await, Some(TaskState::Pending));
    let info = queue.get_task_info(&failing_id).await.unwrap();
    assert_eq!(info.retry_count, 1);
    assert_eq!(info.failure_history.len(), 1);

    // The retried task sits behind the other pending task
    let next = queue.dequeue("w1").await.unwrap().unwrap();
    assert_eq!(next.task.id, other.id);
}

#[tokio::test]
async fn test_nonretryable_failure_dead_letters() {
    let queue = queue_with(QueueConfig::default());
    let task_id = queue
        .enqueue(task(TaskType::GenerateHypothesis, 2))
        .await
        .unwrap();
    let assignment = queue.dequeue("w1").await.unwrap().unwrap();
    queue.acknowledge_task("w1", &assignment.assignment_id).await;
    queue
        .fail_task("w1", &task_id, TaskError::fatal("bad payload"))
        .await;

    assert_eq!(queue.get_task_state(&task_id).await, Some(TaskState::Failed));
    let entry = queue.dlq_entry(&task_id).await.unwrap();
    assert_eq!(entry.reason, DlqReason::NonRetryableError);
    assert_eq!(entry.retry_count, 1);
    assert_eq!(queue.dlq_tasks().await, vec![task_id]);
    assert_eq!(queue.size().await, 0);
}

#[tokio::test]
async fn test_retry_boundary_is_max_attempts_minus_one() {
    // max_attempts = 2: one retry, then the second failure dead-letters
    let mut config = QueueConfig::default();
    config.retry_policy.max_attempts = 2;
    let queue = queue_with(config);

    let task_id = queue
        .enqueue(task(TaskType::GenerateHypothesis, 2))
        .await
        .unwrap();

    // First attempt
    let assignment = queue.dequeue("w1").await.unwrap().unwrap();
    queue.acknowledge_task("w1", &assignment.assignment_id).await;
    queue
        .fail_task("w1", &task_id, TaskError::retryable("flaky"))
        .await;
    assert_eq!(queue.get_task_state(&task_id).await, Some(TaskState::Pending));

    // Second attempt exhausts the budget
    let assignment = queue.dequeue("w1").await.unwrap().unwrap();
    queue.acknowledge_task("w1", &assignment.assignment_id).await;
    queue
        .fail_task("w1", &task_id, TaskError::retryable("flaky"))
        .await;

    assert_eq!(queue.get_task_state(&task_id).await, Some(TaskState::Failed));
    let entry = queue.dlq_entry(&task_id).await.unwrap();
    assert_eq!(entry.reason, DlqReason::RetryExhaustion);
    assert_eq!(entry.retry_count, 2);

    let stats = queue.dlq_statistics().await;
    assert_eq!(stats.total_tasks, 1);
    assert_eq!(stats.by_reason.get("retry_exhaustion"), Some(&1));
}

#[tokio::test]
async fn test_dlq_replay_preserves_failure_history() {
    let mut config = QueueConfig::default();
    config.retry_policy.max_attempts = 1;
    let queue = queue_with(config);

    let task_id = queue
        .enqueue(task(TaskType::EvolveHypothesis, 2))
        .await
        .unwrap();
    let assignment = queue.dequeue("w1").await.unwrap().unwrap();
    queue.acknowledge_task("w1", &assignment.assignment_id).await;
    queue
        .fail_task("w1", &task_id, TaskError::retryable("boom"))
        .await;
    assert_eq!(queue.dlq_tasks().await.len(), 1);

    assert!(queue.replay_from_dlq(&task_id).await);
    assert!(queue.dlq_tasks().await.is_empty());
    assert_eq!(queue.get_task_state(&task_id).await, Some(TaskState::Pending));
    assert_eq!(queue.size().await, 1);

    let info = queue.get_task_info(&task_id).await.unwrap();
    assert_eq!(info.retry_count, 0);
    assert_eq!(info.failure_history.len(), 1);

    // Replaying an id that is not dead-lettered fails softly
    assert!(!queue.replay_from_dlq(&task_id).await);
}

#[tokio::test]
async fn test_queue_full_with_no_displaceable_band() {
    let queue = queue_with(small_config());
    for _ in 0..3 {
        queue.enqueue(task(TaskType::GenerateHypothesis, 3)).await.unwrap();
    }
    for _ in 0..4 {
        queue.enqueue(task(TaskType::GenerateHypothesis, 2)).await.unwrap();
    }
    for _ in 0..3 {
        queue.enqueue(task(TaskType::GenerateHypothesis, 1)).await.unwrap();
    }

    // A low-priority task displaces nothing and the total is at capacity
    assert!(matches!(
        queue.enqueue(task(TaskType::GenerateHypothesis, 1)).await,
        Err(CoScientistError::QueueFull)
    ));
}

#[tokio::test]
async fn test_band_full_without_lower_band_to_displace() {
    let queue = queue_with(small_config());
    for _ in 0..3 {
        queue.enqueue(task(TaskType::GenerateHypothesis, 3)).await.unwrap();
    }

    // High band is at quota and both lower bands are empty
    assert!(matches!(
        queue.enqueue(task(TaskType::GenerateHypothesis, 3)).await,
        Err(CoScientistError::BandFull { band: "high" })
    ));
}

#[tokio::test]
async fn test_reject_strategy_never_displaces() {
    let config = crate::config::QueueConfig {
        overflow_strategy: crate::config::OverflowStrategy::Reject,
        ..small_config()
    };
    let queue = queue_with(config);

    for _ in 0..3 {
        queue.enqueue(task(TaskType::GenerateHypothesis, 1)).await.unwrap();
    }
    for _ in 0..4 {
        queue.enqueue(task(TaskType::GenerateHypothesis, 2)).await.unwrap();
    }
    for _ in 0..3 {
        queue.enqueue(task(TaskType::GenerateHypothesis, 3)).await.unwrap();
    }

    // Even a high-priority enqueue is rejected outright
    assert!(matches!(
        queue.enqueue(task(TaskType::RankHypotheses, 3)).await,
        Err(CoScientistError::QueueFull)
    ));
    assert_eq!(queue.get_overflow_statistics().await.total_displaced, 0);
}

#[tokio::test]
async fn test_overflow_displaces_oldest_lowest() {
    let queue = queue_with(small_config());
    let oldest_low = task(TaskType::GenerateHypothesis, 1);
    queue.enqueue(oldest_low.clone()).await.unwrap();
    for _ in 0..2 {
        queue.enqueue(task(TaskType::GenerateHypothesis, 1)).await.unwrap();
    }
    for _ in 0..4 {
        queue.enqueue(task(TaskType::GenerateHypothesis, 2)).await.unwrap();
    }
    for _ in 0..3 {
        queue.enqueue(task(TaskType::GenerateHypothesis, 3)).await.unwrap();
    }
    assert_eq!(queue.size().await, 10);

    // Equal priority is never displaced, so the high band rejects its fourth
    // task only when no lower band has entries; here it displaces the oldest
    // low task instead.
    let newcomer = task(TaskType::RankHypotheses, 3);
    queue.enqueue(newcomer.clone()).await.unwrap();

    assert_eq!(queue.size().await, 10);
    assert_eq!(queue.size_by_priority("low").await, 2);
    assert_eq!(queue.size_by_priority("high").await, 4);
    assert!(queue
        .get_task_state(&oldest_low.id.to_string())
        .await
        .is_none());

    let overflow = queue.get_overflow_statistics().await;
    assert_eq!(overflow.total_displaced, 1);
    assert_eq!(overflow.displacement_by_priority.get("low"), Some(&1));
}

#[tokio::test]
async fn test_starvation_boost_reorders_dequeue() {
    let mut config = QueueConfig::default();
    config.priority_boost_interval = 60;
    config.priority_boost_amount = 0.1;
    let queue = queue_with(config);

    let starved_low = task(TaskType::GenerateHypothesis, 1);
    let fresh_high = task(TaskType::RankHypotheses, 3);
    let starved_id = queue.enqueue(starved_low.clone()).await.unwrap();
    queue.enqueue(fresh_high.clone()).await.unwrap();

    // Backdate the low task far enough that its boost overtakes the high
    // band: 25 intervals x 0.1 = +2.5 effective priority.
    {
        let mut st = queue.state.lock().await;
        let backdated = Utc::now() - Duration::seconds(25 * 60);
        st.task_enqueue_times.insert(starved_id.clone(), backdated);
    }

    let assignment = queue.dequeue("w1").await.unwrap().unwrap();
    assert_eq!(assignment.task.id, starved_low.id);

    let info = queue.get_task_info(&fresh_high.id.to_string()).await.unwrap();
    assert_eq!(info.effective_priority, 3.0);
}

#[tokio::test]
async fn test_boost_is_monotone_while_pending() {
    let queue = queue_with(QueueConfig::default());
    let task_id = queue
        .enqueue(task(TaskType::GenerateHypothesis, 1))
        .await
        .unwrap();

    {
        let mut st = queue.state.lock().await;
        let backdated = Utc::now() - Duration::seconds(130);
        st.task_enqueue_times.insert(task_id.clone(), backdated);
        st.apply_priority_boosts(60, 0.1);
        let first = st.task_boost_levels[&task_id];
        assert!((first - 0.2).abs() < 1e-9);

        // A later recomputation never lowers the boost
        st.apply_priority_boosts(60, 0.1);
        assert!(st.task_boost_levels[&task_id] >= first);
    }

    let stats = queue.get_starvation_statistics().await;
    assert_eq!(stats.tasks_boosted, 1);
    assert!(stats.max_wait_time_secs >= 130.0);
}

#[tokio::test]
async fn test_worker_registry_operations() {
    let queue = queue_with(QueueConfig::default());
    queue
        .register_worker(
            "w1",
            WorkerCapabilities::for_agents([AgentType::Generation, AgentType::Reflection]),
        )
        .await;
    queue
        .register_worker("w2", WorkerCapabilities::for_agents([AgentType::Ranking]))
        .await;

    assert!(queue.is_worker_registered("w1").await);
    assert_eq!(queue.registered_workers().await.len(), 2);
    assert_eq!(
        queue.get_workers_by_capability(AgentType::Generation).await,
        ["w1".to_string()].into_iter().collect()
    );
    assert_eq!(
        queue.get_workers_by_state(WorkerState::Idle).await.len(),
        2
    );

    assert!(queue.unregister_worker("w2").await);
    assert!(!queue.unregister_worker("w2").await);
    assert!(!queue.is_worker_registered("w2").await);
}

#[tokio::test]
async fn test_reregistration_preserves_active_assignment() {
    let queue = queue_with(QueueConfig::default());
    queue
        .register_worker("w1", WorkerCapabilities::for_agents([AgentType::Generation]))
        .await;
    let task_id = queue
        .enqueue(task(TaskType::GenerateHypothesis, 2))
        .await
        .unwrap();
    queue.dequeue("w1").await.unwrap().unwrap();

    queue
        .register_worker("w1", WorkerCapabilities::for_agents([AgentType::Generation]))
        .await;

    let status = queue.get_worker_status("w1").await.unwrap();
    assert_eq!(status.state, WorkerState::Active);
    assert_eq!(status.assigned_task, Some(task_id));
}

#[tokio::test]
async fn test_heartbeat_unknown_worker_fails() {
    let queue = queue_with(QueueConfig::default());
    assert!(matches!(
        queue.heartbeat("ghost", None).await,
        Err(CoScientistError::UnknownWorker(_))
    ));
}

#[tokio::test]
async fn test_heartbeat_records_progress_and_heals() {
    let queue = queue_with(QueueConfig::default());
    queue
        .register_worker("w1", WorkerCapabilities::default())
        .await;
    let task_id = queue
        .enqueue(task(TaskType::GenerateHypothesis, 2))
        .await
        .unwrap();
    queue.dequeue("w1").await.unwrap().unwrap();

    queue.heartbeat("w1", Some(payload("halfway"))).await.unwrap();
    let info = queue.get_task_info(&task_id).await.unwrap();
    assert_eq!(info.progress.get("goal"), Some(&serde_json::json!("halfway")));

    // A failed worker heals itself with a heartbeat
    queue.mark_worker_failed("w1", "test").await;
    assert_eq!(
        queue.get_worker_status("w1").await.unwrap().state,
        WorkerState::Failed
    );
    queue.heartbeat("w1", None).await.unwrap();
    assert_eq!(
        queue.get_worker_status("w1").await.unwrap().state,
        WorkerState::Idle
    );
}

#[tokio::test]
async fn test_statistics_suite_counts() {
    let queue = queue_with(QueueConfig::default());
    queue.enqueue(task(TaskType::GenerateHypothesis, 3)).await.unwrap();
    queue.enqueue(task(TaskType::ReflectOnHypothesis, 2)).await.unwrap();
    let done_id = queue
        .enqueue(task(TaskType::RankHypotheses, 2))
        .await
        .unwrap();

    queue
        .register_worker("w1", WorkerCapabilities::default())
        .await;
    let assignment = queue.dequeue("w1").await.unwrap().unwrap();
    queue.acknowledge_task("w1", &assignment.assignment_id).await;
    let first_task_id = assignment.task.id.to_string();
    queue.complete_task("w1", &first_task_id, Map::new()).await;

    let stats = queue.get_queue_statistics().await;
    assert_eq!(stats.total_tasks, 2);
    assert_eq!(stats.task_states.pending, 2);
    assert_eq!(stats.task_states.completed, 1);
    assert_eq!(stats.worker_stats.total, 1);
    assert_eq!(stats.active_assignments, 0);

    let throughput = queue.get_throughput_metrics().await;
    assert_eq!(throughput.completed_last_minute, 1);

    let wait = queue.get_wait_time_statistics().await;
    assert_eq!(wait.sample_size, 1);

    let by_agent = queue.get_metrics_by_agent_type().await;
    assert_eq!(by_agent[&AgentType::Reflection].pending_tasks, 1);
    assert_eq!(by_agent[&AgentType::Generation].completed_tasks, 1);

    let capacity = queue.get_capacity_statistics().await;
    assert_eq!(capacity.current_size, 2);
    assert!(!capacity.warnings.near_capacity);

    let detailed = queue.get_detailed_metrics().await;
    assert_eq!(detailed.queue_statistics.total_tasks, 2);
    let _ = done_id;
}

#[tokio::test]
async fn test_task_serialisation_is_lossless_through_queue() {
    let queue = queue_with(QueueConfig::default());
    let original = task(TaskType::FindSimilarHypotheses, 3);
    queue.enqueue(original.clone()).await.unwrap();

    let snapshot = queue.export_state().await;
    let restored = &snapshot.tasks[&original.id.to_string()];
    assert_eq!(restored.id, original.id);
    assert_eq!(restored.task_type, original.task_type);
    assert_eq!(restored.payload, original.payload);
    assert_eq!(restored.created_at, original.created_at);
}

#[tokio::test]
async fn test_backwards_compatible_unvalidated_task(){
    // Tasks with recognised types but arbitrary payloads pass through the
    // queue untouched.
    let queue = queue_with(QueueConfig::default());
    let mut odd_payload = Map::new();
    odd_payload.insert("anything".to_string(), serde_json::json!({"deep": [1, 2, 3]}));
    let task = Task::new(TaskType::MetaReview, 1, odd_payload.clone()).unwrap();
    queue.enqueue(task.clone()).await.unwrap();

    let assignment = queue.dequeue("w1").await.unwrap().unwrap();
    assert_eq!(assignment.task.payload, odd_payload);
}
