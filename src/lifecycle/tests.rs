use super::*;
use crate::bus::Topic;
use crate::config::QueueConfig;
use crate::models::{SubmitTaskParams, TaskStatus};
use crate::storage::MemoryStore;

fn lifecycle_with_queue(acceptance_timeout_ms: u64) -> (AgentLifecycle, TaskQueue, EventBus) {
    let bus = EventBus::new();
    let queue = TaskQueue::open(
        Arc::new(MemoryStore::new()),
        bus.clone(),
        QueueConfig {
            data_dir: String::new(),
            max_queue_size: 100,
            max_retries_default: 3,
            overdue_sweep_interval_ms: 30_000,
            assignment_ttl_ms: 600_000,
        },
    )
    .unwrap();
    let lifecycle = AgentLifecycle::new(
        queue.clone(),
        bus.clone(),
        LifecycleConfig {
            acceptance_timeout_ms,
        },
    );
    (lifecycle, queue, bus)
}

fn caps(tags: &[&str]) -> BTreeSet<String> {
    tags.iter().map(|s| s.to_string()).collect()
}

async fn submit_and_assign(queue: &TaskQueue, agent_id: &str) -> (String, AssignmentEnvelope) {
    let task_id = queue
        .submit(SubmitTaskParams {
            description: "do the work".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    let envelope = queue.assign(&task_id, agent_id).await.unwrap();
    (task_id, envelope)
}

#[tokio::test]
async fn test_ensure_brings_agent_idle_and_publishes_joined() {
    let (lifecycle, _, bus) = lifecycle_with_queue(60_000);
    let mut rx = bus.subscribe(Topic::Agent);
    let (tx, _keep) = mpsc::unbounded_channel();

    lifecycle.ensure("a-1", caps(&["code", "review"]), tx).await;

    let snapshot = lifecycle.snapshot_of("a-1").await.unwrap();
    assert_eq!(snapshot.fsm_state, AgentFsmState::Idle);
    assert!(snapshot.connected_at.is_some());
    assert!(snapshot.capabilities.contains("code"));
    assert!(matches!(
        rx.recv().await.unwrap(),
        HubEvent::AgentJoined { .. }
    ));
}

#[tokio::test]
async fn test_push_task_sends_envelope_and_marks_assigned() {
    let (lifecycle, queue, _) = lifecycle_with_queue(60_000);
    let (tx, mut frames) = mpsc::unbounded_channel();
    lifecycle.ensure("a-1", caps(&["code"]), tx).await;

    let (task_id, envelope) = submit_and_assign(&queue, "a-1").await;
    lifecycle.push_task("a-1", envelope).await.unwrap();

    let snapshot = lifecycle.snapshot_of("a-1").await.unwrap();
    assert_eq!(snapshot.fsm_state, AgentFsmState::Assigned);
    assert_eq!(snapshot.current_task_id.as_deref(), Some(task_id.as_str()));
    assert_eq!(snapshot.current_generation, Some(1));

    match frames.recv().await.unwrap() {
        ServerFrame::TaskAssign {
            task_id: pushed,
            generation,
            ..
        } => {
            assert_eq!(pushed, task_id);
            assert_eq!(generation, 1);
        }
        other => panic!("unexpected frame: {other:?}"),
    }
}

#[tokio::test]
async fn test_push_task_rejects_busy_agent() {
    let (lifecycle, queue, _) = lifecycle_with_queue(60_000);
    let (tx, _frames) = mpsc::unbounded_channel();
    lifecycle.ensure("a-1", caps(&["code"]), tx).await;

    let (_, envelope_a) = submit_and_assign(&queue, "a-1").await;
    lifecycle.push_task("a-1", envelope_a).await.unwrap();

    let (_, envelope_b) = submit_and_assign(&queue, "a-1").await;
    let second = lifecycle.push_task("a-1", envelope_b).await;
    assert!(matches!(second, Err(HubError::AgentBusy { .. })));
}

#[tokio::test]
async fn test_push_task_with_dead_session_fails() {
    let (lifecycle, queue, _) = lifecycle_with_queue(60_000);
    let (tx, frames) = mpsc::unbounded_channel();
    lifecycle.ensure("a-1", caps(&[]), tx).await;
    drop(frames);

    let (_, envelope) = submit_and_assign(&queue, "a-1").await;
    let result = lifecycle.push_task("a-1", envelope).await;
    assert!(matches!(result, Err(HubError::SessionLost { .. })));
}

#[tokio::test]
async fn test_accept_then_complete_settles_task_and_idles_agent() {
    let (lifecycle, queue, bus) = lifecycle_with_queue(60_000);
    let mut rx = bus.subscribe(Topic::Agent);
    let (tx, _frames) = mpsc::unbounded_channel();
    lifecycle.ensure("a-1", caps(&["code"]), tx).await;

    let (task_id, envelope) = submit_and_assign(&queue, "a-1").await;
    lifecycle.push_task("a-1", envelope).await.unwrap();
    lifecycle.on_accepted("a-1", &task_id, 1).await;
    assert_eq!(
        lifecycle.snapshot_of("a-1").await.unwrap().fsm_state,
        AgentFsmState::Working
    );

    let ack = lifecycle
        .on_completed("a-1", &task_id, 1, serde_json::json!({"status": "success"}))
        .await;
    assert_eq!(ack, ReportAck::Complete);
    assert_eq!(
        lifecycle.snapshot_of("a-1").await.unwrap().fsm_state,
        AgentFsmState::Idle
    );
    assert_eq!(
        queue.get(&task_id).await.unwrap().status,
        TaskStatus::Completed
    );

    // joined, then idle after completion.
    assert!(matches!(
        rx.recv().await.unwrap(),
        HubEvent::AgentJoined { .. }
    ));
    assert!(matches!(rx.recv().await.unwrap(), HubEvent::AgentIdle { .. }));
}

#[tokio::test]
async fn test_mismatched_accept_is_dropped() {
    let (lifecycle, queue, _) = lifecycle_with_queue(60_000);
    let (tx, _frames) = mpsc::unbounded_channel();
    lifecycle.ensure("a-1", caps(&["code"]), tx).await;

    let (task_id, envelope) = submit_and_assign(&queue, "a-1").await;
    lifecycle.push_task("a-1", envelope).await.unwrap();

    lifecycle.on_accepted("a-1", &task_id, 99).await;
    assert_eq!(
        lifecycle.snapshot_of("a-1").await.unwrap().fsm_state,
        AgentFsmState::Assigned
    );
}

#[tokio::test]
async fn test_duplicate_completion_acks_stale() {
    let (lifecycle, queue, _) = lifecycle_with_queue(60_000);
    let (tx, _frames) = mpsc::unbounded_channel();
    lifecycle.ensure("a-1", caps(&[]), tx).await;

    let (task_id, envelope) = submit_and_assign(&queue, "a-1").await;
    lifecycle.push_task("a-1", envelope).await.unwrap();
    lifecycle.on_accepted("a-1", &task_id, 1).await;

    let first = lifecycle
        .on_completed("a-1", &task_id, 1, serde_json::json!({"status": "success"}))
        .await;
    let second = lifecycle
        .on_completed("a-1", &task_id, 1, serde_json::json!({"status": "success"}))
        .await;
    assert_eq!(first, ReportAck::Complete);
    assert_eq!(second, ReportAck::Stale);
}

#[tokio::test]
async fn test_failure_requeues_task_and_idles_agent() {
    let (lifecycle, queue, _) = lifecycle_with_queue(60_000);
    let (tx, _frames) = mpsc::unbounded_channel();
    lifecycle.ensure("a-1", caps(&[]), tx).await;

    let (task_id, envelope) = submit_and_assign(&queue, "a-1").await;
    lifecycle.push_task("a-1", envelope).await.unwrap();
    lifecycle.on_accepted("a-1", &task_id, 1).await;

    let ack = lifecycle.on_failed("a-1", &task_id, 1, "tests failed").await;
    assert_eq!(ack, ReportAck::Failed);

    let task = queue.get(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.retry_count, 1);
    assert_eq!(
        lifecycle.snapshot_of("a-1").await.unwrap().fsm_state,
        AgentFsmState::Idle
    );
}

#[tokio::test]
async fn test_reject_reclaims_task() {
    let (lifecycle, queue, _) = lifecycle_with_queue(60_000);
    let (tx, _frames) = mpsc::unbounded_channel();
    lifecycle.ensure("a-1", caps(&[]), tx).await;

    let (task_id, envelope) = submit_and_assign(&queue, "a-1").await;
    lifecycle.push_task("a-1", envelope).await.unwrap();
    lifecycle
        .on_rejected("a-1", &task_id, 1, "wrong toolchain")
        .await;

    let task = queue.get(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.generation, 2);
    assert_eq!(
        lifecycle.snapshot_of("a-1").await.unwrap().fsm_state,
        AgentFsmState::Idle
    );
}

#[tokio::test]
async fn test_acceptance_timeout_reclaims_unacked_assignment() {
    let (lifecycle, queue, _) = lifecycle_with_queue(30);
    let (tx, _frames) = mpsc::unbounded_channel();
    lifecycle.ensure("a-1", caps(&[]), tx).await;

    let (task_id, envelope) = submit_and_assign(&queue, "a-1").await;
    lifecycle.push_task("a-1", envelope).await.unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;

    let task = queue.get(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.generation, 2);
    assert_eq!(
        lifecycle.snapshot_of("a-1").await.unwrap().fsm_state,
        AgentFsmState::Idle
    );
}

#[tokio::test]
async fn test_acceptance_timeout_is_inert_after_accept() {
    let (lifecycle, queue, _) = lifecycle_with_queue(30);
    let (tx, _frames) = mpsc::unbounded_channel();
    lifecycle.ensure("a-1", caps(&[]), tx).await;

    let (task_id, envelope) = submit_and_assign(&queue, "a-1").await;
    lifecycle.push_task("a-1", envelope).await.unwrap();
    lifecycle.on_accepted("a-1", &task_id, 1).await;

    tokio::time::sleep(Duration::from_millis(120)).await;

    assert_eq!(
        queue.get(&task_id).await.unwrap().status,
        TaskStatus::Assigned
    );
    assert_eq!(
        lifecycle.snapshot_of("a-1").await.unwrap().fsm_state,
        AgentFsmState::Working
    );
}

#[tokio::test]
async fn test_session_loss_reclaims_and_goes_offline() {
    let (lifecycle, queue, bus) = lifecycle_with_queue(60_000);
    let mut rx = bus.subscribe(Topic::Agent);
    let (tx, _frames) = mpsc::unbounded_channel();
    lifecycle.ensure("a-1", caps(&[]), tx).await;

    let (task_id, envelope) = submit_and_assign(&queue, "a-1").await;
    lifecycle.push_task("a-1", envelope).await.unwrap();
    lifecycle.on_accepted("a-1", &task_id, 1).await;

    lifecycle.on_session_loss("a-1").await;

    let snapshot = lifecycle.snapshot_of("a-1").await.unwrap();
    assert_eq!(snapshot.fsm_state, AgentFsmState::Offline);
    assert!(snapshot.connected_at.is_none());
    assert!(snapshot.current_task_id.is_none());

    let task = queue.get(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.generation, 2);

    assert!(matches!(
        rx.recv().await.unwrap(),
        HubEvent::AgentJoined { .. }
    ));
    assert!(matches!(rx.recv().await.unwrap(), HubEvent::AgentLeft { .. }));

    // A second loss is a no-op.
    lifecycle.on_session_loss("a-1").await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_list_idle_orders_by_least_recently_active() {
    let (lifecycle, _, _) = lifecycle_with_queue(60_000);
    let (tx_a, _fa) = mpsc::unbounded_channel();
    let (tx_b, _fb) = mpsc::unbounded_channel();

    lifecycle.ensure("a-old", caps(&["code"]), tx_a).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    lifecycle.ensure("a-new", caps(&["code"]), tx_b).await;

    let idle: Vec<String> = lifecycle
        .list_idle()
        .await
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(idle, vec!["a-old".to_string(), "a-new".to_string()]);

    let all = lifecycle.list_all().await;
    assert_eq!(all.len(), 2);
}
