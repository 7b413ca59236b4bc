//! End-to-end scenarios: submit → match → push → execute → settle

use super::test_helpers::{drain_frames, TestHub};
use crate::bus::{HubEvent, Topic};
use crate::models::{AgentFsmState, Priority, TaskStatus};
use crate::session::protocol::ServerFrame;

#[tokio::test]
async fn test_happy_path_submit_to_completion() {
    let hub = TestHub::new();
    let (tx, mut rx) = hub.connect_agent("a-1", &["code", "review"]).await;

    let task_id = hub.submit("ship the feature", Priority::Normal, &["code"]).await;
    assert_eq!(hub.scheduler.matching_pass().await, 1);

    // The hub pushes task_assign with generation 1.
    let frame = rx.recv().await.unwrap();
    let ServerFrame::TaskAssign {
        task_id: pushed,
        generation,
        ..
    } = frame
    else {
        panic!("expected task_assign, got {frame:?}");
    };
    assert_eq!(pushed, task_id);
    assert_eq!(generation, 1);

    // The agent accepts, then completes with the echoed generation.
    hub.inbound(
        "a-1",
        &tx,
        &format!(r#"{{"type":"task_accepted","task_id":"{task_id}","generation":1}}"#),
    )
    .await;
    assert_eq!(
        hub.lifecycle.snapshot_of("a-1").await.unwrap().fsm_state,
        AgentFsmState::Working
    );

    hub.inbound(
        "a-1",
        &tx,
        &format!(
            r#"{{"type":"task_complete","task_id":"{task_id}","generation":1,"result":{{"status":"success"}}}}"#
        ),
    )
    .await;

    match rx.recv().await.unwrap() {
        ServerFrame::TaskAck {
            task_id: acked,
            status,
            ..
        } => {
            assert_eq!(acked, task_id);
            assert_eq!(status, "complete");
        }
        other => panic!("expected task_ack, got {other:?}"),
    }

    let task = hub.queue.get(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result.unwrap()["status"], "success");
    assert_eq!(
        hub.lifecycle.snapshot_of("a-1").await.unwrap().fsm_state,
        AgentFsmState::Idle
    );
}

#[tokio::test]
async fn test_stale_completion_resend_is_acked_stale() {
    let hub = TestHub::new();
    let (tx, mut rx) = hub.connect_agent("a-1", &["code"]).await;
    let task_id = hub.submit("once only", Priority::Normal, &["code"]).await;
    hub.scheduler.matching_pass().await;
    rx.recv().await.unwrap();

    let complete = format!(
        r#"{{"type":"task_complete","task_id":"{task_id}","generation":1,"result":{{"status":"success"}}}}"#
    );
    hub.inbound("a-1", &tx, &complete).await;
    rx.recv().await.unwrap();
    let snapshot = hub.queue.get(&task_id).await.unwrap();

    // The buggy agent resends the same completion.
    hub.inbound("a-1", &tx, &complete).await;
    match rx.recv().await.unwrap() {
        ServerFrame::TaskAck { status, .. } => assert_eq!(status, "stale"),
        other => panic!("expected task_ack, got {other:?}"),
    }

    let after = hub.queue.get(&task_id).await.unwrap();
    assert_eq!(after.updated_at, snapshot.updated_at);
    assert_eq!(after.generation, snapshot.generation);
}

#[tokio::test]
async fn test_reclaim_after_disconnect() {
    let hub = TestHub::new();
    let mut events = hub.subscribe(Topic::Task);
    let (tx, mut rx) = hub.connect_agent("a-1", &["code"]).await;
    let task_id = hub.submit("cut short", Priority::Normal, &["code"]).await;
    hub.scheduler.matching_pass().await;
    rx.recv().await.unwrap();

    hub.inbound(
        "a-1",
        &tx,
        &format!(r#"{{"type":"task_accepted","task_id":"{task_id}","generation":1}}"#),
    )
    .await;

    // Connection drops.
    hub.lifecycle.on_session_loss("a-1").await;

    let snapshot = hub.lifecycle.snapshot_of("a-1").await.unwrap();
    assert_eq!(snapshot.fsm_state, AgentFsmState::Offline);

    let task = hub.queue.get(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.generation, 2);

    let mut saw_reclaim = false;
    while let Ok(event) = events.try_recv() {
        if let HubEvent::TaskReclaimed {
            task_id: reclaimed,
            generation,
            ..
        } = event
        {
            assert_eq!(reclaimed, task_id);
            assert_eq!(generation, 2);
            saw_reclaim = true;
        }
    }
    assert!(saw_reclaim);
}

#[tokio::test]
async fn test_retry_then_dead_letter() {
    let hub = TestHub::new();
    let mut events = hub.subscribe(Topic::Task);
    let (tx, mut rx) = hub.connect_agent("a-1", &["code"]).await;

    let task_id = hub
        .queue
        .submit(crate::models::SubmitTaskParams {
            description: "fragile".to_string(),
            needed_capabilities: ["code".to_string()].into_iter().collect(),
            max_retries: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();

    // First attempt fails: requeued with retry_count 1, generation 2.
    hub.scheduler.matching_pass().await;
    rx.recv().await.unwrap();
    hub.inbound(
        "a-1",
        &tx,
        &format!(r#"{{"type":"task_failed","task_id":"{task_id}","generation":1,"reason":"oom"}}"#),
    )
    .await;
    let task = hub.queue.get(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.generation, 2);

    // Second attempt fails: dead-lettered.
    hub.scheduler.matching_pass().await;
    rx.recv().await.unwrap();
    hub.inbound(
        "a-1",
        &tx,
        &format!(
            r#"{{"type":"task_failed","task_id":"{task_id}","generation":3,"reason":"oom again"}}"#
        ),
    )
    .await;
    let task = hub.queue.get(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Dead);

    let events: Vec<HubEvent> = super::test_helpers::drain_events(&mut events);
    assert!(events
        .iter()
        .any(|e| matches!(e, HubEvent::TaskRetried { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, HubEvent::TaskDeadLettered { .. })));
}

#[tokio::test]
async fn test_priority_preempts_selection_order() {
    let hub = TestHub::new();
    let (_tx, mut rx) = hub.connect_agent("a-1", &["code"]).await;

    let low = hub.submit("background chore", Priority::Normal, &["code"]).await;
    let urgent = hub.submit("prod is down", Priority::Urgent, &["code"]).await;

    hub.scheduler.matching_pass().await;

    // The urgent task wins despite being submitted later.
    match rx.recv().await.unwrap() {
        ServerFrame::TaskAssign { task_id, .. } => assert_eq!(task_id, urgent),
        other => panic!("expected task_assign, got {other:?}"),
    }
    assert_eq!(hub.queue.get(&low).await.unwrap().status, TaskStatus::Queued);
}

#[tokio::test(start_paused = true)]
async fn test_ping_flood_denied_and_excluded_from_matching() {
    let hub = TestHub::new();
    let (tx, mut rx) = hub.connect_agent("a-1", &["code"]).await;

    // 61 pings inside one second against the normal tier (capacity 60).
    for nonce in 0..=60u32 {
        hub.inbound("a-1", &tx, &format!(r#"{{"type":"ping","nonce":{nonce}}}"#))
            .await;
    }

    let frames = drain_frames(&mut rx);
    let denied = frames.iter().find_map(|f| match f {
        ServerFrame::RateLimited {
            tier,
            retry_after_ms,
            ..
        } => Some((tier.clone(), *retry_after_ms)),
        _ => None,
    });
    let (tier, retry_after_ms) = denied.expect("expected a rate_limited frame");
    assert_eq!(tier, "normal");
    assert!(retry_after_ms > 0);
    assert!(hub.limiter.is_rate_limited("a-1"));

    // While backing off, the agent is out of the idle pool.
    hub.submit("blocked by backoff", Priority::Normal, &["code"]).await;
    assert_eq!(hub.scheduler.matching_pass().await, 0);
}

#[tokio::test]
async fn test_capability_mismatch_starves_task_until_capable_agent_joins() {
    let hub = TestHub::new();
    let (_tx_a, _rx_a) = hub.connect_agent("a-docs", &["docs"]).await;

    let task_id = hub.submit("needs code", Priority::High, &["code"]).await;
    assert_eq!(hub.scheduler.matching_pass().await, 0);
    assert_eq!(
        hub.queue.get(&task_id).await.unwrap().status,
        TaskStatus::Queued
    );

    let (_tx_b, mut rx_b) = hub.connect_agent("a-coder", &["code", "test"]).await;
    assert_eq!(hub.scheduler.matching_pass().await, 1);
    assert!(matches!(
        rx_b.recv().await.unwrap(),
        ServerFrame::TaskAssign { .. }
    ));
}

#[tokio::test]
async fn test_rejection_flows_back_to_another_agent() {
    let hub = TestHub::new();
    let (tx_a, mut rx_a) = hub.connect_agent("a-1", &["code"]).await;

    let task_id = hub.submit("picky work", Priority::Normal, &["code"]).await;
    hub.scheduler.matching_pass().await;
    rx_a.recv().await.unwrap();

    hub.inbound(
        "a-1",
        &tx_a,
        &format!(
            r#"{{"type":"task_rejected","task_id":"{task_id}","generation":1,"reason":"no docker"}}"#
        ),
    )
    .await;

    // The rejecting agent drops off; a second, capable agent picks the
    // task up on the next pass.
    hub.lifecycle.on_session_loss("a-1").await;
    let (_tx_b, mut rx_b) = hub.connect_agent("a-2", &["code"]).await;
    assert_eq!(hub.scheduler.matching_pass().await, 1);
    match rx_b.recv().await.unwrap() {
        ServerFrame::TaskAssign {
            task_id: pushed,
            generation,
            ..
        } => {
            assert_eq!(pushed, task_id);
            assert_eq!(generation, 3);
        }
        other => panic!("expected task_assign, got {other:?}"),
    }
}
