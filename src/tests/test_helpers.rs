//! Shared harness for system-wide tests

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::auth::StaticTokenAuth;
use crate::bus::{EventBus, HubEvent, Topic};
use crate::config::Config;
use crate::lifecycle::{AgentLifecycle, SessionHandle};
use crate::models::{Priority, SubmitTaskParams};
use crate::queue::TaskQueue;
use crate::ratelimit::RateLimiter;
use crate::scheduler::Scheduler;
use crate::session::protocol::{ClientFrame, ServerFrame};
use crate::session::SessionContext;
use crate::storage::MemoryStore;
use crate::validation::IngressValidator;

pub const AGENT_TOKEN: &str = "test-agent-token-0123456789abcdef01234567";

/// Fully wired hub over the in-memory store with fast test timers.
pub struct TestHub {
    pub queue: TaskQueue,
    pub lifecycle: AgentLifecycle,
    pub scheduler: Scheduler,
    pub limiter: RateLimiter,
    pub bus: EventBus,
    pub ctx: SessionContext,
}

impl TestHub {
    pub fn new() -> Self {
        let config = Config::for_tests();
        let bus = EventBus::new();
        let queue = TaskQueue::open(
            Arc::new(MemoryStore::new()),
            bus.clone(),
            config.queue.clone(),
        )
        .unwrap();
        let lifecycle = AgentLifecycle::new(queue.clone(), bus.clone(), config.lifecycle.clone());
        let limiter = RateLimiter::new(config.ratelimit.clone(), bus.clone());
        let scheduler = Scheduler::new(
            queue.clone(),
            lifecycle.clone(),
            limiter.clone(),
            bus.clone(),
            config.lifecycle.acceptance_timeout_ms,
            30_000,
        );
        let ctx = SessionContext {
            lifecycle: lifecycle.clone(),
            queue: queue.clone(),
            limiter: limiter.clone(),
            auth: Arc::new(StaticTokenAuth::new(AGENT_TOKEN.to_string())),
            validator: IngressValidator::new().unwrap(),
            config: config.session.clone(),
        };
        Self {
            queue,
            lifecycle,
            scheduler,
            limiter,
            bus,
            ctx,
        }
    }

    /// Registers an agent as an identified session would, returning the
    /// outbound frame stream.
    pub async fn connect_agent(
        &self,
        agent_id: &str,
        capabilities: &[&str],
    ) -> (SessionHandle, UnboundedReceiver<ServerFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let caps: BTreeSet<String> = capabilities.iter().map(|s| s.to_string()).collect();
        self.lifecycle.ensure(agent_id, caps, tx.clone()).await;
        (tx, rx)
    }

    /// Delivers one inbound frame on an agent's session, as the read
    /// loop would.
    pub async fn inbound(&self, agent_id: &str, tx: &SessionHandle, json: &str) -> bool {
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        crate::session::handle_frame(&self.ctx, agent_id, frame, tx).await
    }

    pub fn subscribe(&self, topic: Topic) -> UnboundedReceiver<HubEvent> {
        self.bus.subscribe(topic)
    }

    pub async fn submit(&self, description: &str, priority: Priority, caps: &[&str]) -> String {
        self.queue
            .submit(SubmitTaskParams {
                description: description.to_string(),
                priority: Some(priority),
                needed_capabilities: caps.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            })
            .await
            .unwrap()
    }
}

/// Drains every immediately available frame from a session stream.
pub fn drain_frames(rx: &mut UnboundedReceiver<ServerFrame>) -> Vec<ServerFrame> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    frames
}

/// Drains every immediately available event from a bus subscription.
pub fn drain_events(rx: &mut UnboundedReceiver<HubEvent>) -> Vec<HubEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
