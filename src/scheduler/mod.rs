//! Event-driven task/agent matcher
//!
//! The scheduler holds no state of its own. Each relevant bus event
//! triggers one matching pass over the queued snapshot and the idle
//! pool; a periodic sweep cross-checks agents stuck in `assigned` in
//! case a lifecycle timer was lost. Tasks that find no eligible agent
//! simply remain queued; there is no reservation.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bus::{EventBus, HubEvent, Topic};
use crate::lifecycle::AgentLifecycle;
use crate::models::epoch_ms;
use crate::queue::TaskQueue;
use crate::ratelimit::RateLimiter;
use crate::HubError;

#[derive(Clone)]
pub struct Scheduler {
    queue: TaskQueue,
    lifecycle: AgentLifecycle,
    limiter: RateLimiter,
    bus: EventBus,
    acceptance_timeout_ms: u64,
    stuck_sweep_interval_ms: u64,
}

impl Scheduler {
    pub fn new(
        queue: TaskQueue,
        lifecycle: AgentLifecycle,
        limiter: RateLimiter,
        bus: EventBus,
        acceptance_timeout_ms: u64,
        stuck_sweep_interval_ms: u64,
    ) -> Self {
        Self {
            queue,
            lifecycle,
            limiter,
            bus,
            acceptance_timeout_ms,
            stuck_sweep_interval_ms,
        }
    }

    /// One greedy matching pass. Returns the number of assignments
    /// made.
    ///
    /// Tasks are visited in strict priority order with FIFO inside each
    /// lane; candidate agents in least-recently-active order. A match
    /// requires the task's needed capabilities to be a subset of the
    /// agent's advertised set.
    pub async fn matching_pass(&self) -> usize {
        let tasks = self.queue.queued_snapshot().await;
        if tasks.is_empty() {
            return 0;
        }

        let mut idle: Vec<_> = self
            .lifecycle
            .list_idle()
            .await
            .into_iter()
            .filter(|agent| !self.limiter.is_rate_limited(&agent.id))
            .collect();
        if idle.is_empty() {
            return 0;
        }

        let mut assigned = 0;
        for task in tasks {
            let Some(pos) = idle
                .iter()
                .position(|agent| agent.can_handle(&task.needed_capabilities))
            else {
                continue;
            };
            let agent = idle.remove(pos);

            let envelope = match self.queue.assign(&task.id, &agent.id).await {
                Ok(envelope) => envelope,
                Err(HubError::WrongState { .. }) | Err(HubError::NotFound(_)) => {
                    // Another pass got there first; the agent is still
                    // free for the next task.
                    idle.insert(pos, agent);
                    continue;
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "assign failed");
                    idle.insert(pos, agent);
                    continue;
                }
            };

            match self.lifecycle.push_task(&agent.id, envelope).await {
                Ok(()) => {
                    debug!(task_id = %task.id, agent_id = %agent.id, "matched");
                    assigned += 1;
                }
                Err(e) => {
                    // The agent went away between the queries; put the
                    // task straight back.
                    info!(task_id = %task.id, agent_id = %agent.id, error = %e, "push failed, reclaiming");
                    if let Err(e) = self.queue.reclaim(&task.id, "push_failed").await {
                        warn!(task_id = %task.id, error = %e, "reclaim after failed push failed");
                    }
                }
            }

            if idle.is_empty() {
                break;
            }
        }
        assigned
    }

    /// Defensive cross-check: an agent sitting in `assigned` for more
    /// than twice the acceptance timeout has a lost timer; fire the
    /// timeout path by hand.
    pub async fn stuck_agent_sweep(&self) {
        let now = epoch_ms();
        let deadline_ms = (self.acceptance_timeout_ms * 2) as i64;
        for agent in self.lifecycle.list_all().await {
            if agent.fsm_state != crate::models::AgentFsmState::Assigned {
                continue;
            }
            if now - agent.last_state_change <= deadline_ms {
                continue;
            }
            if let (Some(task_id), Some(generation)) =
                (agent.current_task_id.clone(), agent.current_generation)
            {
                warn!(
                    agent_id = %agent.id,
                    task_id = %task_id,
                    "agent stuck in assigned; forcing acceptance timeout"
                );
                self.lifecycle
                    .on_acceptance_timeout(&agent.id, &task_id, generation)
                    .await;
            }
        }
    }

    fn triggers_pass(event: &HubEvent) -> bool {
        matches!(
            event,
            HubEvent::TaskSubmitted { .. }
                | HubEvent::TaskRetried { .. }
                | HubEvent::TaskReclaimed { .. }
                | HubEvent::AgentIdle { .. }
                | HubEvent::AgentJoined { .. }
                | HubEvent::RateLimitCleared { .. }
        )
    }

    /// Runs the scheduler: one matching pass per triggering event plus
    /// the periodic stuck-agent sweep.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        let mut events = self
            .bus
            .subscribe_many(&[Topic::Task, Topic::Agent, Topic::RateLimit]);
        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(Duration::from_millis(
                self.stuck_sweep_interval_ms.max(1),
            ));
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    event = events.recv() => {
                        match event {
                            Some(event) if Self::triggers_pass(&event) => {
                                self.matching_pass().await;
                            }
                            Some(_) => {}
                            None => break,
                        }
                    }
                    _ = sweep.tick() => {
                        self.stuck_agent_sweep().await;
                        self.matching_pass().await;
                    }
                }
            }
        })
    }
}
