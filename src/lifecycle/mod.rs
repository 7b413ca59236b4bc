//! Per-agent lifecycle state machines
//!
//! One supervisor entry per agent id, owning that agent's FSM. Nothing
//! here is persistent; agent state is rebuilt from `identify` on
//! reconnect. Transitions are driven only by inbound protocol messages,
//! session loss, scheduler assignment, and the acceptance-timeout
//! timer.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::bus::{EventBus, HubEvent};
use crate::config::LifecycleConfig;
use crate::models::{epoch_ms, AgentFsmState, AgentSnapshot, AssignmentEnvelope};
use crate::queue::{AgentProbe, TaskQueue};
use crate::session::protocol::ServerFrame;
use crate::{HubError, Result};

/// Outbound side of a live session; pushes are fire-and-forget.
pub type SessionHandle = mpsc::UnboundedSender<ServerFrame>;

/// Ack status reported back to the agent for a fenced completion or
/// failure frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportAck {
    Complete,
    Failed,
    /// The frame's generation lost the fence; the agent's work is
    /// obsolete and the retry should stop.
    Stale,
}

impl ReportAck {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportAck::Complete => "complete",
            ReportAck::Failed => "failed",
            ReportAck::Stale => "stale",
        }
    }
}

struct AgentEntry {
    capabilities: BTreeSet<String>,
    fsm_state: AgentFsmState,
    current_task_id: Option<String>,
    current_generation: Option<u64>,
    connected_at: Option<i64>,
    last_state_change: i64,
    session: Option<SessionHandle>,
}

impl AgentEntry {
    fn snapshot(&self, id: &str) -> AgentSnapshot {
        AgentSnapshot {
            id: id.to_string(),
            capabilities: self.capabilities.clone(),
            fsm_state: self.fsm_state,
            current_task_id: self.current_task_id.clone(),
            current_generation: self.current_generation,
            connected_at: self.connected_at,
            last_state_change: self.last_state_change,
        }
    }

    fn set_state(&mut self, state: AgentFsmState) {
        self.fsm_state = state;
        self.last_state_change = epoch_ms();
    }

    fn holds(&self, task_id: &str, generation: u64) -> bool {
        self.current_task_id.as_deref() == Some(task_id)
            && self.current_generation == Some(generation)
    }

    fn clear_task(&mut self) {
        self.current_task_id = None;
        self.current_generation = None;
    }
}

/// Registry of per-agent FSMs
#[derive(Clone)]
pub struct AgentLifecycle {
    agents: Arc<RwLock<HashMap<String, AgentEntry>>>,
    queue: TaskQueue,
    bus: EventBus,
    config: LifecycleConfig,
}

impl AgentLifecycle {
    pub fn new(queue: TaskQueue, bus: EventBus, config: LifecycleConfig) -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            queue,
            bus,
            config,
        }
    }

    /// Registers or refreshes an agent on `identify`.
    ///
    /// A reconnect that races ahead of the old session's death keeps
    /// the current assignment in place; the follow-up `state_report`
    /// reconciles it. Otherwise the agent comes up idle.
    pub async fn ensure(
        &self,
        agent_id: &str,
        capabilities: BTreeSet<String>,
        session: SessionHandle,
    ) {
        let mut agents = self.agents.write().await;
        let entry = agents.entry(agent_id.to_string()).or_insert_with(|| AgentEntry {
            capabilities: BTreeSet::new(),
            fsm_state: AgentFsmState::Offline,
            current_task_id: None,
            current_generation: None,
            connected_at: None,
            last_state_change: epoch_ms(),
            session: None,
        });

        entry.capabilities = capabilities;
        entry.session = Some(session);
        entry.connected_at = Some(epoch_ms());
        if !matches!(
            entry.fsm_state,
            AgentFsmState::Assigned | AgentFsmState::Working
        ) {
            entry.set_state(AgentFsmState::Idle);
        }
        drop(agents);

        info!(agent_id, "agent joined");
        self.bus.publish(HubEvent::AgentJoined {
            agent_id: agent_id.to_string(),
        });
    }

    /// Pushes an assignment to an idle agent and arms the acceptance
    /// timer. Fails with `AgentBusy` if the agent already holds a task;
    /// a dead session handle fails with `SessionLost` so the caller can
    /// reclaim immediately.
    pub async fn push_task(&self, agent_id: &str, envelope: AssignmentEnvelope) -> Result<()> {
        let mut agents = self.agents.write().await;
        let entry = agents
            .get_mut(agent_id)
            .ok_or_else(|| HubError::NotFound(format!("agent {agent_id}")))?;

        if entry.fsm_state != AgentFsmState::Idle {
            return Err(HubError::AgentBusy {
                agent_id: agent_id.to_string(),
            });
        }
        let session = entry.session.clone().ok_or_else(|| HubError::SessionLost {
            agent_id: agent_id.to_string(),
        })?;

        let frame = ServerFrame::task_assign(&envelope);
        if session.send(frame).is_err() {
            return Err(HubError::SessionLost {
                agent_id: agent_id.to_string(),
            });
        }

        entry.current_task_id = Some(envelope.task_id.clone());
        entry.current_generation = Some(envelope.generation);
        entry.set_state(AgentFsmState::Assigned);
        drop(agents);

        debug!(
            agent_id,
            task_id = %envelope.task_id,
            generation = envelope.generation,
            "task pushed"
        );
        self.arm_acceptance_timer(agent_id.to_string(), envelope.task_id, envelope.generation);
        Ok(())
    }

    fn arm_acceptance_timer(&self, agent_id: String, task_id: String, generation: u64) {
        let lifecycle = self.clone();
        let timeout = Duration::from_millis(self.config.acceptance_timeout_ms);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            lifecycle
                .on_acceptance_timeout(&agent_id, &task_id, generation)
                .await;
        });
    }

    /// assigned → working on a generation-matched ack; anything else is
    /// dropped.
    pub async fn on_accepted(&self, agent_id: &str, task_id: &str, generation: u64) {
        let mut agents = self.agents.write().await;
        match agents.get_mut(agent_id) {
            Some(entry)
                if entry.fsm_state == AgentFsmState::Assigned
                    && entry.holds(task_id, generation) =>
            {
                entry.set_state(AgentFsmState::Working);
                debug!(agent_id, task_id, generation, "task accepted");
            }
            _ => {
                debug!(agent_id, task_id, generation, "dropping mismatched accept");
            }
        }
    }

    /// Fenced completion path: the queue settles the task, then the
    /// agent goes idle if the frame referred to its current assignment.
    pub async fn on_completed(
        &self,
        agent_id: &str,
        task_id: &str,
        generation: u64,
        result: serde_json::Value,
    ) -> ReportAck {
        let outcome = self.queue.complete(task_id, generation, result).await;
        let ack = match &outcome {
            Ok(()) => ReportAck::Complete,
            Err(HubError::StaleGeneration { .. }) => ReportAck::Stale,
            Err(e) => {
                warn!(agent_id, task_id, error = %e, "completion not applied");
                ReportAck::Stale
            }
        };
        self.release_if_held(agent_id, task_id, generation).await;
        ack
    }

    /// Fenced failure path; retry/dead-letter disposition is the
    /// queue's call.
    pub async fn on_failed(
        &self,
        agent_id: &str,
        task_id: &str,
        generation: u64,
        reason: &str,
    ) -> ReportAck {
        let outcome = self.queue.fail(task_id, generation, reason).await;
        let ack = match &outcome {
            Ok(_) => ReportAck::Failed,
            Err(HubError::StaleGeneration { .. }) => ReportAck::Stale,
            Err(e) => {
                warn!(agent_id, task_id, error = %e, "failure not applied");
                ReportAck::Stale
            }
        };
        self.release_if_held(agent_id, task_id, generation).await;
        ack
    }

    /// assigned → idle on an explicit reject; the task goes back to the
    /// queue with a bumped generation.
    pub async fn on_rejected(&self, agent_id: &str, task_id: &str, generation: u64, reason: &str) {
        let released = self.release_if_held(agent_id, task_id, generation).await;
        if released {
            info!(agent_id, task_id, reason, "task rejected");
            if let Err(e) = self
                .queue
                .reclaim(task_id, &format!("rejected by {agent_id}: {reason}"))
                .await
            {
                warn!(task_id, error = %e, "reclaim after reject failed");
            }
        }
    }

    /// Timer path: if the assignment is still unacked, reclaim it and
    /// idle the agent. A state or generation mismatch means the timer
    /// raced a real transition and does nothing.
    pub async fn on_acceptance_timeout(&self, agent_id: &str, task_id: &str, generation: u64) {
        let expired = {
            let agents = self.agents.read().await;
            agents
                .get(agent_id)
                .map(|entry| {
                    entry.fsm_state == AgentFsmState::Assigned && entry.holds(task_id, generation)
                })
                .unwrap_or(false)
        };
        if !expired {
            return;
        }

        let released = self.release_if_held(agent_id, task_id, generation).await;
        if released {
            warn!(agent_id, task_id, generation, "acceptance timeout");
            if let Err(e) = self.queue.reclaim(task_id, "acceptance_timeout").await {
                warn!(task_id, error = %e, "reclaim after acceptance timeout failed");
            }
        }
    }

    /// Death-monitor entry point for a specific session: a stale
    /// session's death must not take down an agent that has already
    /// reconnected through a newer one.
    pub async fn on_session_loss_if_current(&self, agent_id: &str, handle: &SessionHandle) {
        let is_current = {
            let agents = self.agents.read().await;
            agents
                .get(agent_id)
                .and_then(|entry| entry.session.as_ref())
                .map(|session| session.same_channel(handle))
                .unwrap_or(false)
        };
        if is_current {
            self.on_session_loss(agent_id).await;
        }
    }

    /// Death-monitor path: the agent goes offline and any held task is
    /// reclaimed.
    pub async fn on_session_loss(&self, agent_id: &str) {
        let held = {
            let mut agents = self.agents.write().await;
            let Some(entry) = agents.get_mut(agent_id) else {
                return;
            };
            if entry.fsm_state == AgentFsmState::Offline {
                return;
            }
            let held = entry.current_task_id.take();
            entry.current_generation = None;
            entry.session = None;
            entry.connected_at = None;
            entry.set_state(AgentFsmState::Offline);
            held
        };

        info!(agent_id, "agent left");
        if let Some(task_id) = held {
            if let Err(e) = self.queue.reclaim(&task_id, "session_loss").await {
                warn!(task_id, error = %e, "reclaim after session loss failed");
            }
        }
        self.bus.publish(HubEvent::AgentLeft {
            agent_id: agent_id.to_string(),
        });
    }

    /// Idle agents eligible for matching, least recently active first.
    pub async fn list_idle(&self) -> Vec<AgentSnapshot> {
        let agents = self.agents.read().await;
        let mut idle: Vec<AgentSnapshot> = agents
            .iter()
            .filter(|(_, entry)| entry.fsm_state == AgentFsmState::Idle && entry.session.is_some())
            .map(|(id, entry)| entry.snapshot(id))
            .collect();
        idle.sort_by_key(|s| s.last_state_change);
        idle
    }

    pub async fn list_all(&self) -> Vec<AgentSnapshot> {
        let agents = self.agents.read().await;
        let mut all: Vec<AgentSnapshot> = agents
            .iter()
            .map(|(id, entry)| entry.snapshot(id))
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub async fn snapshot_of(&self, agent_id: &str) -> Option<AgentSnapshot> {
        let agents = self.agents.read().await;
        agents.get(agent_id).map(|entry| entry.snapshot(agent_id))
    }

    /// Clears the agent's current assignment if it matches the frame
    /// and moves the agent to idle. Returns whether anything changed.
    async fn release_if_held(&self, agent_id: &str, task_id: &str, generation: u64) -> bool {
        let mut agents = self.agents.write().await;
        let Some(entry) = agents.get_mut(agent_id) else {
            return false;
        };
        if !entry.holds(task_id, generation) {
            return false;
        }
        entry.clear_task();
        entry.set_state(AgentFsmState::Idle);
        drop(agents);

        self.bus.publish(HubEvent::AgentIdle {
            agent_id: agent_id.to_string(),
        });
        true
    }
}

/// Lets the queue's overdue sweep ask whether an assignee is still
/// engaged without a direct dependency on this module's internals.
#[async_trait]
impl AgentProbe for AgentLifecycle {
    async fn snapshot(&self, agent_id: &str) -> Option<AgentSnapshot> {
        self.snapshot_of(agent_id).await
    }
}

#[cfg(test)]
mod tests;
