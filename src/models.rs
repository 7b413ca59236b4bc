use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use uuid::Uuid;

use crate::constants::TASK_HISTORY_CAP;

/// Returns the current wall-clock time as epoch milliseconds.
///
/// All persisted timestamps and wire-protocol timestamps use this unit.
pub fn epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Represents a unit of work flowing through the hub
///
/// Tasks are submitted by operators or the autonomous work loop, matched
/// to idle agents by capability, and reconciled through a fenced
/// completion protocol. The record is the single source of truth for the
/// task's status and is owned exclusively by the task queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub created_at: i64,
    pub updated_at: i64,
    /// Hard deadline; when unset the sweep falls back to
    /// `assigned_at + assignment_ttl`.
    pub complete_by: Option<i64>,
    /// Fencing token. Bumped on every assign and reclaim, echoed by the
    /// agent in completion/failure frames. Never decreases.
    pub generation: u64,
    pub assigned_to: Option<String>,
    /// Set when the task enters `assigned`, cleared on reclaim.
    pub assigned_at: Option<i64>,
    pub needed_capabilities: BTreeSet<String>,
    /// Opaque to the core; passed through to the agent verbatim.
    pub description: String,
    /// Opaque submitter context (declared priority, criteria, ...).
    pub metadata: HashMap<String, serde_json::Value>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Capped status transition trail, oldest entries dropped first.
    pub history: Vec<TaskTransition>,
    pub last_error: Option<String>,
    /// Result payload echoed by the agent on completion.
    pub result: Option<serde_json::Value>,
    /// Advisory progress report, best effort, never synced.
    pub progress_percent: Option<u8>,
    /// Position counter within the priority lane. Assigned on every
    /// enqueue so a requeued task lands at the tail of its lane.
    pub enqueue_seq: u64,
}

/// Current position of a task in its lifecycle
///
/// `Completed` and `Dead` are terminal; no transition leaves them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Assigned,
    Completed,
    Failed,
    Dead,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Dead)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Dead => "dead",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task priority lanes, lower value wins
///
/// Serialized as the integer 0..=3 both on the wire and in metadata.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    Urgent,
    High,
    Normal,
    Low,
}

impl Priority {
    pub fn lane(&self) -> u8 {
        *self as u8
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Priority::Urgent),
            1 => Ok(Priority::High),
            2 => Ok(Priority::Normal),
            3 => Ok(Priority::Low),
            other => Err(format!("priority out of range 0..=3: {other}")),
        }
    }
}

impl From<Priority> for u8 {
    fn from(value: Priority) -> Self {
        value as u8
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// One entry in a task's status transition trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTransition {
    pub ts: i64,
    pub old_status: TaskStatus,
    pub new_status: TaskStatus,
    pub reason: String,
}

impl Task {
    /// Creates a queued task from submit parameters.
    ///
    /// The id carries 128 bits of entropy so it stays unique across
    /// restarts without coordination.
    pub fn new(params: SubmitTaskParams, default_max_retries: u32, enqueue_seq: u64) -> Self {
        let now = epoch_ms();
        Self {
            id: format!("t-{}", Uuid::new_v4().simple()),
            status: TaskStatus::Queued,
            priority: params.priority.unwrap_or_default(),
            created_at: now,
            updated_at: now,
            complete_by: params.complete_by,
            generation: 0,
            assigned_to: None,
            assigned_at: None,
            needed_capabilities: params.needed_capabilities,
            description: params.description,
            metadata: params.metadata,
            retry_count: 0,
            max_retries: params.max_retries.unwrap_or(default_max_retries),
            history: Vec::new(),
            last_error: None,
            result: None,
            progress_percent: None,
            enqueue_seq,
        }
    }

    /// Records a status transition, dropping the oldest entry once the
    /// trail reaches its cap.
    pub fn record_transition(&mut self, new_status: TaskStatus, reason: impl Into<String>) {
        let ts = epoch_ms();
        self.history.push(TaskTransition {
            ts,
            old_status: self.status,
            new_status,
            reason: reason.into(),
        });
        if self.history.len() > TASK_HISTORY_CAP {
            let excess = self.history.len() - TASK_HISTORY_CAP;
            self.history.drain(..excess);
        }
        self.status = new_status;
        self.updated_at = ts;
    }
}

/// Parameters accepted by `TaskQueue::submit`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitTaskParams {
    pub description: String,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub needed_capabilities: BTreeSet<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub complete_by: Option<i64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// Outbound payload of a `task_assign` frame
///
/// Everything the agent needs to start work, plus the generation it must
/// echo back in completion and failure frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentEnvelope {
    pub task_id: String,
    pub generation: u64,
    pub description: String,
    pub needed_capabilities: BTreeSet<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub assigned_at: i64,
}

/// Filter for the task listing API
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub assigned_to: Option<String>,
    pub limit: Option<usize>,
}

/// Aggregate queue counters for the stats API
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: usize,
    pub assigned: usize,
    pub completed: usize,
    pub dead: usize,
    pub dead_lettered_total: usize,
    pub by_priority: HashMap<u8, usize>,
}

/// Per-agent lifecycle states
///
/// Driven only by inbound protocol messages, session loss, scheduler
/// assignment, and the acceptance-timeout timer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentFsmState {
    Idle,
    Assigned,
    Working,
    Blocked,
    Offline,
}

impl AgentFsmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentFsmState::Idle => "idle",
            AgentFsmState::Assigned => "assigned",
            AgentFsmState::Working => "working",
            AgentFsmState::Blocked => "blocked",
            AgentFsmState::Offline => "offline",
        }
    }
}

impl std::fmt::Display for AgentFsmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of one agent's lifecycle state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: String,
    pub capabilities: BTreeSet<String>,
    pub fsm_state: AgentFsmState,
    pub current_task_id: Option<String>,
    pub current_generation: Option<u64>,
    pub connected_at: Option<i64>,
    pub last_state_change: i64,
}

impl AgentSnapshot {
    /// Capability subset test used by the matcher: every capability the
    /// task needs must be advertised by the agent.
    pub fn can_handle(&self, needed: &BTreeSet<String>) -> bool {
        needed.iter().all(|cap| self.capabilities.contains(cap))
    }
}

/// Hub FSM work modes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HubState {
    Resting,
    Executing,
    Improving,
    Contemplating,
    Healing,
}

impl HubState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HubState::Resting => "resting",
            HubState::Executing => "executing",
            HubState::Improving => "improving",
            HubState::Contemplating => "contemplating",
            HubState::Healing => "healing",
        }
    }
}

impl std::fmt::Display for HubState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HubState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resting" => Ok(HubState::Resting),
            "executing" => Ok(HubState::Executing),
            "improving" => Ok(HubState::Improving),
            "contemplating" => Ok(HubState::Contemplating),
            "healing" => Ok(HubState::Healing),
            other => Err(format!("unknown hub state: {other}")),
        }
    }
}
