//! Durable priority task queue
//!
//! Single source of truth for task existence and status. All mutations
//! are serialized through one internal lock; the durability rule is
//! sync-before-publish: an event observed on the bus always reflects a
//! state that survives a crash. The in-memory priority index is rebuilt
//! from the active table on startup, force-reclaiming any record left
//! in `assigned`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, HubEvent};
use crate::config::QueueConfig;
use crate::models::{
    epoch_ms, AgentFsmState, AgentSnapshot, AssignmentEnvelope, QueueStats, SubmitTaskParams, Task,
    TaskFilter, TaskStatus,
};
use crate::storage::{DurableStore, TASKS_ACTIVE, TASKS_DEAD};
use crate::{HubError, Result};

/// Read access into the agent lifecycle, consumed by the overdue sweep.
///
/// The queue holds this as an opaque handle so the queue/lifecycle call
/// graph stays acyclic at the type level.
#[async_trait]
pub trait AgentProbe: Send + Sync {
    async fn snapshot(&self, agent_id: &str) -> Option<AgentSnapshot>;
}

/// Disposition of a `fail` call after fencing passed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    /// Retry budget remained; the task is queued again.
    Requeued { retry_count: u32, generation: u64 },
    /// Retries exhausted; the task moved to the dead-letter table.
    DeadLettered,
}

struct QueueState {
    /// Active records: queued, assigned, and completed tasks.
    tasks: HashMap<String, Task>,
    /// Queued tasks ordered by (lane, enqueue_seq). Requeues take a
    /// fresh seq, which lands them at the tail of their lane.
    queued: BTreeSet<(u8, u64, String)>,
    next_seq: u64,
    /// Tasks granted one extra sweep interval because their agent was
    /// still working and online.
    sweep_grace: HashMap<String, u32>,
}

impl QueueState {
    fn index_key(task: &Task) -> (u8, u64, String) {
        (task.priority.lane(), task.enqueue_seq, task.id.clone())
    }
}

/// The owning actor for all task records
#[derive(Clone)]
pub struct TaskQueue {
    state: Arc<Mutex<QueueState>>,
    store: Arc<dyn DurableStore>,
    bus: EventBus,
    config: QueueConfig,
}

impl TaskQueue {
    /// Opens the queue over a durable store, rebuilding the in-memory
    /// index from `tasks_active`.
    ///
    /// Recovery rules: a record present in both tables is a dead-letter
    /// move that crashed mid-flight and is rolled forward (dead wins);
    /// a record still `assigned` lost its agent with the process, so it
    /// is reclaimed with a bumped generation before anything observes it.
    pub fn open(store: Arc<dyn DurableStore>, bus: EventBus, config: QueueConfig) -> Result<Self> {
        let mut dead_ids: BTreeSet<String> = BTreeSet::new();
        store.fold(TASKS_DEAD, &mut |key, _| {
            dead_ids.insert(key.to_string());
        })?;

        let mut tasks: HashMap<String, Task> = HashMap::new();
        let mut decode_failures = 0usize;
        store.fold(TASKS_ACTIVE, &mut |key, value| {
            match serde_json::from_slice::<Task>(value) {
                Ok(task) => {
                    tasks.insert(key.to_string(), task);
                }
                Err(e) => {
                    warn!(task_id = key, error = %e, "dropping undecodable task record");
                    decode_failures += 1;
                }
            }
        })?;

        // Roll the dead-letter move forward.
        for id in &dead_ids {
            if tasks.remove(id).is_some() {
                store.delete(TASKS_ACTIVE, id)?;
            }
        }
        if !dead_ids.is_empty() {
            store.sync(TASKS_ACTIVE)?;
        }

        let mut next_seq = 0u64;
        let mut reclaimed = 0usize;
        for task in tasks.values_mut() {
            next_seq = next_seq.max(task.enqueue_seq + 1);
            if task.status == TaskStatus::Assigned {
                task.generation += 1;
                task.assigned_to = None;
                task.assigned_at = None;
                task.record_transition(TaskStatus::Queued, "startup_reclaim");
                task.enqueue_seq = next_seq;
                next_seq += 1;
                store.put(TASKS_ACTIVE, &task.id, &serde_json::to_vec(task)?)?;
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            store.sync(TASKS_ACTIVE)?;
        }

        let queued = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued)
            .map(QueueState::index_key)
            .collect();

        info!(
            active = tasks.len(),
            reclaimed, decode_failures, "task queue opened"
        );

        Ok(Self {
            state: Arc::new(Mutex::new(QueueState {
                tasks,
                queued,
                next_seq,
                sweep_grace: HashMap::new(),
            })),
            store,
            bus,
            config,
        })
    }

    /// Persist a record and establish durability before anything else
    /// observes the mutation.
    fn persist(&self, task: &Task) -> Result<()> {
        self.store
            .put(TASKS_ACTIVE, &task.id, &serde_json::to_vec(task)?)?;
        self.store.sync(TASKS_ACTIVE)?;
        Ok(())
    }

    /// Validates and enqueues a new task.
    pub async fn submit(&self, params: SubmitTaskParams) -> Result<String> {
        if params.description.trim().is_empty() {
            return Err(HubError::InvalidArgs("description is required".to_string()));
        }

        let mut state = self.state.lock().await;
        if state.queued.len() >= self.config.max_queue_size {
            return Err(HubError::QueueFull);
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let task = Task::new(params, self.config.max_retries_default, seq);
        let task_id = task.id.clone();

        self.persist(&task)?;
        state.queued.insert(QueueState::index_key(&task));
        let priority = task.priority.lane();
        state.tasks.insert(task_id.clone(), task);
        drop(state);

        info!(%task_id, priority, "task submitted");
        self.bus.publish(HubEvent::TaskSubmitted {
            task_id: task_id.clone(),
            priority,
        });
        Ok(task_id)
    }

    /// Atomically flips a queued task to assigned and bumps its
    /// generation. The returned envelope is what goes out on the wire.
    pub async fn assign(&self, task_id: &str, agent_id: &str) -> Result<AssignmentEnvelope> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get(task_id)
            .ok_or_else(|| HubError::NotFound(format!("task {task_id}")))?;
        if task.status != TaskStatus::Queued {
            return Err(HubError::WrongState {
                entity: format!("task {task_id}"),
                expected: "queued".to_string(),
                found: task.status.to_string(),
            });
        }

        let mut updated = task.clone();
        let index_key = QueueState::index_key(&updated);
        updated.generation += 1;
        updated.assigned_to = Some(agent_id.to_string());
        updated.assigned_at = Some(epoch_ms());
        updated.record_transition(TaskStatus::Assigned, format!("assigned to {agent_id}"));

        self.persist(&updated)?;
        state.queued.remove(&index_key);
        let envelope = AssignmentEnvelope {
            task_id: updated.id.clone(),
            generation: updated.generation,
            description: updated.description.clone(),
            needed_capabilities: updated.needed_capabilities.clone(),
            metadata: updated.metadata.clone(),
            assigned_at: updated.assigned_at.unwrap_or_else(epoch_ms),
        };
        let generation = updated.generation;
        state.tasks.insert(task_id.to_string(), updated);
        drop(state);

        debug!(task_id, agent_id, generation, "task assigned");
        self.bus.publish(HubEvent::TaskAssigned {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            generation,
        });
        Ok(envelope)
    }

    /// Fenced check shared by complete/fail: the presented generation
    /// must match and the task must still be assigned.
    fn fence<'a>(task: Option<&'a Task>, task_id: &str, generation: u64) -> Result<&'a Task> {
        let task = task.ok_or_else(|| HubError::NotFound(format!("task {task_id}")))?;
        if generation != task.generation {
            return Err(HubError::StaleGeneration {
                task_id: task_id.to_string(),
                presented: generation,
                current: task.generation,
            });
        }
        match task.status {
            TaskStatus::Assigned => Ok(task),
            // A generation-matched retry of an already-settled op is the
            // at-least-once path; report it as stale so the sender stops.
            TaskStatus::Completed | TaskStatus::Dead => Err(HubError::StaleGeneration {
                task_id: task_id.to_string(),
                presented: generation,
                current: task.generation,
            }),
            other => Err(HubError::WrongState {
                entity: format!("task {task_id}"),
                expected: "assigned".to_string(),
                found: other.to_string(),
            }),
        }
    }

    /// Fenced completion. Stale generations are reported and otherwise
    /// a no-op.
    pub async fn complete(
        &self,
        task_id: &str,
        generation: u64,
        result: serde_json::Value,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let task = Self::fence(state.tasks.get(task_id), task_id, generation)?;

        let mut updated = task.clone();
        updated.assigned_to = None;
        updated.assigned_at = None;
        updated.result = Some(result);
        updated.record_transition(TaskStatus::Completed, "completed");

        self.persist(&updated)?;
        state.sweep_grace.remove(task_id);
        state.tasks.insert(task_id.to_string(), updated);
        drop(state);

        info!(task_id, generation, "task completed");
        self.bus.publish(HubEvent::TaskCompleted {
            task_id: task_id.to_string(),
            generation,
        });
        Ok(())
    }

    /// Fenced failure: requeues while retry budget remains, otherwise
    /// moves the record to the dead-letter table.
    pub async fn fail(
        &self,
        task_id: &str,
        generation: u64,
        reason: &str,
    ) -> Result<FailDisposition> {
        let mut state = self.state.lock().await;
        let task = Self::fence(state.tasks.get(task_id), task_id, generation)?;
        let mut updated = task.clone();
        updated.assigned_to = None;
        updated.assigned_at = None;
        updated.last_error = Some(reason.to_string());

        if updated.retry_count < updated.max_retries {
            updated.retry_count += 1;
            updated.generation += 1;
            updated.enqueue_seq = state.next_seq;
            state.next_seq += 1;
            updated.record_transition(TaskStatus::Queued, format!("retry: {reason}"));

            self.persist(&updated)?;
            state.sweep_grace.remove(task_id);
            state.queued.insert(QueueState::index_key(&updated));
            let retry_count = updated.retry_count;
            let new_generation = updated.generation;
            state.tasks.insert(task_id.to_string(), updated);
            drop(state);

            info!(task_id, retry_count, "task requeued after failure");
            self.bus.publish(HubEvent::TaskRetried {
                task_id: task_id.to_string(),
                retry_count,
                generation: new_generation,
            });
            Ok(FailDisposition::Requeued {
                retry_count,
                generation: new_generation,
            })
        } else {
            updated.record_transition(TaskStatus::Failed, reason.to_string());
            updated.record_transition(TaskStatus::Dead, "retries exhausted");

            // Dead-letter move: the dead row becomes durable before the
            // active row disappears, so a crash in between is recovered
            // by rolling forward on startup.
            self.store
                .put(TASKS_DEAD, task_id, &serde_json::to_vec(&updated)?)?;
            self.store.sync(TASKS_DEAD)?;
            self.store.delete(TASKS_ACTIVE, task_id)?;
            self.store.sync(TASKS_ACTIVE)?;

            state.sweep_grace.remove(task_id);
            state.tasks.remove(task_id);
            drop(state);

            warn!(task_id, reason, "task dead-lettered");
            self.bus.publish(HubEvent::TaskDeadLettered {
                task_id: task_id.to_string(),
                reason: reason.to_string(),
            });
            Ok(FailDisposition::DeadLettered)
        }
    }

    /// Returns an assigned task to the queue with a bumped generation.
    /// Used by the overdue sweep, the lifecycle on session loss and
    /// acceptance timeout, and the operator API.
    pub async fn reclaim(&self, task_id: &str, reason: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get(task_id)
            .ok_or_else(|| HubError::NotFound(format!("task {task_id}")))?;
        if task.status != TaskStatus::Assigned {
            return Err(HubError::WrongState {
                entity: format!("task {task_id}"),
                expected: "assigned".to_string(),
                found: task.status.to_string(),
            });
        }

        let mut updated = task.clone();
        updated.generation += 1;
        updated.assigned_to = None;
        updated.assigned_at = None;
        updated.enqueue_seq = state.next_seq;
        state.next_seq += 1;
        updated.record_transition(TaskStatus::Queued, format!("reclaim: {reason}"));

        self.persist(&updated)?;
        state.sweep_grace.remove(task_id);
        state.queued.insert(QueueState::index_key(&updated));
        let generation = updated.generation;
        state.tasks.insert(task_id.to_string(), updated);
        drop(state);

        info!(task_id, generation, reason, "task reclaimed");
        self.bus.publish(HubEvent::TaskReclaimed {
            task_id: task_id.to_string(),
            generation,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Fire-and-forget progress advisory. Unfenced, memory plus an
    /// unsynced write, no events.
    pub async fn update_progress(&self, task_id: &str, _generation: u64, percentage: u8) {
        let mut state = self.state.lock().await;
        if let Some(task) = state.tasks.get_mut(task_id) {
            if task.status == TaskStatus::Assigned {
                task.progress_percent = Some(percentage.min(100));
                if let Ok(bytes) = serde_json::to_vec(task) {
                    let _ = self.store.put(TASKS_ACTIVE, task_id, &bytes);
                }
            }
        }
    }

    pub async fn get(&self, task_id: &str) -> Option<Task> {
        let state = self.state.lock().await;
        if let Some(task) = state.tasks.get(task_id) {
            return Some(task.clone());
        }
        drop(state);
        // Fall through to the dead-letter table.
        self.store
            .get(TASKS_DEAD, task_id)
            .ok()
            .flatten()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    }

    /// Lists active tasks, newest first, honoring the filter.
    pub async fn list(&self, filter: TaskFilter) -> Vec<Task> {
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| filter.status.map_or(true, |s| t.status == s))
            .filter(|t| {
                filter
                    .assigned_to
                    .as_ref()
                    .map_or(true, |a| t.assigned_to.as_deref() == Some(a.as_str()))
            })
            .cloned()
            .collect();
        tasks.sort_by_key(|t| std::cmp::Reverse(t.created_at));
        if let Some(limit) = filter.limit {
            tasks.truncate(limit);
        }
        tasks
    }

    /// Queued tasks in selection order (priority lane, then lane
    /// position). This is the scheduler's working set for one pass.
    pub async fn queued_snapshot(&self) -> Vec<Task> {
        let state = self.state.lock().await;
        state
            .queued
            .iter()
            .filter_map(|(_, _, id)| state.tasks.get(id).cloned())
            .collect()
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        let mut stats = QueueStats::default();
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Queued => {
                    stats.queued += 1;
                    *stats.by_priority.entry(task.priority.lane()).or_insert(0) += 1;
                }
                TaskStatus::Assigned => stats.assigned += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed | TaskStatus::Dead => stats.dead += 1,
            }
        }
        stats.dead_lettered_total = self.store.len(TASKS_DEAD).unwrap_or(0);
        stats
    }

    /// All dead-lettered tasks, straight from the dead table.
    pub async fn list_dead_letter(&self) -> Vec<Task> {
        let mut tasks = Vec::new();
        let _ = self.store.fold(TASKS_DEAD, &mut |_, value| {
            if let Ok(task) = serde_json::from_slice::<Task>(value) {
                tasks.push(task);
            }
        });
        tasks
    }

    /// Operator override: restores a dead task to the queue with a
    /// fresh retry budget and a bumped generation.
    pub async fn retry_dead_letter(&self, task_id: &str) -> Result<()> {
        let bytes = self
            .store
            .get(TASKS_DEAD, task_id)?
            .ok_or_else(|| HubError::NotFound(format!("dead-letter task {task_id}")))?;
        let mut task: Task = serde_json::from_slice(&bytes)?;

        let mut state = self.state.lock().await;
        task.generation += 1;
        task.retry_count = 0;
        task.enqueue_seq = state.next_seq;
        state.next_seq += 1;
        task.record_transition(TaskStatus::Queued, "dead_letter_retry");

        // Active row becomes durable before the dead row disappears;
        // startup recovery rolls the move forward if we crash between.
        self.store
            .put(TASKS_ACTIVE, task_id, &serde_json::to_vec(&task)?)?;
        self.store.sync(TASKS_ACTIVE)?;
        self.store.delete(TASKS_DEAD, task_id)?;
        self.store.sync(TASKS_DEAD)?;

        state.queued.insert(QueueState::index_key(&task));
        let generation = task.generation;
        state.tasks.insert(task_id.to_string(), task);
        drop(state);

        info!(task_id, "dead-letter task restored to queue");
        self.bus.publish(HubEvent::TaskRetried {
            task_id: task_id.to_string(),
            retry_count: 0,
            generation,
        });
        Ok(())
    }

    /// One pass of the overdue sweep. Assigned tasks past their
    /// deadline are reclaimed, except that an agent still working and
    /// online buys one extra sweep interval of patience.
    pub async fn run_overdue_sweep(&self, probe: &dyn AgentProbe) -> usize {
        let now = epoch_ms();
        let ttl = self.config.assignment_ttl_ms as i64;

        let overdue: Vec<(String, Option<String>)> = {
            let state = self.state.lock().await;
            state
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Assigned)
                .filter(|t| {
                    let deadline = t
                        .complete_by
                        .unwrap_or_else(|| t.assigned_at.unwrap_or(t.updated_at) + ttl);
                    now > deadline
                })
                .map(|t| (t.id.clone(), t.assigned_to.clone()))
                .collect()
        };

        let mut reclaimed = 0;
        for (task_id, agent_id) in overdue {
            let engaged = match &agent_id {
                Some(agent_id) => probe
                    .snapshot(agent_id)
                    .await
                    .map(|s| s.fsm_state == AgentFsmState::Working && s.connected_at.is_some())
                    .unwrap_or(false),
                None => false,
            };

            if engaged {
                let mut state = self.state.lock().await;
                let grace = state.sweep_grace.entry(task_id.clone()).or_insert(0);
                if *grace == 0 {
                    *grace = 1;
                    debug!(%task_id, "overdue but agent still working; extending patience");
                    continue;
                }
            }

            match self.reclaim(&task_id, "overdue").await {
                Ok(()) => reclaimed += 1,
                Err(HubError::WrongState { .. }) | Err(HubError::NotFound(_)) => {
                    // Settled between the scan and the reclaim; fine.
                }
                Err(e) => warn!(%task_id, error = %e, "overdue reclaim failed"),
            }
        }
        reclaimed
    }

    /// Spawns the recurring overdue sweep.
    pub fn spawn_sweep(&self, probe: Arc<dyn AgentProbe>) -> tokio::task::JoinHandle<()> {
        let queue = self.clone();
        let period = Duration::from_millis(queue.config.overdue_sweep_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reclaimed = queue.run_overdue_sweep(probe.as_ref()).await;
                if reclaimed > 0 {
                    info!(reclaimed, "overdue sweep reclaimed tasks");
                }
            }
        })
    }
}
