//! Hub work-cycle state machine
//!
//! A periodic tick evaluates system-level predicates and moves the hub
//! between work modes. Entering any non-resting state costs an
//! invocation quantum granted by the ledger; a watchdog caps time spent
//! in `healing` and a cooldown bounds how often healing can re-enter.
//! Operators can force transitions and pause the automatic tick.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::FsmConfig;
use crate::constants::{
    FSM_DEAD_LETTER_HEALTH_THRESHOLD, FSM_HEALING_HISTORY_CAP, FSM_HISTORY_CAP,
    FSM_MAX_HEALING_ATTEMPTS,
};
use crate::models::{epoch_ms, HubState};
use crate::queue::TaskQueue;
use crate::{HubError, Result};

/// Budget verdict from the invocation ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetStatus {
    Ok,
    Exhausted,
}

/// External invocation accounting consumed by the FSM.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn check_budget(&self, state: HubState) -> BudgetStatus;
    async fn record_invocation(&self, state: HubState, meta: &str);
}

/// Ledger with a fixed per-state invocation quota.
pub struct QuotaLedger {
    quota: u64,
    spent: Mutex<std::collections::HashMap<HubState, u64>>,
}

impl QuotaLedger {
    pub fn new(quota: u64) -> Self {
        Self {
            quota,
            spent: Mutex::new(std::collections::HashMap::new()),
        }
    }
}

#[async_trait]
impl Ledger for QuotaLedger {
    async fn check_budget(&self, state: HubState) -> BudgetStatus {
        if state == HubState::Resting {
            return BudgetStatus::Ok;
        }
        let spent = self.spent.lock().await;
        if spent.get(&state).copied().unwrap_or(0) < self.quota {
            BudgetStatus::Ok
        } else {
            BudgetStatus::Exhausted
        }
    }

    async fn record_invocation(&self, state: HubState, meta: &str) {
        let mut spent = self.spent.lock().await;
        *spent.entry(state).or_insert(0) += 1;
        debug!(state = %state, meta, "invocation recorded");
    }
}

/// Aggregate system snapshot read once per tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemState {
    pub pending_goals: usize,
    pub active_goals: usize,
    pub health_critical: bool,
    pub improving_work_available: bool,
}

/// Supplies the per-tick snapshot; opaque to the FSM.
#[async_trait]
pub trait SystemProbe: Send + Sync {
    async fn system_state(&self) -> SystemState;
}

/// Default probe: reads queue statistics. Queued work counts as
/// pending goals; a deep dead-letter backlog reads as health-critical.
pub struct QueueSystemProbe {
    queue: TaskQueue,
}

impl QueueSystemProbe {
    pub fn new(queue: TaskQueue) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl SystemProbe for QueueSystemProbe {
    async fn system_state(&self) -> SystemState {
        let stats = self.queue.stats().await;
        SystemState {
            pending_goals: stats.queued,
            active_goals: stats.assigned,
            health_critical: stats.dead_lettered_total >= FSM_DEAD_LETTER_HEALTH_THRESHOLD,
            improving_work_available: false,
        }
    }
}

/// One recorded transition, predicate-driven or forced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsmTransition {
    pub ts: i64,
    pub from: HubState,
    pub to: HubState,
    pub reason: String,
    pub forced: bool,
}

/// Aggregate FSM view for the admin API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsmStatus {
    pub state: HubState,
    pub cycle_count: u64,
    pub transition_count: u64,
    pub paused: bool,
    pub cooldown_active: bool,
    pub healing_attempts: u32,
}

struct FsmInner {
    state: HubState,
    cycle_count: u64,
    transition_count: u64,
    paused: bool,
    entered_at_ms: i64,
    cooldown_until_ms: Option<i64>,
    healing_attempts: u32,
    history: VecDeque<FsmTransition>,
    healing_history: VecDeque<FsmTransition>,
}

impl FsmInner {
    fn record(&mut self, to: HubState, reason: &str, forced: bool) {
        let transition = FsmTransition {
            ts: epoch_ms(),
            from: self.state,
            to,
            reason: reason.to_string(),
            forced,
        };
        if self.state == HubState::Healing || to == HubState::Healing {
            self.healing_history.push_back(transition.clone());
            if self.healing_history.len() > FSM_HEALING_HISTORY_CAP {
                self.healing_history.pop_front();
            }
        }
        self.history.push_back(transition);
        if self.history.len() > FSM_HISTORY_CAP {
            self.history.pop_front();
        }
        self.state = to;
        self.entered_at_ms = epoch_ms();
        self.transition_count += 1;
    }

    fn cooldown_active(&self, now: i64) -> bool {
        self.cooldown_until_ms.map_or(false, |until| now < until)
    }
}

/// The hub's autonomous work cycler
#[derive(Clone)]
pub struct HubFsm {
    inner: Arc<Mutex<FsmInner>>,
    ledger: Arc<dyn Ledger>,
    probe: Arc<dyn SystemProbe>,
    config: FsmConfig,
}

impl HubFsm {
    pub fn new(ledger: Arc<dyn Ledger>, probe: Arc<dyn SystemProbe>, config: FsmConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FsmInner {
                state: HubState::Resting,
                cycle_count: 0,
                transition_count: 0,
                paused: false,
                entered_at_ms: epoch_ms(),
                cooldown_until_ms: None,
                healing_attempts: 0,
                history: VecDeque::new(),
                healing_history: VecDeque::new(),
            })),
            ledger,
            probe,
            config,
        }
    }

    /// One predicate-evaluation cycle. Decision order: healing first,
    /// then resting exits, then budget-exhaustion retreat, else stay.
    pub async fn tick(&self) {
        {
            let inner = self.inner.lock().await;
            if inner.paused {
                return;
            }
        }

        // Watchdog runs ahead of everything else.
        {
            let mut inner = self.inner.lock().await;
            inner.cycle_count += 1;
            if inner.state == HubState::Healing {
                let spent = epoch_ms() - inner.entered_at_ms;
                if spent > self.config.healing_watchdog_ms as i64 {
                    warn!(spent_ms = spent, "healing watchdog fired");
                    inner.record(HubState::Resting, "healing_watchdog", false);
                    inner.cooldown_until_ms =
                        Some(epoch_ms() + self.config.healing_cooldown_ms as i64);
                    return;
                }
            }
        }

        let snapshot = self.probe.system_state().await;
        let now = epoch_ms();

        let (current, cooldown_active, healing_exhausted) = {
            let inner = self.inner.lock().await;
            (
                inner.state,
                inner.cooldown_active(now),
                inner.healing_attempts >= FSM_MAX_HEALING_ATTEMPTS,
            )
        };

        let target = if snapshot.health_critical
            && current != HubState::Healing
            && !healing_exhausted
            && !cooldown_active
        {
            Some((HubState::Healing, "health_critical"))
        } else if current == HubState::Resting && snapshot.pending_goals > 0 {
            Some((HubState::Executing, "pending_goals"))
        } else if current == HubState::Resting && snapshot.improving_work_available {
            Some((HubState::Improving, "improving_work_available"))
        } else if current != HubState::Resting
            && self.ledger.check_budget(current).await == BudgetStatus::Exhausted
        {
            Some((HubState::Resting, "budget_exhausted"))
        } else {
            None
        };

        if let Some((to, reason)) = target {
            let _ = self.transition(to, reason, false).await;
        }
    }

    /// Applies a transition, charging the ledger for non-resting
    /// targets. Predicate-driven callers pass `forced = false`.
    async fn transition(&self, to: HubState, reason: &str, forced: bool) -> Result<()> {
        if to != HubState::Resting && self.ledger.check_budget(to).await == BudgetStatus::Exhausted
        {
            debug!(target = %to, "transition refused: budget exhausted");
            return Err(HubError::BudgetExhausted {
                state: to.to_string(),
            });
        }

        let mut inner = self.inner.lock().await;
        if inner.state == to {
            return Ok(());
        }
        let leaving_healing = inner.state == HubState::Healing;
        info!(from = %inner.state, to = %to, reason, forced, "hub transition");
        inner.record(to, reason, forced);
        if to == HubState::Healing {
            inner.healing_attempts += 1;
        }
        if leaving_healing {
            inner.cooldown_until_ms = Some(epoch_ms() + self.config.healing_cooldown_ms as i64);
        }
        drop(inner);

        if to != HubState::Resting {
            self.ledger.record_invocation(to, reason).await;
        }
        Ok(())
    }

    /// Operator-forced transition; recorded identically to
    /// predicate-driven ones.
    pub async fn force_transition(&self, to: HubState, reason: &str) -> Result<()> {
        self.transition(to, reason, true).await
    }

    /// Suspends automatic ticks until `resume`.
    pub async fn pause(&self) {
        let mut inner = self.inner.lock().await;
        inner.paused = true;
        info!("hub fsm paused");
    }

    pub async fn resume(&self) {
        let mut inner = self.inner.lock().await;
        inner.paused = false;
        info!("hub fsm resumed");
    }

    pub async fn state(&self) -> HubState {
        self.inner.lock().await.state
    }

    pub async fn status(&self) -> FsmStatus {
        let inner = self.inner.lock().await;
        FsmStatus {
            state: inner.state,
            cycle_count: inner.cycle_count,
            transition_count: inner.transition_count,
            paused: inner.paused,
            cooldown_active: inner.cooldown_active(epoch_ms()),
            healing_attempts: inner.healing_attempts,
        }
    }

    /// Most recent transitions, newest last.
    pub async fn history(&self, limit: usize) -> Vec<FsmTransition> {
        let inner = self.inner.lock().await;
        let len = inner.history.len();
        inner
            .history
            .iter()
            .skip(len.saturating_sub(limit))
            .cloned()
            .collect()
    }

    pub async fn healing_history(&self) -> Vec<FsmTransition> {
        let inner = self.inner.lock().await;
        inner.healing_history.iter().cloned().collect()
    }

    /// Runs the periodic tick loop.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(self.config.tick_ms.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }
}

#[cfg(test)]
mod tests;
