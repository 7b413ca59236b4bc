use super::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

struct StubProbe {
    state: std::sync::Mutex<SystemState>,
}

impl StubProbe {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: std::sync::Mutex::new(SystemState::default()),
        })
    }

    fn set(&self, state: SystemState) {
        *self.state.lock().unwrap() = state;
    }
}

#[async_trait]
impl SystemProbe for StubProbe {
    async fn system_state(&self) -> SystemState {
        self.state.lock().unwrap().clone()
    }
}

struct StubLedger {
    exhausted: AtomicBool,
    invocations: AtomicUsize,
}

impl StubLedger {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            exhausted: AtomicBool::new(false),
            invocations: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Ledger for StubLedger {
    async fn check_budget(&self, state: HubState) -> BudgetStatus {
        if state != HubState::Resting && self.exhausted.load(Ordering::SeqCst) {
            BudgetStatus::Exhausted
        } else {
            BudgetStatus::Ok
        }
    }

    async fn record_invocation(&self, _state: HubState, _meta: &str) {
        self.invocations.fetch_add(1, Ordering::SeqCst);
    }
}

fn fsm_config() -> FsmConfig {
    FsmConfig {
        tick_ms: 10,
        healing_watchdog_ms: 50,
        healing_cooldown_ms: 10_000,
    }
}

fn fsm(
    ledger: Arc<StubLedger>,
    probe: Arc<StubProbe>,
) -> HubFsm {
    HubFsm::new(ledger, probe, fsm_config())
}

#[tokio::test]
async fn test_starts_resting() {
    let machine = fsm(StubLedger::new(), StubProbe::new());
    assert_eq!(machine.state().await, HubState::Resting);
    let status = machine.status().await;
    assert_eq!(status.cycle_count, 0);
    assert_eq!(status.transition_count, 0);
    assert!(!status.paused);
}

#[tokio::test]
async fn test_pending_goals_move_resting_to_executing() {
    let ledger = StubLedger::new();
    let probe = StubProbe::new();
    let machine = fsm(ledger.clone(), probe.clone());

    probe.set(SystemState {
        pending_goals: 2,
        ..Default::default()
    });
    machine.tick().await;

    assert_eq!(machine.state().await, HubState::Executing);
    assert_eq!(ledger.invocations.load(Ordering::SeqCst), 1);

    // Goals remaining but already executing: stay.
    machine.tick().await;
    assert_eq!(machine.state().await, HubState::Executing);
    assert_eq!(machine.status().await.transition_count, 1);
}

#[tokio::test]
async fn test_improving_when_resting_and_work_available() {
    let probe = StubProbe::new();
    let machine = fsm(StubLedger::new(), probe.clone());

    probe.set(SystemState {
        improving_work_available: true,
        ..Default::default()
    });
    machine.tick().await;
    assert_eq!(machine.state().await, HubState::Improving);
}

#[tokio::test]
async fn test_budget_exhaustion_forces_resting() {
    let ledger = StubLedger::new();
    let probe = StubProbe::new();
    let machine = fsm(ledger.clone(), probe.clone());

    probe.set(SystemState {
        pending_goals: 1,
        ..Default::default()
    });
    machine.tick().await;
    assert_eq!(machine.state().await, HubState::Executing);

    ledger.exhausted.store(true, Ordering::SeqCst);
    probe.set(SystemState::default());
    machine.tick().await;
    assert_eq!(machine.state().await, HubState::Resting);

    let history = machine.history(10).await;
    assert_eq!(history.last().unwrap().reason, "budget_exhausted");
}

#[tokio::test]
async fn test_health_critical_preempts_into_healing() {
    let probe = StubProbe::new();
    let machine = fsm(StubLedger::new(), probe.clone());

    probe.set(SystemState {
        pending_goals: 5,
        health_critical: true,
        ..Default::default()
    });
    machine.tick().await;

    // Healing wins over the pending-goals rule.
    assert_eq!(machine.state().await, HubState::Healing);
    assert_eq!(machine.status().await.healing_attempts, 1);
}

#[tokio::test]
async fn test_healing_watchdog_forces_resting_and_cooldown() {
    let probe = StubProbe::new();
    let machine = fsm(StubLedger::new(), probe.clone());

    probe.set(SystemState {
        health_critical: true,
        ..Default::default()
    });
    machine.tick().await;
    assert_eq!(machine.state().await, HubState::Healing);

    // Sit in healing past the 50ms watchdog ceiling.
    tokio::time::sleep(std::time::Duration::from_millis(80)).await;
    machine.tick().await;
    assert_eq!(machine.state().await, HubState::Resting);

    let healing = machine.healing_history().await;
    assert!(healing
        .iter()
        .any(|t| t.reason == "healing_watchdog" && t.to == HubState::Resting));

    // Cooldown blocks immediate re-entry even though health is still
    // critical.
    machine.tick().await;
    assert_eq!(machine.state().await, HubState::Resting);
    assert!(machine.status().await.cooldown_active);
}

#[tokio::test]
async fn test_healing_exhaustion_blocks_reentry() {
    let probe = StubProbe::new();
    let machine = HubFsm::new(
        StubLedger::new(),
        probe.clone(),
        FsmConfig {
            tick_ms: 10,
            healing_watchdog_ms: 50,
            // No cooldown so exhaustion is the only brake.
            healing_cooldown_ms: 0,
        },
    );

    probe.set(SystemState {
        health_critical: true,
        ..Default::default()
    });

    for _ in 0..FSM_MAX_HEALING_ATTEMPTS {
        machine.tick().await;
        assert_eq!(machine.state().await, HubState::Healing);
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        machine.tick().await;
        assert_eq!(machine.state().await, HubState::Resting);
    }

    machine.tick().await;
    assert_eq!(machine.state().await, HubState::Resting);
    assert_eq!(
        machine.status().await.healing_attempts,
        FSM_MAX_HEALING_ATTEMPTS
    );
}

#[tokio::test]
async fn test_pause_suspends_ticks() {
    let probe = StubProbe::new();
    let machine = fsm(StubLedger::new(), probe.clone());

    machine.pause().await;
    probe.set(SystemState {
        pending_goals: 1,
        ..Default::default()
    });
    machine.tick().await;
    assert_eq!(machine.state().await, HubState::Resting);
    assert_eq!(machine.status().await.cycle_count, 0);

    machine.resume().await;
    machine.tick().await;
    assert_eq!(machine.state().await, HubState::Executing);
}

#[tokio::test]
async fn test_forced_transition_recorded_and_budgeted() {
    let ledger = StubLedger::new();
    let machine = fsm(ledger.clone(), StubProbe::new());

    machine
        .force_transition(HubState::Contemplating, "operator")
        .await
        .unwrap();
    assert_eq!(machine.state().await, HubState::Contemplating);
    assert_eq!(ledger.invocations.load(Ordering::SeqCst), 1);

    let history = machine.history(10).await;
    assert!(history.last().unwrap().forced);

    ledger.exhausted.store(true, Ordering::SeqCst);
    let refused = machine.force_transition(HubState::Executing, "operator").await;
    assert!(matches!(refused, Err(HubError::BudgetExhausted { .. })));
}

#[tokio::test]
async fn test_history_is_capped() {
    let machine = fsm(StubLedger::new(), StubProbe::new());
    for i in 0..(FSM_HISTORY_CAP + 20) {
        let target = if i % 2 == 0 {
            HubState::Executing
        } else {
            HubState::Resting
        };
        machine.force_transition(target, "churn").await.unwrap();
    }
    assert_eq!(machine.history(10_000).await.len(), FSM_HISTORY_CAP);
}

#[tokio::test]
async fn test_quota_ledger_exhausts() {
    let ledger = QuotaLedger::new(2);
    assert_eq!(ledger.check_budget(HubState::Executing).await, BudgetStatus::Ok);
    ledger.record_invocation(HubState::Executing, "one").await;
    ledger.record_invocation(HubState::Executing, "two").await;
    assert_eq!(
        ledger.check_budget(HubState::Executing).await,
        BudgetStatus::Exhausted
    );
    // Other states and resting are unaffected.
    assert_eq!(ledger.check_budget(HubState::Improving).await, BudgetStatus::Ok);
    assert_eq!(ledger.check_budget(HubState::Resting).await, BudgetStatus::Ok);
}
