//! System-wide defaults
//!
//! Every value here can be overridden through configuration (`config`
//! module) or, for rate-limit tiers, per-agent at runtime via the admin
//! API. Timings are milliseconds unless the name says otherwise.

/// Wire protocol version stamped on every frame. Additive fields are
/// allowed within a version; breaking changes bump it.
pub const PROTOCOL_VERSION: u32 = 1;

/// How long an agent has to ack a `task_assign` with accepted/rejected
/// before the assignment is reclaimed.
pub const DEFAULT_ACCEPTANCE_TIMEOUT_MS: u64 = 60_000;

/// Period of the TaskQueue overdue sweep.
pub const DEFAULT_OVERDUE_SWEEP_INTERVAL_MS: u64 = 30_000;

/// Default task-level deadline applied when `complete_by` is unset.
pub const DEFAULT_ASSIGNMENT_TTL_MS: u64 = 600_000;

/// Default retry budget for new tasks; task-local override allowed.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Soft cap on the number of queued tasks before `submit` refuses.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;

/// Per-task history ring is capped so long-lived retry loops cannot
/// grow records without bound.
pub const TASK_HISTORY_CAP: usize = 50;

/// Period of the scheduler's stuck-agent sweep.
pub const STUCK_AGENT_SWEEP_INTERVAL_MS: u64 = 30_000;

/// Outbound keepalive ping interval per session.
pub const DEFAULT_SESSION_KEEPALIVE_MS: u64 = 30_000;

/// A session with no inbound traffic for this long is closed, which
/// triggers `session_loss` handling.
pub const DEFAULT_SESSION_IDLE_TIMEOUT_MS: u64 = 60_000;

/// Progressive backoff applied to repeat rate-limit violators.
pub const RATELIMIT_BACKOFF_CURVE_MS: [u64; 5] = [1_000, 2_000, 5_000, 10_000, 30_000];

/// A violation-free period this long resets the backoff index.
pub const DEFAULT_RATELIMIT_QUIET_RESET_MS: u64 = 60_000;

/// Internal fixed-point scale for bucket tokens. Tokens are stored as
/// `whole_tokens * 1000` so refill math stays in integers.
pub const RATELIMIT_TOKEN_SCALE: u64 = 1000;

/// Remaining-capacity fraction below which an allow becomes a warn.
pub const RATELIMIT_WARN_FRACTION: f64 = 0.20;

/// Hub FSM tick period.
pub const DEFAULT_FSM_TICK_MS: u64 = 5_000;

/// Hard ceiling on time spent in `healing` before the watchdog forces
/// the FSM back to `resting`.
pub const DEFAULT_FSM_HEALING_WATCHDOG_MS: u64 = 300_000;

/// Cooldown after leaving `healing` during which re-entry is refused.
pub const DEFAULT_FSM_HEALING_COOLDOWN_MS: u64 = 900_000;

/// Transition history ring for the hub FSM.
pub const FSM_HISTORY_CAP: usize = 200;

/// Watchdog/healing event ring for the hub FSM.
pub const FSM_HEALING_HISTORY_CAP: usize = 50;

/// Healing entries allowed before the FSM refuses further healing
/// until the process restarts.
pub const FSM_MAX_HEALING_ATTEMPTS: u32 = 3;

/// Dead-letter backlog at which the default system probe reports the
/// hub health-critical.
pub const FSM_DEAD_LETTER_HEALTH_THRESHOLD: usize = 25;

/// Coarse per-process request quota on the admin HTTP ingress, applied
/// before the per-agent limiter.
pub const ADMIN_HTTP_REQUESTS_PER_MINUTE: u32 = 120;
