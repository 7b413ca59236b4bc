//! Ingress rate limiting
//!
//! Every ingress event (inbound protocol frame or admin HTTP call) is
//! gated by a lazy token bucket keyed by `(agent_id, channel, tier)`.
//! Tokens are stored as integers at a 1000x scale so refill math never
//! touches floating point. Repeat violators are pushed onto a
//! progressive backoff curve; while an agent is backing off, the
//! scheduler excludes it from the idle pool via `is_rate_limited`.
//!
//! The limiter owns its own storage and calls no other component. It is
//! designed for concurrent callers; there is no owner actor, just short
//! critical sections around the bucket map.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::bus::{EventBus, HubEvent};
use crate::config::{RateLimitConfig, TierLimits};
use crate::constants::{RATELIMIT_TOKEN_SCALE, RATELIMIT_WARN_FRACTION};

/// Ingress channel a bucket guards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateChannel {
    Ws,
    Http,
}

/// Cost classification of an ingress message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateTier {
    Light,
    Normal,
    Heavy,
}

impl RateTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateTier::Light => "light",
            RateTier::Normal => "normal",
            RateTier::Heavy => "heavy",
        }
    }
}

/// Outcome of a `check` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allow,
    /// Allowed, but the bucket is below the warn threshold. Sessions
    /// prepend a `rate_limited` advisory frame on this outcome.
    AllowWarn,
    Deny {
        retry_after_ms: u64,
    },
}

impl RateDecision {
    pub fn is_deny(&self) -> bool {
        matches!(self, RateDecision::Deny { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    agent_id: String,
    channel: RateChannel,
    tier: RateTier,
}

/// One lazy token bucket plus its violation bookkeeping
#[derive(Debug, Clone)]
struct Bucket {
    /// Scaled tokens, invariant `0 <= tokens <= capacity`.
    tokens: u64,
    /// Scaled capacity.
    capacity: u64,
    /// Whole tokens per minute; refill is computed as
    /// `elapsed_ms * refill_per_min * SCALE / 60_000`.
    refill_per_min: u64,
    last_refill_ms: u64,
    violation_count: u64,
    last_violation_ms: Option<u64>,
    backoff_idx: usize,
}

impl Bucket {
    fn new(limits: TierLimits, now_ms: u64) -> Self {
        let capacity = limits.capacity * RATELIMIT_TOKEN_SCALE;
        Self {
            tokens: capacity,
            capacity,
            refill_per_min: limits.refill_per_min,
            last_refill_ms: now_ms,
            violation_count: 0,
            last_violation_ms: None,
            backoff_idx: 0,
        }
    }

    fn refill(&mut self, now_ms: u64) {
        let elapsed = now_ms.saturating_sub(self.last_refill_ms);
        if elapsed == 0 {
            return;
        }
        let refilled = elapsed * self.refill_per_min * RATELIMIT_TOKEN_SCALE / 60_000;
        self.tokens = self.capacity.min(self.tokens + refilled);
        self.last_refill_ms = now_ms;
    }

    /// Tokens the bucket would hold at `now_ms` without mutating it.
    fn projected_tokens(&self, now_ms: u64) -> u64 {
        let elapsed = now_ms.saturating_sub(self.last_refill_ms);
        let refilled = elapsed * self.refill_per_min * RATELIMIT_TOKEN_SCALE / 60_000;
        self.capacity.min(self.tokens + refilled)
    }

    fn warn_threshold(&self) -> u64 {
        (self.capacity as f64 * RATELIMIT_WARN_FRACTION) as u64
    }

    /// Milliseconds until `deficit` scaled tokens have refilled,
    /// rounded up and never zero.
    fn refill_eta_ms(&self, deficit: u64) -> u64 {
        if self.refill_per_min == 0 {
            return u64::MAX;
        }
        let per_ms_numerator = self.refill_per_min * RATELIMIT_TOKEN_SCALE;
        (deficit * 60_000).div_ceil(per_ms_numerator).max(1)
    }

    /// Whether the bucket's backoff window still covers `now_ms`.
    fn backing_off(&self, now_ms: u64, curve: &[u64]) -> bool {
        match self.last_violation_ms {
            Some(at) => {
                let idx = self.backoff_idx.min(curve.len().saturating_sub(1));
                now_ms < at + curve.get(idx).copied().unwrap_or(0)
            }
            None => false,
        }
    }
}

/// Per-agent, per-channel, per-tier token bucket limiter
#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<BucketKey, Bucket>>>,
    overrides: Arc<RwLock<HashMap<(String, RateTier), TierLimits>>>,
    exempt: Arc<RwLock<HashSet<String>>>,
    config: RateLimitConfig,
    bus: EventBus,
    started: Instant,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, bus: EventBus) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            overrides: Arc::new(RwLock::new(HashMap::new())),
            exempt: Arc::new(RwLock::new(HashSet::new())),
            config,
            bus,
            started: Instant::now(),
        }
    }

    /// Monotonic milliseconds since the limiter was created. Uses the
    /// tokio clock so paused-time tests drive refill deterministically.
    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn limits_for(&self, agent_id: &str, tier: RateTier) -> TierLimits {
        let overrides = self.overrides.read().expect("overrides poisoned");
        if let Some(limits) = overrides.get(&(agent_id.to_string(), tier)) {
            return *limits;
        }
        match tier {
            RateTier::Light => self.config.light,
            RateTier::Normal => self.config.normal,
            RateTier::Heavy => self.config.heavy,
        }
    }

    /// Pass/warn/deny decision for one ingress event of weight `cost`.
    ///
    /// A zero cost is a pure probe: it never consumes tokens and never
    /// changes bucket state.
    pub fn check(
        &self,
        agent_id: &str,
        channel: RateChannel,
        tier: RateTier,
        cost: u32,
    ) -> RateDecision {
        if self.is_exempt(agent_id) {
            return RateDecision::Allow;
        }

        let now = self.now_ms();
        let key = BucketKey {
            agent_id: agent_id.to_string(),
            channel,
            tier,
        };
        let limits = self.limits_for(agent_id, tier);

        let mut buckets = self.buckets.lock().expect("buckets poisoned");
        let bucket = buckets
            .entry(key)
            .or_insert_with(|| Bucket::new(limits, now));

        if cost == 0 {
            let projected = bucket.projected_tokens(now);
            return if projected < bucket.warn_threshold() {
                RateDecision::AllowWarn
            } else {
                RateDecision::Allow
            };
        }

        bucket.refill(now);

        // A violation-free quiet period resets the backoff ladder.
        if let Some(last) = bucket.last_violation_ms {
            if now.saturating_sub(last) >= self.config.quiet_reset_ms {
                bucket.backoff_idx = 0;
                bucket.violation_count = 0;
                bucket.last_violation_ms = None;
            }
        }

        let scaled_cost = cost as u64 * RATELIMIT_TOKEN_SCALE;
        if bucket.tokens >= scaled_cost {
            bucket.tokens -= scaled_cost;
            if bucket.tokens < bucket.warn_threshold() {
                RateDecision::AllowWarn
            } else {
                RateDecision::Allow
            }
        } else {
            let retry_after_ms = bucket.refill_eta_ms(scaled_cost - bucket.tokens);
            bucket.violation_count += 1;
            bucket.last_violation_ms = Some(now);
            if bucket.violation_count > 1 {
                bucket.backoff_idx =
                    (bucket.backoff_idx + 1).min(self.config.backoff_curve_ms.len() - 1);
            }
            let backoff_ms = self.config.backoff_curve_ms[bucket.backoff_idx];
            drop(buckets);

            warn!(
                agent_id,
                tier = tier.as_str(),
                retry_after_ms,
                "rate limit violated"
            );
            self.bus.publish(HubEvent::RateLimitViolated {
                agent_id: agent_id.to_string(),
                tier: tier.as_str().to_string(),
            });
            self.notify_when_cleared(agent_id.to_string(), backoff_ms);

            RateDecision::Deny { retry_after_ms }
        }
    }

    /// True while any of the agent's buckets is inside its backoff
    /// window. The scheduler treats such agents as ineligible.
    pub fn is_rate_limited(&self, agent_id: &str) -> bool {
        if self.is_exempt(agent_id) {
            return false;
        }
        let now = self.now_ms();
        let buckets = self.buckets.lock().expect("buckets poisoned");
        buckets
            .iter()
            .filter(|(key, _)| key.agent_id == agent_id)
            .any(|(_, bucket)| bucket.backing_off(now, &self.config.backoff_curve_ms))
    }

    /// Records a violation against every bucket the agent owns without
    /// consuming tokens. Used by the admin path when a deny is decided
    /// outside `check`.
    pub fn record_violation(&self, agent_id: &str) {
        let now = self.now_ms();
        let mut buckets = self.buckets.lock().expect("buckets poisoned");
        for (key, bucket) in buckets.iter_mut() {
            if key.agent_id == agent_id {
                bucket.violation_count += 1;
                bucket.last_violation_ms = Some(now);
                bucket.backoff_idx =
                    (bucket.backoff_idx + 1).min(self.config.backoff_curve_ms.len() - 1);
            }
        }
    }

    /// Replaces the bucket parameters for `(agent_id, tier)` on both
    /// channels. Existing buckets are rebuilt with the new limits.
    pub fn set_override(&self, agent_id: &str, tier: RateTier, limits: TierLimits) {
        {
            let mut overrides = self.overrides.write().expect("overrides poisoned");
            overrides.insert((agent_id.to_string(), tier), limits);
        }
        let now = self.now_ms();
        let mut buckets = self.buckets.lock().expect("buckets poisoned");
        for (key, bucket) in buckets.iter_mut() {
            if key.agent_id == agent_id && key.tier == tier {
                *bucket = Bucket::new(limits, now);
            }
        }
        debug!(agent_id, tier = tier.as_str(), "rate limit override set");
    }

    /// Exempts an agent from every check. Used for internal control
    /// plane agents.
    pub fn add_exempt(&self, agent_id: &str) {
        let mut exempt = self.exempt.write().expect("exempt poisoned");
        exempt.insert(agent_id.to_string());
    }

    pub fn is_exempt(&self, agent_id: &str) -> bool {
        let exempt = self.exempt.read().expect("exempt poisoned");
        exempt.contains(agent_id)
    }

    /// Publishes `rate_limit_cleared` once the backoff window that was
    /// just armed has passed, unless a newer violation extended it.
    fn notify_when_cleared(&self, agent_id: String, backoff_ms: u64) {
        let limiter = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(backoff_ms + 1)).await;
            if !limiter.is_rate_limited(&agent_id) {
                limiter
                    .bus
                    .publish(HubEvent::RateLimitCleared { agent_id });
            }
        });
    }
}
