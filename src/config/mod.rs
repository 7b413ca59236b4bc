use crate::constants::{
    ADMIN_HTTP_REQUESTS_PER_MINUTE, DEFAULT_ACCEPTANCE_TIMEOUT_MS, DEFAULT_ASSIGNMENT_TTL_MS,
    DEFAULT_FSM_HEALING_COOLDOWN_MS, DEFAULT_FSM_HEALING_WATCHDOG_MS, DEFAULT_FSM_TICK_MS,
    DEFAULT_MAX_QUEUE_SIZE, DEFAULT_MAX_RETRIES, DEFAULT_OVERDUE_SWEEP_INTERVAL_MS,
    DEFAULT_RATELIMIT_QUIET_RESET_MS, DEFAULT_SESSION_IDLE_TIMEOUT_MS,
    DEFAULT_SESSION_KEEPALIVE_MS, RATELIMIT_BACKOFF_CURVE_MS,
};
use crate::{HubError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;


/// Top-level hub configuration, one section per subsystem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub auth: AuthConfig,
    pub queue: QueueConfig,
    pub lifecycle: LifecycleConfig,
    pub ratelimit: RateLimitConfig,
    pub fsm: FsmConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    /// Coarse per-process quota on admin HTTP requests, enforced ahead
    /// of the per-caller limiter.
    pub admin_requests_per_minute: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared secret presented by admin HTTP callers.
    pub api_key: String,
    /// Shared secret presented by agents in the `identify` frame.
    pub agent_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub data_dir: String,
    pub max_queue_size: usize,
    pub max_retries_default: u32,
    pub overdue_sweep_interval_ms: u64,
    pub assignment_ttl_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    pub acceptance_timeout_ms: u64,
}

/// Token bucket parameters for one ingress tier
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierLimits {
    /// Bucket capacity in whole tokens.
    pub capacity: u64,
    /// Refill rate in whole tokens per minute.
    pub refill_per_min: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub light: TierLimits,
    pub normal: TierLimits,
    pub heavy: TierLimits,
    pub backoff_curve_ms: Vec<u64>,
    pub quiet_reset_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsmConfig {
    pub tick_ms: u64,
    pub healing_watchdog_ms: u64,
    pub healing_cooldown_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub keepalive_ms: u64,
    pub idle_timeout_ms: u64,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn required_secret(name: &str) -> Result<String> {
    let value = env::var(name)
        .map_err(|_| HubError::Configuration(format!("{name} environment variable is required")))?;
    if value.trim().is_empty() {
        return Err(HubError::Configuration(format!("{name} cannot be empty")));
    }
    if value.len() < 32 {
        return Err(HubError::Configuration(format!(
            "{name} must be at least 32 characters; generate one with: openssl rand -hex 32"
        )));
    }
    Ok(value)
}

impl Config {
    /// Loads configuration from the environment, honoring a `.env` file
    /// when present. Secrets are required and length-checked; everything
    /// else falls back to the documented defaults.
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!("Loaded .env file from: {:?}", path),
            Err(e) => tracing::debug!("No .env file loaded: {}", e),
        }

        let api_key = required_secret("AGENTCOM_API_KEY")?;
        let agent_token = required_secret("AGENTCOM_AGENT_TOKEN")?;

        let allowed_origins = env::var("AGENTCOM_ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let ratelimit = RateLimitConfig {
            quiet_reset_ms: env_or(
                "AGENTCOM_RATELIMIT_QUIET_RESET_MS",
                DEFAULT_RATELIMIT_QUIET_RESET_MS,
            ),
            ..RateLimitConfig::default()
        };

        Ok(Self {
            api: ApiConfig {
                host: env::var("AGENTCOM_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                port: env_or("AGENTCOM_PORT", 4400u16),
                allowed_origins,
                admin_requests_per_minute: env_or(
                    "AGENTCOM_ADMIN_REQUESTS_PER_MINUTE",
                    ADMIN_HTTP_REQUESTS_PER_MINUTE,
                ),
            },
            auth: AuthConfig {
                api_key,
                agent_token,
            },
            queue: QueueConfig {
                data_dir: env::var("AGENTCOM_DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
                max_queue_size: env_or("AGENTCOM_MAX_QUEUE_SIZE", DEFAULT_MAX_QUEUE_SIZE),
                max_retries_default: env_or("AGENTCOM_MAX_RETRIES", DEFAULT_MAX_RETRIES),
                overdue_sweep_interval_ms: env_or(
                    "AGENTCOM_OVERDUE_SWEEP_INTERVAL_MS",
                    DEFAULT_OVERDUE_SWEEP_INTERVAL_MS,
                ),
                assignment_ttl_ms: env_or("AGENTCOM_ASSIGNMENT_TTL_MS", DEFAULT_ASSIGNMENT_TTL_MS),
            },
            lifecycle: LifecycleConfig {
                acceptance_timeout_ms: env_or(
                    "AGENTCOM_ACCEPTANCE_TIMEOUT_MS",
                    DEFAULT_ACCEPTANCE_TIMEOUT_MS,
                ),
            },
            ratelimit,
            fsm: FsmConfig {
                tick_ms: env_or("AGENTCOM_FSM_TICK_MS", DEFAULT_FSM_TICK_MS),
                healing_watchdog_ms: env_or(
                    "AGENTCOM_FSM_HEALING_WATCHDOG_MS",
                    DEFAULT_FSM_HEALING_WATCHDOG_MS,
                ),
                healing_cooldown_ms: env_or(
                    "AGENTCOM_FSM_HEALING_COOLDOWN_MS",
                    DEFAULT_FSM_HEALING_COOLDOWN_MS,
                ),
            },
            session: SessionConfig {
                keepalive_ms: env_or("AGENTCOM_SESSION_KEEPALIVE_MS", DEFAULT_SESSION_KEEPALIVE_MS),
                idle_timeout_ms: env_or(
                    "AGENTCOM_SESSION_IDLE_TIMEOUT_MS",
                    DEFAULT_SESSION_IDLE_TIMEOUT_MS,
                ),
            },
        })
    }

    /// Fixed configuration for tests: local-only, fast timers, fixed
    /// secrets.
    pub fn for_tests() -> Self {
        Self {
            api: ApiConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                allowed_origins: vec!["http://localhost:3000".to_string()],
                admin_requests_per_minute: ADMIN_HTTP_REQUESTS_PER_MINUTE,
            },
            auth: AuthConfig {
                api_key: "test-api-key-0123456789abcdef0123456789abcdef".to_string(),
                agent_token: "test-agent-token-0123456789abcdef01234567".to_string(),
            },
            queue: QueueConfig {
                data_dir: String::new(),
                max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
                max_retries_default: DEFAULT_MAX_RETRIES,
                overdue_sweep_interval_ms: 50,
                assignment_ttl_ms: 200,
            },
            lifecycle: LifecycleConfig {
                acceptance_timeout_ms: 100,
            },
            ratelimit: RateLimitConfig::default(),
            fsm: FsmConfig {
                tick_ms: 20,
                healing_watchdog_ms: 200,
                healing_cooldown_ms: 400,
            },
            session: SessionConfig {
                keepalive_ms: 50,
                idle_timeout_ms: 200,
            },
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            light: TierLimits {
                capacity: 120,
                refill_per_min: 120,
            },
            normal: TierLimits {
                capacity: 60,
                refill_per_min: 60,
            },
            heavy: TierLimits {
                capacity: 10,
                refill_per_min: 10,
            },
            backoff_curve_ms: RATELIMIT_BACKOFF_CURVE_MS.to_vec(),
            quiet_reset_ms: DEFAULT_RATELIMIT_QUIET_RESET_MS,
        }
    }
}
