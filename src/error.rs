use thiserror::Error;

/// Convenience type alias for Results with HubError
pub type Result<T> = std::result::Result<T, HubError>;

/// Main error type for the AgentCom hub
///
/// Every public operation on a core component returns a discriminated
/// result built from these variants. Errors are recovered locally where
/// possible; only an unrecoverable durability failure is fatal to a
/// component.
#[derive(Error, Debug)]
pub enum HubError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Durable storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Wrong state for {entity}: expected {expected}, found {found}")]
    WrongState {
        entity: String,
        expected: String,
        found: String,
    },

    #[error("Stale generation for task {task_id}: presented {presented}, current {current}")]
    StaleGeneration {
        task_id: String,
        presented: u64,
        current: u64,
    },

    #[error("Queue is full")]
    QueueFull,

    #[error("Agent {agent_id} is busy")]
    AgentBusy { agent_id: String },

    #[error("Rate limited: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Session lost for agent {agent_id}")]
    SessionLost { agent_id: String },

    #[error("Invocation budget exhausted for state {state}")]
    BudgetExhausted { state: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Timeout: {message}")]
    Timeout { message: String },

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
