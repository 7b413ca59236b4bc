//! Wire frame types
//!
//! Text frames carrying JSON objects, one object per frame. Every
//! object has a `type` tag and a `protocol_version`. Unknown fields in
//! inbound frames are ignored; an unknown `type` fails decoding and
//! closes the connection. Field names are lowercase_underscore and
//! timestamps are epoch milliseconds.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::constants::PROTOCOL_VERSION;
use crate::models::AssignmentEnvelope;

fn default_protocol_version() -> u32 {
    PROTOCOL_VERSION
}

/// Frames sent by the agent to the hub
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Identify {
        agent_id: String,
        token: String,
        #[serde(default)]
        capabilities: BTreeSet<String>,
        #[serde(default)]
        client_type: Option<String>,
        #[serde(default = "default_protocol_version")]
        protocol_version: u32,
    },
    TaskAccepted {
        task_id: String,
        generation: u64,
        #[serde(default = "default_protocol_version")]
        protocol_version: u32,
    },
    TaskRejected {
        task_id: String,
        generation: u64,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default = "default_protocol_version")]
        protocol_version: u32,
    },
    TaskProgress {
        task_id: String,
        generation: u64,
        percent: u8,
        #[serde(default = "default_protocol_version")]
        protocol_version: u32,
    },
    TaskComplete {
        task_id: String,
        generation: u64,
        result: serde_json::Value,
        #[serde(default)]
        tokens_used: Option<u64>,
        #[serde(default = "default_protocol_version")]
        protocol_version: u32,
    },
    TaskFailed {
        task_id: String,
        generation: u64,
        reason: String,
        #[serde(default = "default_protocol_version")]
        protocol_version: u32,
    },
    /// Sent on reconnect so the hub can reconcile the agent's view of
    /// its current work against its own.
    StateReport {
        #[serde(default)]
        task_id: Option<String>,
        status: String,
        #[serde(default)]
        generation: Option<u64>,
        #[serde(default = "default_protocol_version")]
        protocol_version: u32,
    },
    Ping {
        nonce: u64,
        #[serde(default = "default_protocol_version")]
        protocol_version: u32,
    },
    Pong {
        nonce: u64,
        #[serde(default = "default_protocol_version")]
        protocol_version: u32,
    },
    Close {
        #[serde(default)]
        code: Option<u16>,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default = "default_protocol_version")]
        protocol_version: u32,
    },
}

/// Frames sent by the hub to the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Identified {
        agent_id: String,
        protocol_version: u32,
    },
    IdentifyError {
        reason: String,
        protocol_version: u32,
    },
    TaskAssign {
        task_id: String,
        generation: u64,
        description: String,
        needed_capabilities: BTreeSet<String>,
        metadata: HashMap<String, serde_json::Value>,
        assigned_at: i64,
        protocol_version: u32,
    },
    /// Reply to `task_complete` / `task_failed`. `status` is one of
    /// `complete`, `failed`, `stale`.
    TaskAck {
        task_id: String,
        status: String,
        protocol_version: u32,
    },
    /// Reconciliation directive: whatever the agent thinks it is doing
    /// is obsolete and must be dropped.
    TaskAbandon {
        task_id: Option<String>,
        reason: String,
        protocol_version: u32,
    },
    RateLimited {
        tier: String,
        retry_after_ms: u64,
        protocol_version: u32,
    },
    Ping {
        nonce: u64,
        protocol_version: u32,
    },
    Pong {
        nonce: u64,
        protocol_version: u32,
    },
    Close {
        code: u16,
        reason: String,
        protocol_version: u32,
    },
}

impl ServerFrame {
    pub fn identified(agent_id: &str) -> Self {
        ServerFrame::Identified {
            agent_id: agent_id.to_string(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    pub fn identify_error(reason: &str) -> Self {
        ServerFrame::IdentifyError {
            reason: reason.to_string(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    pub fn task_assign(envelope: &AssignmentEnvelope) -> Self {
        ServerFrame::TaskAssign {
            task_id: envelope.task_id.clone(),
            generation: envelope.generation,
            description: envelope.description.clone(),
            needed_capabilities: envelope.needed_capabilities.clone(),
            metadata: envelope.metadata.clone(),
            assigned_at: envelope.assigned_at,
            protocol_version: PROTOCOL_VERSION,
        }
    }

    pub fn task_ack(task_id: &str, status: &str) -> Self {
        ServerFrame::TaskAck {
            task_id: task_id.to_string(),
            status: status.to_string(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    pub fn task_abandon(task_id: Option<&str>, reason: &str) -> Self {
        ServerFrame::TaskAbandon {
            task_id: task_id.map(|s| s.to_string()),
            reason: reason.to_string(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    pub fn rate_limited(tier: &str, retry_after_ms: u64) -> Self {
        ServerFrame::RateLimited {
            tier: tier.to_string(),
            retry_after_ms,
            protocol_version: PROTOCOL_VERSION,
        }
    }

    pub fn ping(nonce: u64) -> Self {
        ServerFrame::Ping {
            nonce,
            protocol_version: PROTOCOL_VERSION,
        }
    }

    pub fn pong(nonce: u64) -> Self {
        ServerFrame::Pong {
            nonce,
            protocol_version: PROTOCOL_VERSION,
        }
    }

    pub fn close(code: u16, reason: &str) -> Self {
        ServerFrame::Close {
            code,
            reason: reason.to_string(),
            protocol_version: PROTOCOL_VERSION,
        }
    }
}
