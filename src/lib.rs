//! # AgentCom
//!
//! AgentCom is a coordination hub for a fleet of autonomous coding
//! agents. Work arrives as tasks, is stored in a durable priority
//! queue, matched to idle agents by capability, dispatched over a
//! persistent bidirectional channel, and reconciled through a fenced
//! completion protocol with at-least-once inbound semantics.
//!
//! ## Architecture
//!
//! The hub is a set of long-lived cooperating components:
//! - **TaskQueue**: the single source of truth for task records, with
//!   sync-before-publish durability and an overdue sweep
//! - **AgentLifecycle**: one state machine per connected agent
//! - **Scheduler**: event-driven capability matcher
//! - **Session**: one actor per agent WebSocket connection
//! - **RateLimiter**: token buckets guarding every ingress path
//! - **HubFsm**: the autonomous work cycler, budget-gated
//!
//! Components communicate through the in-process event bus and opaque
//! handles; no component holds a lock across a cross-component call.

/// Admin HTTP surface and WebSocket endpoint
pub mod api;
/// Agent and admin authentication
pub mod auth;
/// In-process topic pub/sub
pub mod bus;
/// System configuration
pub mod config;
/// System-wide constants
pub mod constants;
/// Error types and handling
pub mod error;
/// Hub work-cycle state machine
pub mod fsm;
/// Per-agent lifecycle state machines
pub mod lifecycle;
/// Core data models
pub mod models;
/// Durable priority task queue
pub mod queue;
/// Ingress rate limiting
pub mod ratelimit;
/// Event-driven task/agent matcher
pub mod scheduler;
/// WebSocket session actor and wire protocol
pub mod session;
/// Durable key/value tables
pub mod storage;
/// Ingress validation
pub mod validation;

#[cfg(test)]
mod tests;

pub use error::{HubError, Result};
