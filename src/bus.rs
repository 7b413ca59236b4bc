//! In-process topic pub/sub
//!
//! The bus is the only shared global in the hub. It is created once at
//! startup and passed by handle. Subscribers receive every event for
//! their topic in publication order; delivery is best-effort and
//! in-memory only, so an event on the bus never implies durability by
//! itself (the task queue syncs storage before publishing).

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

/// Topic address for publication and subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Task,
    Agent,
    RateLimit,
}

/// Events multicast across hub components
///
/// Task events are published by the queue only after the backing
/// mutation has been synced to durable storage.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HubEvent {
    TaskSubmitted {
        task_id: String,
        priority: u8,
    },
    TaskAssigned {
        task_id: String,
        agent_id: String,
        generation: u64,
    },
    TaskCompleted {
        task_id: String,
        generation: u64,
    },
    TaskRetried {
        task_id: String,
        retry_count: u32,
        generation: u64,
    },
    TaskReclaimed {
        task_id: String,
        generation: u64,
        reason: String,
    },
    TaskDeadLettered {
        task_id: String,
        reason: String,
    },
    AgentJoined {
        agent_id: String,
    },
    AgentLeft {
        agent_id: String,
    },
    AgentIdle {
        agent_id: String,
    },
    RateLimitViolated {
        agent_id: String,
        tier: String,
    },
    RateLimitCleared {
        agent_id: String,
    },
}

impl HubEvent {
    /// The topic an event is multicast on.
    pub fn topic(&self) -> Topic {
        match self {
            HubEvent::TaskSubmitted { .. }
            | HubEvent::TaskAssigned { .. }
            | HubEvent::TaskCompleted { .. }
            | HubEvent::TaskRetried { .. }
            | HubEvent::TaskReclaimed { .. }
            | HubEvent::TaskDeadLettered { .. } => Topic::Task,
            HubEvent::AgentJoined { .. } | HubEvent::AgentLeft { .. } | HubEvent::AgentIdle { .. } => {
                Topic::Agent
            }
            HubEvent::RateLimitViolated { .. } | HubEvent::RateLimitCleared { .. } => {
                Topic::RateLimit
            }
        }
    }
}

/// Topic-addressed broadcast bus
///
/// Each subscriber owns an unbounded channel, so publication never
/// blocks the publisher. Closed subscribers are pruned lazily on the
/// next publish to their topic.
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<RwLock<HashMap<Topic, Vec<mpsc::UnboundedSender<HubEvent>>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Subscribe to one topic. The returned receiver observes every
    /// event published to the topic after this call, in order.
    pub fn subscribe(&self, topic: Topic) -> mpsc::UnboundedReceiver<HubEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.write().expect("bus registry poisoned");
        subscribers.entry(topic).or_default().push(tx);
        rx
    }

    /// Subscribe to several topics at once through a single receiver.
    /// Events from different topics interleave; ordering holds within
    /// each topic.
    pub fn subscribe_many(&self, topics: &[Topic]) -> mpsc::UnboundedReceiver<HubEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.write().expect("bus registry poisoned");
        for topic in topics {
            subscribers.entry(*topic).or_default().push(tx.clone());
        }
        rx
    }

    /// Publish an event to its topic's subscribers.
    pub fn publish(&self, event: HubEvent) {
        let topic = event.topic();
        let mut subscribers = self.subscribers.write().expect("bus registry poisoned");
        if let Some(senders) = subscribers.get_mut(&topic) {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
        }
        debug!(?topic, ?event, "published event");
    }

    /// Number of live subscriptions for a topic, used by tests and the
    /// stats endpoint.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        let subscribers = self.subscribers.read().expect("bus registry poisoned");
        subscribers.get(&topic).map(|s| s.len()).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
