//! Message Bus for orchestration events
//!
//! Publishes plan and task lifecycle events to interested observers (CLI
//! progress output, tests, external bridges) without coupling them to the
//! orchestrator. Subscribers get bounded channels; an event that does not
//! fit in a subscriber's buffer is dropped for that subscriber rather than
//! stalling the publishing step.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

/// Channel buffer size for bounded channels
const CHANNEL_BUFFER_SIZE: usize = 100;

/// Event types that can be subscribed to
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum EventType {
    PlanCreated,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    HandoffTriggered,
    PlanCompleted,
    /// Subscribe to all event types
    All,
}

/// Orchestration events, each scoped to one task/session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    PlanCreated {
        session_id: String,
        plan_id: String,
        total_tasks: usize,
    },
    TaskStarted {
        session_id: String,
        task_id: String,
        agent: String,
    },
    TaskCompleted {
        session_id: String,
        task_id: String,
        agent: String,
        result: String,
    },
    TaskFailed {
        session_id: String,
        task_id: String,
        agent: String,
        error: String,
    },
    HandoffTriggered {
        session_id: String,
        from_agent: String,
        to_agent: String,
        task_id: String,
    },
    PlanCompleted {
        session_id: String,
        plan_id: String,
    },
}

impl Event {
    /// Get the event type for this event
    pub fn event_type(&self) -> EventType {
        match self {
            Event::PlanCreated { .. } => EventType::PlanCreated,
            Event::TaskStarted { .. } => EventType::TaskStarted,
            Event::TaskCompleted { .. } => EventType::TaskCompleted,
            Event::TaskFailed { .. } => EventType::TaskFailed,
            Event::HandoffTriggered { .. } => EventType::HandoffTriggered,
            Event::PlanCompleted { .. } => EventType::PlanCompleted,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Event::PlanCreated { session_id, .. }
            | Event::TaskStarted { session_id, .. }
            | Event::TaskCompleted { session_id, .. }
            | Event::TaskFailed { session_id, .. }
            | Event::HandoffTriggered { session_id, .. }
            | Event::PlanCompleted { session_id, .. } => session_id,
        }
    }
}

/// Message bus for pub/sub delivery of orchestration events
#[derive(Clone)]
pub struct MessageBus {
    /// Each subscriber gets a bounded channel with CHANNEL_BUFFER_SIZE capacity
    channels: Arc<Mutex<HashMap<EventType, Vec<mpsc::Sender<Event>>>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Subscribe to a specific event type, or `EventType::All`
    pub async fn subscribe(&self, event_type: EventType) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let mut channels = self.channels.lock().await;
        channels.entry(event_type).or_default().push(tx);
        rx
    }

    /// Deliver an event to its type's subscribers and to `All` subscribers
    ///
    /// Closed subscribers are pruned.
    pub async fn publish(&self, event: Event) {
        let mut channels = self.channels.lock().await;
        let event_type = event.event_type();

        for key in [event_type, EventType::All] {
            if let Some(subscribers) = channels.get_mut(&key) {
                subscribers.retain(|tx| match tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        warn!("Event subscriber is full, dropping {:?}", event_type);
                        true
                    }
                    Err(TrySendError::Closed(_)) => false,
                });
            }
        }
    }

    /// Number of live subscriptions for an event type
    pub async fn subscriber_count(&self, event_type: EventType) -> usize {
        let channels = self.channels.lock().await;
        channels
            .get(&event_type)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
