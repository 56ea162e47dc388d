//! Typed event bus.
//!
//! Each component receives a cloned [`EventBus`] at construction and emits
//! into it; downstream consumers subscribe for a broadcast receiver. There is
//! no replay: a subscriber that lags past the channel capacity loses the
//! oldest events.

use crate::types::{ActionType, AgentId, TaskId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_CHANNEL_CAPACITY: usize = 1_024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SystemEvent {
    Initialized,
    AgentRegistered { agent_id: AgentId },
    AgentUnregistered { agent_id: AgentId },
    AgentUpdated { agent_id: AgentId },
    AgentConnected { agent_id: AgentId },
    AgentDisconnected { agent_id: AgentId },
    InstanceUnhealthy { deployment_id: String, instance_id: String },
    TaskSubmitted { task_id: TaskId },
    TaskAssigned { task_id: TaskId, agent_id: AgentId },
    TaskStarted { task_id: TaskId },
    TaskCompleted { task_id: TaskId },
    TaskFailed { task_id: TaskId, error: String },
    TaskStale { task_id: TaskId },
    TaskRetry { task_id: TaskId, retry_count: u32 },
    BatchCompleted { batch_id: String },
    PlanStarted { plan_id: String },
    PlanCompleted { plan_id: String },
    PlanFailed { plan_id: String, error: String },
    PlanCancelled { plan_id: String },
    DeploymentCreated { deployment_id: String },
    DeploymentScaled { deployment_id: String, from: u32, to: u32 },
    DeploymentUpdated { deployment_id: String },
    DeploymentRemoved { deployment_id: String },
    ActionExecuted { rule_id: String, action: ActionType },
    ResourceWarning { resource: String, utilization: f64 },
    MessageDeliveryFailed { message_id: String, to: String },
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SystemEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Fire-and-forget: an event with no subscribers is simply dropped.
    pub fn emit(&self, event: SystemEvent) {
        debug!(?event, "event emitted");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.emit(SystemEvent::TaskSubmitted {
            task_id: "t1".into(),
        });

        assert!(matches!(
            rx1.recv().await.unwrap(),
            SystemEvent::TaskSubmitted { .. }
        ));
        assert!(matches!(
            rx2.recv().await.unwrap(),
            SystemEvent::TaskSubmitted { .. }
        ));
    }

    #[test]
    fn test_emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.emit(SystemEvent::Initialized);
    }

    #[test]
    fn test_event_wire_tag() {
        let json = serde_json::to_string(&SystemEvent::AgentConnected {
            agent_id: "a1".into(),
        })
        .unwrap();
        assert!(json.contains("\"event\":\"agentConnected\""));
    }
}
