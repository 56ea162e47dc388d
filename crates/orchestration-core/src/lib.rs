//! Distributed agent orchestration engine.
//!
//! The control plane registers heterogeneous worker agents, admits tasks and
//! execution plans, schedules work onto capability-matched agents, routes
//! inter-agent messages, drives deployment rollouts and auto-scaling, and
//! evaluates rule-driven optimization actions. Components own their state and
//! communicate through typed events and the shared [`state_store`] interface.

pub mod condition;
pub mod conductor;
pub mod config;
pub mod events;
pub mod execution;
pub mod graph;
pub mod lifecycle;
pub mod metrics;
pub mod optimizer;
pub mod queue;
pub mod registry;
pub mod resources;
pub mod router;
pub mod system;
pub mod types;
pub mod worker_pool;

pub use conductor::{AgentInvoker, Conductor};
pub use config::{AllocationStrategy, OrchestratorConfig};
pub use events::{EventBus, SystemEvent};
pub use execution::{ExecutionEngine, PlanStatus};
pub use lifecycle::LifecycleManager;
pub use optimizer::{PerformanceOptimizer, PerformanceReport};
pub use queue::TaskQueue;
pub use registry::{AgentRegistry, DiscoveryQuery};
pub use router::MessageRouter;
pub use system::Orchestrator;
pub use types::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error("Invalid specification: {0}")]
    InvalidSpec(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Queue is full (max: {0})")]
    QueueFull(usize),

    #[error("No agent matches required capabilities: {0}")]
    CapabilityMismatch(String),

    #[error("Dependency graph contains a cycle")]
    Cyclic,

    #[error("Timed out after {0} ms")]
    Timeout(u64),

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Message too large: {size} bytes exceeds limit of {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
}

impl From<state_store::StoreError> for OrchestrationError {
    fn from(e: state_store::StoreError) -> Self {
        OrchestrationError::StoreUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for OrchestrationError {
    fn from(e: serde_json::Error) -> Self {
        OrchestrationError::StoreUnavailable(format!("corrupt stored record: {}", e))
    }
}
