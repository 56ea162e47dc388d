//! Domain model shared across the orchestration components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

pub type AgentId = String;
pub type TaskId = String;

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Busy,
    Error,
    Maintenance,
    Offline,
}

/// Resource envelope a capability or instance asks for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceRequirements {
    pub cpu: f64,
    pub memory_mb: u64,
    pub network_mbps: u64,
}

/// A named skill an agent offers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub capability_type: String,
    #[serde(default)]
    pub priority: i32,
    pub max_concurrency: u32,
    #[serde(default)]
    pub estimated_execution_ms: u64,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub resources: ResourceRequirements,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEndpoint {
    pub url: String,
}

/// Rolling performance counters maintained by the conductor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPerformance {
    pub tasks_completed: u64,
    pub avg_execution_ms: f64,
    pub success_rate: f64,
    pub last_activity: DateTime<Utc>,
}

impl Default for AgentPerformance {
    fn default() -> Self {
        Self {
            tasks_completed: 0,
            avg_execution_ms: 0.0,
            success_rate: 1.0,
            last_activity: Utc::now(),
        }
    }
}

/// Health gauges reported by probes.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentHealthGauges {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub uptime_secs: u64,
    pub error_count: u64,
}

/// Registration request for a new agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub agent_type: String,
    pub capabilities: Vec<Capability>,
    pub endpoints: Vec<AgentEndpoint>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Registered agent record, owned by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub agent_type: String,
    pub status: AgentStatus,
    pub capabilities: Vec<Capability>,
    pub current_tasks: Vec<TaskId>,
    pub performance: AgentPerformance,
    pub health: AgentHealthGauges,
    pub endpoints: Vec<AgentEndpoint>,
    pub tags: Vec<String>,
    pub region: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Agent {
    pub fn from_spec(spec: AgentSpec) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: spec.name,
            agent_type: spec.agent_type,
            status: AgentStatus::Idle,
            capabilities: spec.capabilities,
            current_tasks: Vec::new(),
            performance: AgentPerformance::default(),
            health: AgentHealthGauges::default(),
            endpoints: spec.endpoints,
            tags: spec.tags,
            region: spec.region,
            metadata: spec.metadata,
            created: now,
            updated: now,
        }
    }

    pub fn capability_types(&self) -> HashSet<&str> {
        self.capabilities
            .iter()
            .map(|c| c.capability_type.as_str())
            .collect()
    }

    /// Concurrency bound of the primary (first) capability.
    pub fn primary_concurrency(&self) -> u32 {
        self.capabilities
            .first()
            .map(|c| c.max_concurrency)
            .unwrap_or(1)
    }

    pub fn has_capacity(&self, per_capability: bool, required: &[String]) -> bool {
        if per_capability {
            required.iter().all(|r| {
                self.capabilities
                    .iter()
                    .find(|c| &c.capability_type == r)
                    .map(|c| (self.current_tasks.len() as u32) < c.max_concurrency)
                    .unwrap_or(false)
            })
        } else {
            (self.current_tasks.len() as u32) < self.primary_concurrency()
        }
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl TaskPriority {
    /// Base component of the queue score: critical > high > medium > low.
    pub fn base_score(self) -> f64 {
        match self {
            TaskPriority::Critical => 4.0,
            TaskPriority::High => 3.0,
            TaskPriority::Medium => 2.0,
            TaskPriority::Low => 1.0,
        }
    }

    /// Multiplier applied to the base resource profile during plan execution.
    pub fn resource_factor(self) -> f64 {
        match self {
            TaskPriority::Critical => 2.0,
            TaskPriority::High => 1.5,
            TaskPriority::Medium => 1.0,
            TaskPriority::Low => 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConstraints {
    pub max_retries: u32,
    pub timeout_ms: u64,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

impl Default for TaskConstraints {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout_ms: 300_000,
            deadline: None,
        }
    }
}

/// Admission request for a unit of work. The payload is opaque to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default)]
    pub id: Option<TaskId>,
    pub task_type: String,
    #[serde(default = "default_priority")]
    pub priority: TaskPriority,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub constraints: TaskConstraints,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub batch_id: Option<String>,
}

fn default_priority() -> TaskPriority {
    TaskPriority::Medium
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: String,
    pub priority: TaskPriority,
    pub payload: serde_json::Value,
    pub dependencies: Vec<TaskId>,
    pub required_capabilities: Vec<String>,
    pub constraints: TaskConstraints,
    pub status: TaskStatus,
    pub assigned_agent: Option<AgentId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub batch_id: Option<String>,
}

impl Task {
    pub fn from_spec(spec: TaskSpec) -> Self {
        Self {
            id: spec.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            task_type: spec.task_type,
            priority: spec.priority,
            payload: spec.payload,
            dependencies: spec.dependencies,
            required_capabilities: spec.required_capabilities,
            constraints: spec.constraints,
            status: TaskStatus::Pending,
            assigned_agent: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            retry_count: 0,
            scheduled_for: spec.scheduled_for,
            batch_id: spec.batch_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

// ---------------------------------------------------------------------------
// Workflows and execution plans
// ---------------------------------------------------------------------------

/// Named collection of tasks expanded by the conductor into submissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub tasks: Vec<TaskSpec>,
    /// task id -> ids it depends on
    #[serde(default)]
    pub dependencies: HashMap<TaskId, Vec<TaskId>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupType {
    Sequential,
    Parallel,
    Conditional,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGroup {
    pub group_type: GroupType,
    pub tasks: Vec<TaskId>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub condition: Option<String>,
}

/// Plan executed in-process by the execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub name: String,
    pub tasks: Vec<TaskSpec>,
    /// task id -> ids it depends on
    #[serde(default)]
    pub dependencies: HashMap<TaskId, Vec<TaskId>>,
    #[serde(default)]
    pub groups: Vec<TaskGroup>,
    pub max_concurrency: usize,
    pub timeout_ms: u64,
    #[serde(default)]
    pub rollback_on_failure: bool,
}

// ---------------------------------------------------------------------------
// Messages and channels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Event,
    Broadcast,
    System,
}

/// Recipient field of a message: a single agent id, a list, or `"*"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Recipient {
    One(AgentId),
    Many(Vec<AgentId>),
}

impl Recipient {
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Recipient::One(id) if id == "*")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub message_type: MessageType,
    pub from: String,
    #[serde(default)]
    pub to: Option<Recipient>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    #[serde(default = "default_priority")]
    pub priority: TaskPriority,
    #[serde(default)]
    pub requires_ack: bool,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retries: u32,
}

impl Message {
    pub fn new(message_type: MessageType, from: impl Into<String>, to: Recipient) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            message_type,
            from: from.into(),
            to: Some(to),
            channel: None,
            payload: serde_json::Value::Null,
            correlation_id: None,
            timestamp: Utc::now(),
            ttl_ms: None,
            priority: TaskPriority::Medium,
            requires_ack: false,
            retry_count: 0,
            max_retries: 0,
        }
    }

    /// System response acknowledging receipt of `incoming`.
    pub fn ack_for(incoming: &Message, from: impl Into<String>) -> Self {
        let mut ack = Message::new(
            MessageType::Response,
            from,
            Recipient::One(incoming.from.clone()),
        );
        ack.correlation_id = Some(incoming.message_id.clone());
        ack
    }

    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.ttl_ms.is_some_and(|ttl| {
            now.signed_duration_since(self.timestamp).num_milliseconds() > ttl as i64
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Direct,
    Broadcast,
    Topic,
    Queue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub persistent: bool,
    pub max_messages: usize,
    pub retention_ms: u64,
    #[serde(default)]
    pub allow_anonymous: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            persistent: false,
            max_messages: 1_000,
            retention_ms: 86_400_000,
            allow_anonymous: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub channel_type: ChannelType,
    pub participants: HashSet<AgentId>,
    pub config: ChannelConfig,
    pub created: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Lifecycle: templates, deployments, instances
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProbeKind {
    Http { path: String, port: u16 },
    Tcp { port: u16 },
    Exec { command: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthProbe {
    #[serde(flatten)]
    pub kind: ProbeKind,
    pub initial_delay_secs: u64,
    pub period_secs: u64,
    pub timeout_secs: u64,
    pub failure_threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BatchSize {
    Count(u32),
    /// e.g. "25%" of the deployment's replica count
    Percent(String),
}

impl BatchSize {
    pub fn resolve(&self, total: u32) -> u32 {
        match self {
            BatchSize::Count(n) => (*n).max(1),
            BatchSize::Percent(p) => {
                let pct: f64 = p.trim_end_matches('%').parse().unwrap_or(100.0);
                (((total as f64) * pct / 100.0).ceil() as u32).max(1)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryStep {
    /// Percentage of replicas to run as canaries for this step.
    pub weight: u32,
    #[serde(default)]
    pub pause_secs: Option<u64>,
    /// Named analysis hook evaluated after the pause.
    #[serde(default)]
    pub analysis: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "kebab-case")]
pub enum UpdateStrategy {
    Rolling { max_unavailable: BatchSize },
    Recreate,
    BlueGreen,
    Canary { steps: Vec<CanaryStep> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingPolicy {
    pub min_replicas: u32,
    pub max_replicas: u32,
    /// Utilization above which the deployment scales up.
    pub scale_up_threshold: f64,
    /// Utilization below which the deployment scales down.
    pub scale_down_threshold: f64,
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTemplate {
    pub id: String,
    pub name: String,
    pub image: String,
    pub resources: ResourceRequirements,
    pub scaling: Option<ScalingPolicy>,
    pub health_probe: Option<HealthProbe>,
    pub update_strategy: UpdateStrategy,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Updating,
    Scaling,
    Failed,
    Removed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub template_id: String,
    pub replicas: u32,
    #[serde(default)]
    pub env_overrides: HashMap<String, String>,
    pub status: DeploymentStatus,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending,
    Running,
    Stopping,
    Stopped,
    Failed,
    Updating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceHealth {
    Unknown,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInstance {
    pub id: String,
    pub deployment_id: String,
    pub template_revision: u64,
    pub status: InstanceStatus,
    pub health: InstanceHealth,
    pub node: Option<String>,
    #[serde(default)]
    pub ports: HashMap<u16, u16>,
    pub started_at: Option<DateTime<Utc>>,
    pub restarts: u32,
}

// ---------------------------------------------------------------------------
// Metrics and optimization rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
    Summary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub metric_type: MetricType,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Threshold,
    Pattern,
    Ml,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    ScaleUp,
    ScaleDown,
    Rebalance,
    Restart,
    Alert,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleAction {
    pub action_type: ActionType,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationRule {
    pub id: String,
    pub kind: RuleKind,
    pub condition: String,
    pub action: RuleAction,
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    pub cooldown_secs: u64,
    #[serde(default)]
    pub last_triggered: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_score_ordering() {
        assert!(TaskPriority::Critical.base_score() > TaskPriority::High.base_score());
        assert!(TaskPriority::High.base_score() > TaskPriority::Medium.base_score());
        assert!(TaskPriority::Medium.base_score() > TaskPriority::Low.base_score());
    }

    #[test]
    fn test_recipient_wire_shapes() {
        let one: Recipient = serde_json::from_str("\"agent-1\"").unwrap();
        assert_eq!(one, Recipient::One("agent-1".into()));
        let many: Recipient = serde_json::from_str("[\"a\",\"b\"]").unwrap();
        assert_eq!(many, Recipient::Many(vec!["a".into(), "b".into()]));
        let star: Recipient = serde_json::from_str("\"*\"").unwrap();
        assert!(star.is_broadcast());
    }

    #[test]
    fn test_batch_size_resolution() {
        assert_eq!(BatchSize::Count(2).resolve(10), 2);
        assert_eq!(BatchSize::Percent("25%".into()).resolve(10), 3);
        assert_eq!(BatchSize::Percent("1%".into()).resolve(10), 1);
        assert_eq!(BatchSize::Count(0).resolve(10), 1);
    }

    #[test]
    fn test_agent_capacity_primary_capability() {
        let spec = AgentSpec {
            name: "worker".into(),
            agent_type: "generic".into(),
            capabilities: vec![
                Capability {
                    capability_type: "compute".into(),
                    priority: 0,
                    max_concurrency: 2,
                    estimated_execution_ms: 0,
                    dependencies: vec![],
                    resources: ResourceRequirements::default(),
                },
                Capability {
                    capability_type: "io".into(),
                    priority: 0,
                    max_concurrency: 8,
                    estimated_execution_ms: 0,
                    dependencies: vec![],
                    resources: ResourceRequirements::default(),
                },
            ],
            endpoints: vec![AgentEndpoint {
                url: "ws://localhost:9000".into(),
            }],
            tags: vec![],
            region: None,
            metadata: HashMap::new(),
        };
        let mut agent = Agent::from_spec(spec);
        agent.current_tasks = vec!["t1".into(), "t2".into()];

        let required = vec!["io".to_string()];
        assert!(!agent.has_capacity(false, &required));
        assert!(agent.has_capacity(true, &required));
    }

    #[test]
    fn test_message_expiry() {
        let mut msg = Message::new(
            MessageType::Event,
            "system",
            Recipient::One("agent-1".into()),
        );
        msg.ttl_ms = Some(10);
        assert!(!msg.expired(msg.timestamp));
        assert!(msg.expired(msg.timestamp + chrono::Duration::milliseconds(11)));
    }
}
