//! Configuration surface of the orchestration engine.
//!
//! Every knob is serde-deserializable so the gateway can layer file and
//! environment sources on top of these defaults.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AllocationStrategy {
    Balanced,
    Performance,
    CostOptimized,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrent_tasks: usize,
    /// Default task timeout when a spec does not carry one.
    pub task_timeout_ms: u64,
    pub tick_interval_ms: u64,
    pub resource_allocation_strategy: AllocationStrategy,
    /// `false`: capacity test uses the primary capability's bound.
    /// `true`: each required capability's own bound is checked.
    pub per_capability_concurrency: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            task_timeout_ms: 300_000,
            tick_interval_ms: 1_000,
            resource_allocation_strategy: AllocationStrategy::Balanced,
            per_capability_concurrency: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub agent_health_check_interval_secs: u64,
    pub discovery_cache_ttl_secs: u64,
    pub registration_ttl_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            agent_health_check_interval_secs: 30,
            discovery_cache_ttl_secs: 300,
            registration_ttl_secs: 86_400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_size: usize,
    pub max_retries: u32,
    /// Base delay of the exponential retry backoff.
    pub retry_delay_ms: u64,
    pub visibility_timeout_ms: u64,
    pub dead_letter_queue: bool,
    pub batch_size: usize,
    pub concurrency: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            max_retries: 3,
            retry_delay_ms: 1_000,
            visibility_timeout_ms: 300_000,
            dead_letter_queue: true,
            batch_size: 10,
            concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    pub port: u16,
    pub ping_interval_ms: u64,
    pub pong_timeout_ms: u64,
    pub max_connections: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            port: 8081,
            ping_interval_ms: 30_000,
            pong_timeout_ms: 10_000,
            max_connections: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageConfig {
    pub max_size_bytes: usize,
    pub default_timeout_ms: u64,
    pub max_retries: u32,
    pub compression_threshold: usize,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 1_048_576,
            default_timeout_ms: 30_000,
            max_retries: 3,
            compression_threshold: 8_192,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimitsConfig {
    /// Fraction of CPU budget available to plan execution, 0.0..=1.0.
    pub max_cpu_usage: f64,
    pub max_memory_mb: u64,
    pub max_network_mbps: u64,
    pub max_disk_io_mbps: u64,
}

impl Default for ResourceLimitsConfig {
    fn default() -> Self {
        Self {
            max_cpu_usage: 0.8,
            max_memory_mb: 4_096,
            max_network_mbps: 1_000,
            max_disk_io_mbps: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoScalingConfig {
    pub enabled: bool,
    pub min_agents: u32,
    pub max_agents: u32,
    /// Utilization percentage that triggers scale-up.
    pub scale_up_threshold: f64,
    /// Utilization percentage that triggers scale-down.
    pub scale_down_threshold: f64,
}

impl Default for AutoScalingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_agents: 1,
            max_agents: 10,
            scale_up_threshold: 80.0,
            scale_down_threshold: 20.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub size: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self { size: 4 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub scheduler: SchedulerConfig,
    pub registry: RegistryConfig,
    pub queue: QueueConfig,
    pub websocket: WebSocketConfig,
    pub message: MessageConfig,
    pub resources: ResourceLimitsConfig,
    pub auto_scaling: AutoScalingConfig,
    pub worker_pool: WorkerPoolConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = OrchestratorConfig::default();
        assert!(config.scheduler.max_concurrent_tasks > 0);
        assert!(config.queue.max_size > 0);
        assert!(config.queue.retry_delay_ms > 0);
        assert!(config.resources.max_cpu_usage <= 1.0);
    }

    #[test]
    fn test_strategy_wire_format() {
        let s: AllocationStrategy = serde_json::from_str("\"cost-optimized\"").unwrap();
        assert_eq!(s, AllocationStrategy::CostOptimized);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: OrchestratorConfig =
            serde_json::from_str(r#"{"queue": {"max_size": 5}}"#).unwrap();
        assert_eq!(config.queue.max_size, 5);
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.scheduler.tick_interval_ms, 1_000);
    }
}
