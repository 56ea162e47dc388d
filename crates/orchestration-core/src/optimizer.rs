//! Performance optimizer: metric ingestion, reports, rule-driven actions.
//!
//! Metrics live in per-name rings (newest thousand entries) and are mirrored
//! to the store with a day's TTL. Every minute the rule engine evaluates
//! each enabled rule's condition against a report of the last hour; a firing
//! rule executes its action fire-and-forget, gated by a per-rule cooldown.

use crate::condition;
use crate::conductor::Conductor;
use crate::events::{EventBus, SystemEvent};
use crate::lifecycle::LifecycleManager;
use crate::queue::TaskQueue;
use crate::registry::AgentRegistry;
use crate::types::{ActionType, AgentStatus, Metric, MetricType, OptimizationRule};
use crate::OrchestrationError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use state_store::{keys, StateStore};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const RING_CAP: usize = 1_000;
const METRIC_TTL: Duration = Duration::from_secs(86_400);
const EVALUATION_INTERVAL: Duration = Duration::from_secs(60);
const REPORT_WINDOW: ChronoDuration = ChronoDuration::hours(1);

const BACKLOG_BOTTLENECK_DEPTH: u64 = 100;
const ERROR_RATE_BOTTLENECK: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceStat {
    pub utilization: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentReport {
    pub total: u64,
    pub idle: u64,
    pub busy: u64,
    pub error: u64,
    pub offline: u64,
    pub avg_success_rate: f64,
    pub avg_execution_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SummaryReport {
    pub submitted: f64,
    pub completed: f64,
    pub failed: f64,
    pub retries: f64,
    pub error_rate: f64,
    pub queue_depth: f64,
    pub throughput_per_min: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bottleneck {
    pub component: String,
    pub description: String,
    pub severity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub generated_at: DateTime<Utc>,
    pub window_secs: u64,
    pub resources: HashMap<String, ResourceStat>,
    pub agents: AgentReport,
    pub summary: SummaryReport,
    pub bottlenecks: Vec<Bottleneck>,
}

pub struct PerformanceOptimizer {
    store: Arc<dyn StateStore>,
    registry: Arc<AgentRegistry>,
    queue: Arc<TaskQueue>,
    lifecycle: Arc<LifecycleManager>,
    conductor: Arc<Conductor>,
    events: EventBus,
    rings: DashMap<String, Mutex<VecDeque<Metric>>>,
    rules: DashMap<String, OptimizationRule>,
}

impl PerformanceOptimizer {
    pub fn new(
        store: Arc<dyn StateStore>,
        registry: Arc<AgentRegistry>,
        queue: Arc<TaskQueue>,
        lifecycle: Arc<LifecycleManager>,
        conductor: Arc<Conductor>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry,
            queue,
            lifecycle,
            conductor,
            events,
            rings: DashMap::new(),
            rules: DashMap::new(),
        })
    }

    // -- metrics ------------------------------------------------------------

    pub async fn record_metric(&self, metric: Metric) {
        let key = keys::metric(&metric.name, metric.timestamp.timestamp_millis());
        match serde_json::to_string(&metric) {
            Ok(json) => {
                if let Err(e) = self.store.put(&key, &json, Some(METRIC_TTL)).await {
                    warn!(metric = %metric.name, "metric mirror write failed: {}", e);
                }
            }
            Err(e) => warn!(metric = %metric.name, "metric serialization failed: {}", e),
        }

        let ring = self
            .rings
            .entry(metric.name.clone())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut ring = ring.lock();
        if ring.len() >= RING_CAP {
            ring.pop_front();
        }
        ring.push_back(metric);
    }

    pub async fn record_value(&self, name: &str, metric_type: MetricType, value: f64) {
        self.record_metric(Metric {
            name: name.to_string(),
            metric_type,
            value,
            timestamp: Utc::now(),
            tags: HashMap::new(),
            unit: None,
        })
        .await;
    }

    /// Aggregate a metric over an optional time range and tag subset.
    pub fn aggregate(
        &self,
        name: &str,
        aggregation: Aggregation,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
        tags: &HashMap<String, String>,
    ) -> Option<f64> {
        let ring = self.rings.get(name)?;
        let ring = ring.lock();
        let values: Vec<f64> = ring
            .iter()
            .filter(|m| match range {
                Some((from, to)) => m.timestamp >= from && m.timestamp <= to,
                None => true,
            })
            .filter(|m| tags.iter().all(|(k, v)| m.tags.get(k) == Some(v)))
            .map(|m| m.value)
            .collect();
        if values.is_empty() {
            return None;
        }
        Some(match aggregation {
            Aggregation::Sum => values.iter().sum(),
            Aggregation::Avg => values.iter().sum::<f64>() / values.len() as f64,
            Aggregation::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
            Aggregation::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            Aggregation::Count => values.len() as f64,
        })
    }

    // -- rules --------------------------------------------------------------

    pub fn add_rule(&self, rule: OptimizationRule) -> Result<(), OrchestrationError> {
        if rule.id.trim().is_empty() {
            return Err(OrchestrationError::InvalidSpec("rule id is empty".into()));
        }
        if condition::parse(&rule.condition).is_none() {
            // A rule that can never fire is almost certainly a typo; surface
            // it at admission rather than silently evaluating to false.
            return Err(OrchestrationError::InvalidSpec(format!(
                "rule {} has an unparseable condition",
                rule.id
            )));
        }
        self.rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    pub fn remove_rule(&self, id: &str) -> Result<(), OrchestrationError> {
        self.rules
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| OrchestrationError::NotFound(format!("rule {}", id)))
    }

    pub fn rules(&self) -> Vec<OptimizationRule> {
        self.rules.iter().map(|r| r.clone()).collect()
    }

    // -- reports ------------------------------------------------------------

    pub async fn generate_report(&self, window: ChronoDuration) -> PerformanceReport {
        let now = Utc::now();
        let from = now - window;
        let range = Some((from, now));
        let no_tags = HashMap::new();

        let mut resources = HashMap::new();
        for resource in ["cpu", "memory", "network", "disk"] {
            let name = format!("resource.{}", resource);
            let utilization = self
                .aggregate(&name, Aggregation::Avg, range, &no_tags)
                .unwrap_or(0.0);
            resources.insert(resource.to_string(), ResourceStat { utilization });
        }

        let agents_list = self.registry.list();
        let mut agents = AgentReport {
            total: agents_list.len() as u64,
            ..Default::default()
        };
        for agent in &agents_list {
            match agent.status {
                AgentStatus::Idle => agents.idle += 1,
                AgentStatus::Busy => agents.busy += 1,
                AgentStatus::Error => agents.error += 1,
                AgentStatus::Offline => agents.offline += 1,
                AgentStatus::Maintenance => {}
            }
        }
        if !agents_list.is_empty() {
            agents.avg_success_rate = agents_list
                .iter()
                .map(|a| a.performance.success_rate)
                .sum::<f64>()
                / agents_list.len() as f64;
            agents.avg_execution_ms = agents_list
                .iter()
                .map(|a| a.performance.avg_execution_ms)
                .sum::<f64>()
                / agents_list.len() as f64;
        }

        let count = |name: &str| {
            self.aggregate(name, Aggregation::Count, range, &no_tags)
                .unwrap_or(0.0)
        };
        let completed = count("task.completed");
        let failed = count("task.failed");
        let depths = self.queue.lane_depths().await.unwrap_or(
            crate::queue::LaneDepths {
                ready: 0,
                processing: 0,
                delayed: 0,
                dead_letter: 0,
            },
        );
        let window_mins = (window.num_seconds() as f64 / 60.0).max(1.0);
        let summary = SummaryReport {
            submitted: count("task.submitted"),
            completed,
            failed,
            retries: count("task.retry"),
            error_rate: if completed + failed > 0.0 {
                failed / (completed + failed)
            } else {
                0.0
            },
            queue_depth: depths.ready as f64,
            throughput_per_min: completed / window_mins,
        };

        let mut bottlenecks = Vec::new();
        if depths.ready > BACKLOG_BOTTLENECK_DEPTH {
            bottlenecks.push(Bottleneck {
                component: "queue".into(),
                description: format!("{} tasks waiting in the ready lane", depths.ready),
                severity: 0.7,
            });
        }
        if summary.error_rate > ERROR_RATE_BOTTLENECK {
            bottlenecks.push(Bottleneck {
                component: "tasks".into(),
                description: format!("error rate {:.1}%", summary.error_rate * 100.0),
                severity: 0.9,
            });
        }
        if agents.total > 0 && agents.idle == 0 && agents.busy == agents.total {
            bottlenecks.push(Bottleneck {
                component: "agents".into(),
                description: "all agents saturated".into(),
                severity: 0.8,
            });
        }

        PerformanceReport {
            generated_at: now,
            window_secs: window.num_seconds().max(0) as u64,
            resources,
            agents,
            summary,
            bottlenecks,
        }
    }

    fn resolve_report_path(report: &PerformanceReport, path: &str) -> Option<f64> {
        let parts: Vec<&str> = path.split('.').collect();
        match parts.as_slice() {
            ["resources", key, "utilization"] => {
                report.resources.get(*key).map(|r| r.utilization)
            }
            ["agents", field] => Some(match *field {
                "total" => report.agents.total as f64,
                "idle" => report.agents.idle as f64,
                "busy" => report.agents.busy as f64,
                "error" => report.agents.error as f64,
                "offline" => report.agents.offline as f64,
                "avg_success_rate" => report.agents.avg_success_rate,
                "avg_execution_ms" => report.agents.avg_execution_ms,
                _ => return None,
            }),
            ["summary", field] => Some(match *field {
                "submitted" => report.summary.submitted,
                "completed" => report.summary.completed,
                "failed" => report.summary.failed,
                "retries" => report.summary.retries,
                "error_rate" => report.summary.error_rate,
                "queue_depth" => report.summary.queue_depth,
                "throughput_per_min" => report.summary.throughput_per_min,
                _ => return None,
            }),
            ["bottlenecks", "length"] => Some(report.bottlenecks.len() as f64),
            _ => None,
        }
    }

    /// One rule-engine pass over the last hour's report.
    pub async fn evaluate_rules(&self) {
        let report = self.generate_report(REPORT_WINDOW).await;
        let now = Utc::now();

        let mut candidates: Vec<OptimizationRule> = self
            .rules
            .iter()
            .filter(|r| r.enabled)
            .map(|r| r.clone())
            .collect();
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority));

        for rule in candidates {
            if let Some(last) = rule.last_triggered {
                let elapsed = now.signed_duration_since(last);
                if elapsed.num_seconds() < rule.cooldown_secs as i64 {
                    continue;
                }
            }

            let fired = condition::evaluate(&rule.condition, &|path| {
                Self::resolve_report_path(&report, path)
            });
            if !fired {
                continue;
            }

            info!(rule_id = %rule.id, action = ?rule.action.action_type, "optimization rule fired");
            if let Some(mut stored) = self.rules.get_mut(&rule.id) {
                stored.last_triggered = Some(now);
            }
            // Fire-and-forget: a failing action never breaks the loop.
            if let Err(e) = self.execute_action(&rule).await {
                warn!(rule_id = %rule.id, "action failed: {}", e);
            }
            self.events.emit(SystemEvent::ActionExecuted {
                rule_id: rule.id.clone(),
                action: rule.action.action_type,
            });
        }
    }

    async fn execute_action(&self, rule: &OptimizationRule) -> Result<(), OrchestrationError> {
        let params = &rule.action.parameters;
        let deployment_id = params
            .get("deployment_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .or_else(|| self.lifecycle.deployments().first().map(|d| d.id.clone()));
        let step = params.get("step").and_then(|v| v.as_u64()).unwrap_or(1) as u32;

        match rule.action.action_type {
            ActionType::ScaleUp => {
                let Some(deployment_id) = deployment_id else {
                    return Err(OrchestrationError::NotFound("no deployments".into()));
                };
                let current = self
                    .lifecycle
                    .deployment(&deployment_id)
                    .map(|d| d.replicas)
                    .unwrap_or(0);
                self.lifecycle
                    .scale(&deployment_id, current + step, &format!("rule {}", rule.id))
                    .await
            }
            ActionType::ScaleDown => {
                let Some(deployment_id) = deployment_id else {
                    return Err(OrchestrationError::NotFound("no deployments".into()));
                };
                let current = self
                    .lifecycle
                    .deployment(&deployment_id)
                    .map(|d| d.replicas)
                    .unwrap_or(0);
                let target = current.saturating_sub(step).max(1);
                self.lifecycle
                    .scale(&deployment_id, target, &format!("rule {}", rule.id))
                    .await
            }
            ActionType::Rebalance => {
                self.conductor.tick().await;
                Ok(())
            }
            ActionType::Restart => {
                let instance_id = params
                    .get("instance_id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        OrchestrationError::InvalidSpec(
                            "restart action needs an instance_id parameter".into(),
                        )
                    })?;
                self.lifecycle.restart_instance(instance_id).await
            }
            ActionType::Alert => {
                let payload = serde_json::json!({
                    "rule_id": rule.id,
                    "condition": rule.condition,
                    "at": Utc::now(),
                    "parameters": params,
                });
                self.store.publish("alerts", &payload.to_string()).await?;
                Ok(())
            }
            ActionType::Custom => {
                // The payload is forwarded verbatim on the custom channel;
                // subscribers own the semantics.
                self.store
                    .publish("actions:custom", &params.to_string())
                    .await?;
                Ok(())
            }
        }
    }

    /// Rule evaluation loop plus event-driven metric ingestion.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(EVALUATION_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut events = self.events.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Ok(depths) = self.queue.lane_depths().await {
                        self.record_value("queue.ready", MetricType::Gauge, depths.ready as f64).await;
                        self.record_value("queue.processing", MetricType::Gauge, depths.processing as f64).await;
                    }
                    self.evaluate_rules().await;
                }
                event = events.recv() => {
                    match event {
                        Ok(event) => self.observe(event).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "optimizer lagged behind the event bus");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("optimizer loop stopped");
                        return;
                    }
                }
            }
        }
    }

    /// Fold system events into counters the report is built from.
    async fn observe(&self, event: SystemEvent) {
        match event {
            SystemEvent::TaskSubmitted { .. } => {
                self.record_value("task.submitted", MetricType::Counter, 1.0).await;
            }
            SystemEvent::TaskCompleted { .. } => {
                self.record_value("task.completed", MetricType::Counter, 1.0).await;
            }
            SystemEvent::TaskFailed { .. } => {
                self.record_value("task.failed", MetricType::Counter, 1.0).await;
            }
            SystemEvent::TaskRetry { .. } => {
                self.record_value("task.retry", MetricType::Counter, 1.0).await;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AutoScalingConfig, QueueConfig, RegistryConfig, SchedulerConfig,
    };
    use crate::types::{
        AgentTemplate, ResourceRequirements, RuleAction, RuleKind, UpdateStrategy,
    };
    use async_trait::async_trait;
    use state_store::MemoryStore;

    struct NullInvoker;

    #[async_trait]
    impl crate::conductor::AgentInvoker for NullInvoker {
        async fn invoke(
            &self,
            _agent: &crate::types::Agent,
            _task: &crate::types::Task,
        ) -> Result<serde_json::Value, String> {
            Ok(serde_json::Value::Null)
        }
    }

    async fn optimizer() -> (Arc<PerformanceOptimizer>, Arc<LifecycleManager>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let events = EventBus::new();
        let queue = Arc::new(TaskQueue::new(
            store.clone(),
            QueueConfig::default(),
            events.clone(),
        ));
        let registry = Arc::new(AgentRegistry::new(
            store.clone(),
            RegistryConfig::default(),
            events.clone(),
        ));
        let lifecycle = LifecycleManager::new(
            store.clone(),
            AutoScalingConfig::default(),
            events.clone(),
        );
        let conductor = Conductor::new(
            queue.clone(),
            registry.clone(),
            Arc::new(NullInvoker),
            store.clone(),
            SchedulerConfig::default(),
            events.clone(),
        );
        let optimizer = PerformanceOptimizer::new(
            store.clone(),
            registry,
            queue,
            lifecycle.clone(),
            conductor,
            events,
        );
        (optimizer, lifecycle, store)
    }

    fn rule(id: &str, condition: &str, action_type: ActionType) -> OptimizationRule {
        OptimizationRule {
            id: id.into(),
            kind: RuleKind::Threshold,
            condition: condition.into(),
            action: RuleAction {
                action_type,
                parameters: serde_json::Value::Null,
            },
            enabled: true,
            priority: 0,
            cooldown_secs: 3_600,
            last_triggered: None,
        }
    }

    #[tokio::test]
    async fn test_metric_ring_caps_at_capacity() {
        let (o, _, _) = optimizer().await;
        for i in 0..(RING_CAP + 50) {
            o.record_value("latency", MetricType::Gauge, i as f64).await;
        }
        let count = o
            .aggregate("latency", Aggregation::Count, None, &HashMap::new())
            .unwrap();
        assert_eq!(count as usize, RING_CAP);
        // Oldest entries were evicted.
        let min = o
            .aggregate("latency", Aggregation::Min, None, &HashMap::new())
            .unwrap();
        assert_eq!(min as usize, 50);
    }

    #[tokio::test]
    async fn test_aggregations() {
        let (o, _, _) = optimizer().await;
        for v in [1.0, 2.0, 3.0, 4.0] {
            o.record_value("m", MetricType::Gauge, v).await;
        }
        let agg = |kind| o.aggregate("m", kind, None, &HashMap::new()).unwrap();
        assert_eq!(agg(Aggregation::Sum), 10.0);
        assert_eq!(agg(Aggregation::Avg), 2.5);
        assert_eq!(agg(Aggregation::Min), 1.0);
        assert_eq!(agg(Aggregation::Max), 4.0);
        assert_eq!(agg(Aggregation::Count), 4.0);
    }

    #[tokio::test]
    async fn test_tag_filtered_aggregation() {
        let (o, _, _) = optimizer().await;
        let mut tagged = Metric {
            name: "m".into(),
            metric_type: MetricType::Gauge,
            value: 7.0,
            timestamp: Utc::now(),
            tags: HashMap::from([("region".to_string(), "east".to_string())]),
            unit: None,
        };
        o.record_metric(tagged.clone()).await;
        tagged.tags = HashMap::from([("region".to_string(), "west".to_string())]);
        tagged.value = 11.0;
        o.record_metric(tagged).await;

        let east = HashMap::from([("region".to_string(), "east".to_string())]);
        assert_eq!(
            o.aggregate("m", Aggregation::Sum, None, &east).unwrap(),
            7.0
        );
    }

    #[tokio::test]
    async fn test_unparseable_rule_rejected_at_admission() {
        let (o, _, _) = optimizer().await;
        let bad = rule("bad", "summary.error_rate >", ActionType::Alert);
        assert!(matches!(
            o.add_rule(bad).unwrap_err(),
            OrchestrationError::InvalidSpec(_)
        ));
    }

    #[tokio::test]
    async fn test_scale_up_rule_fires_and_cooldown_gates() {
        let (o, lifecycle, _) = optimizer().await;
        let template_id = lifecycle
            .register_template(AgentTemplate {
                id: String::new(),
                name: "t".into(),
                image: "img".into(),
                resources: ResourceRequirements::default(),
                scaling: None,
                health_probe: None,
                update_strategy: UpdateStrategy::Recreate,
                env: HashMap::new(),
            })
            .await
            .unwrap();
        let deployment = lifecycle
            .create_deployment(&template_id, 1, HashMap::new())
            .await
            .unwrap();

        // Push the resource gauge over the threshold.
        for _ in 0..5 {
            o.record_value("resource.cpu", MetricType::Gauge, 95.0).await;
        }
        o.add_rule(rule(
            "hot-cpu",
            "resources.cpu.utilization > 80",
            ActionType::ScaleUp,
        ))
        .unwrap();

        o.evaluate_rules().await;
        assert_eq!(lifecycle.deployment(&deployment.id).unwrap().replicas, 2);

        // Cooldown prevents an immediate second firing.
        o.evaluate_rules().await;
        assert_eq!(lifecycle.deployment(&deployment.id).unwrap().replicas, 2);
    }

    #[tokio::test]
    async fn test_alert_action_publishes() {
        let (o, _, store) = optimizer().await;
        let mut sub = store.subscribe("alerts").await.unwrap();

        o.record_value("task.failed", MetricType::Counter, 1.0).await;
        o.add_rule(rule("failures", "summary.failed >= 1", ActionType::Alert))
            .unwrap();
        o.evaluate_rules().await;

        let raw = sub.recv().await.unwrap();
        let alert: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(alert["rule_id"], "failures");
    }

    #[tokio::test]
    async fn test_disabled_rule_never_fires() {
        let (o, _, store) = optimizer().await;
        let mut sub = store.subscribe("alerts").await.unwrap();

        o.record_value("task.failed", MetricType::Counter, 1.0).await;
        let mut r = rule("off", "summary.failed >= 1", ActionType::Alert);
        r.enabled = false;
        o.add_rule(r).unwrap();
        o.evaluate_rules().await;

        assert!(sub.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_report_reflects_metrics_and_bottlenecks() {
        let (o, _, _) = optimizer().await;
        for _ in 0..9 {
            o.record_value("task.completed", MetricType::Counter, 1.0).await;
        }
        for _ in 0..3 {
            o.record_value("task.failed", MetricType::Counter, 1.0).await;
        }

        let report = o.generate_report(ChronoDuration::hours(1)).await;
        assert_eq!(report.summary.completed, 9.0);
        assert_eq!(report.summary.failed, 3.0);
        assert!((report.summary.error_rate - 0.25).abs() < 1e-9);
        // 25% error rate registers as a bottleneck.
        assert!(report
            .bottlenecks
            .iter()
            .any(|b| b.component == "tasks"));
    }
}
