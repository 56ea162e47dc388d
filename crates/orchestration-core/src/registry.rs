//! Agent registry: registration, discovery, health.
//!
//! The registry owns every agent record. Discovery queries run against the
//! in-memory table and are memoized in a short-TTL cache keyed by the
//! serialized query; any mutation flushes the cache. A periodic probe loop
//! refreshes health over HTTP endpoints; transports that hold a live
//! connection (WebSocket) push their own results through
//! [`AgentRegistry::record_health_result`].

use crate::config::RegistryConfig;
use crate::events::{EventBus, SystemEvent};
use crate::types::{Agent, AgentId, AgentSpec, AgentStatus, TaskId};
use crate::OrchestrationError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use state_store::{keys, StateStore};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const HEALTH_WINDOW: usize = 10;
const ERROR_BUFFER: usize = 10;
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const DEGRADED_RTT_MS: u64 = 5_000;
const HEALTH_TTL: Duration = Duration::from_secs(3_600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Unknown,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub success: bool,
    pub response_time_ms: u64,
    pub checked_at: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthError {
    pub message: String,
    pub severity: ErrorSeverity,
    pub at: DateTime<Utc>,
}

/// Rolling health record derived from the last [`HEALTH_WINDOW`] probes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealthRecord {
    pub state: HealthState,
    pub degraded: bool,
    pub uptime_pct: f64,
    pub avg_response_ms: f64,
    window: VecDeque<HealthCheckResult>,
    errors: VecDeque<HealthError>,
}

impl Default for AgentHealthRecord {
    fn default() -> Self {
        Self {
            state: HealthState::Unknown,
            degraded: false,
            uptime_pct: 100.0,
            avg_response_ms: 0.0,
            window: VecDeque::new(),
            errors: VecDeque::new(),
        }
    }
}

impl AgentHealthRecord {
    fn push(&mut self, result: HealthCheckResult) {
        if let Some(err) = &result.error {
            if self.errors.len() >= ERROR_BUFFER {
                self.errors.pop_front();
            }
            self.errors.push_back(HealthError {
                message: err.clone(),
                severity: ErrorSeverity::Warning,
                at: result.checked_at,
            });
        }
        if self.window.len() >= HEALTH_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(result);
        self.derive();
    }

    /// Healthy when at least 2 of the last 3 probes succeeded.
    fn derive(&mut self) {
        let recent: Vec<_> = self.window.iter().rev().take(3).collect();
        let successes = recent.iter().filter(|r| r.success).count();
        self.state = if recent.is_empty() {
            HealthState::Unknown
        } else if successes >= 2 || (recent.len() == 1 && successes == 1) {
            HealthState::Healthy
        } else {
            HealthState::Unhealthy
        };

        let total = self.window.len().max(1) as f64;
        let ok = self.window.iter().filter(|r| r.success).count() as f64;
        self.uptime_pct = ok / total * 100.0;
        self.avg_response_ms =
            self.window.iter().map(|r| r.response_time_ms as f64).sum::<f64>() / total;
    }

    pub fn recent_errors(&self) -> &VecDeque<HealthError> {
        &self.errors
    }
}

/// Discovery filter; all present fields must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryQuery {
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub min_uptime_pct: Option<f64>,
    #[serde(default)]
    pub max_response_ms: Option<u64>,
    #[serde(default)]
    pub exclude: Vec<AgentId>,
}

pub struct AgentRegistry {
    store: Arc<dyn StateStore>,
    config: RegistryConfig,
    events: EventBus,
    agents: DashMap<AgentId, Agent>,
    health: DashMap<AgentId, AgentHealthRecord>,
    discovery_cache: Cache<String, Arc<Vec<Agent>>>,
    http: reqwest::Client,
}

impl AgentRegistry {
    pub fn new(store: Arc<dyn StateStore>, config: RegistryConfig, events: EventBus) -> Self {
        let discovery_cache = Cache::builder()
            .max_capacity(1_000)
            .time_to_live(Duration::from_secs(config.discovery_cache_ttl_secs))
            .build();
        Self {
            store,
            config,
            events,
            agents: DashMap::new(),
            health: DashMap::new(),
            discovery_cache,
            http: reqwest::Client::new(),
        }
    }

    fn validate(spec: &AgentSpec) -> Result<(), OrchestrationError> {
        if spec.name.trim().is_empty() {
            return Err(OrchestrationError::InvalidSpec("agent name is empty".into()));
        }
        if spec.agent_type.trim().is_empty() {
            return Err(OrchestrationError::InvalidSpec("agent type is empty".into()));
        }
        if spec.capabilities.is_empty() {
            return Err(OrchestrationError::InvalidSpec(
                "agent must advertise at least one capability".into(),
            ));
        }
        if let Some(cap) = spec.capabilities.iter().find(|c| c.max_concurrency < 1) {
            return Err(OrchestrationError::InvalidSpec(format!(
                "capability {} has max_concurrency < 1",
                cap.capability_type
            )));
        }
        if spec.endpoints.is_empty() {
            return Err(OrchestrationError::InvalidSpec(
                "agent must advertise at least one endpoint".into(),
            ));
        }
        if spec.endpoints.iter().any(|e| e.url.trim().is_empty()) {
            return Err(OrchestrationError::InvalidSpec("endpoint url is empty".into()));
        }
        Ok(())
    }

    pub async fn register(&self, spec: AgentSpec) -> Result<AgentId, OrchestrationError> {
        Self::validate(&spec)?;
        let agent = Agent::from_spec(spec);
        let id = agent.id.clone();

        self.persist(&agent).await?;
        self.agents.insert(id.clone(), agent);
        self.health.insert(id.clone(), AgentHealthRecord::default());
        self.discovery_cache.invalidate_all();

        info!(agent_id = %id, "agent registered");
        self.events.emit(SystemEvent::AgentRegistered {
            agent_id: id.clone(),
        });
        Ok(id)
    }

    pub async fn unregister(&self, id: &str) -> Result<Agent, OrchestrationError> {
        let Some((_, agent)) = self.agents.remove(id) else {
            return Err(OrchestrationError::NotFound(format!("agent {}", id)));
        };
        self.health.remove(id);
        self.store.delete(&keys::agent_registration(id)).await?;
        self.store.delete(&keys::agent_health(id)).await?;
        self.discovery_cache.invalidate_all();

        info!(agent_id = %id, "agent unregistered");
        self.events.emit(SystemEvent::AgentUnregistered {
            agent_id: id.to_string(),
        });
        Ok(agent)
    }

    /// Replace the registration, preserving `created` and runtime state.
    pub async fn update(&self, id: &str, spec: AgentSpec) -> Result<(), OrchestrationError> {
        Self::validate(&spec)?;
        let Some(mut entry) = self.agents.get_mut(id) else {
            return Err(OrchestrationError::NotFound(format!("agent {}", id)));
        };
        let agent = entry.value_mut();
        agent.name = spec.name;
        agent.agent_type = spec.agent_type;
        agent.capabilities = spec.capabilities;
        agent.endpoints = spec.endpoints;
        agent.tags = spec.tags;
        agent.region = spec.region;
        agent.metadata = spec.metadata;
        agent.updated = Utc::now();
        let snapshot = agent.clone();
        drop(entry);

        self.persist(&snapshot).await?;
        self.discovery_cache.invalidate_all();
        self.events.emit(SystemEvent::AgentUpdated {
            agent_id: id.to_string(),
        });
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Agent> {
        self.agents.get(id).map(|a| a.clone())
    }

    pub fn list(&self) -> Vec<Agent> {
        self.agents.iter().map(|a| a.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn health_of(&self, id: &str) -> Option<AgentHealthRecord> {
        self.health.get(id).map(|h| h.clone())
    }

    /// `0.7 * uptime + 0.3 * (1000 - response_time)`.
    pub fn health_score(&self, id: &str) -> f64 {
        match self.health.get(id) {
            Some(h) => 0.7 * h.uptime_pct + 0.3 * (1_000.0 - h.avg_response_ms),
            None => 0.0,
        }
    }

    /// Filtered, ranked discovery. Results come from the cache when the same
    /// query was served within the TTL.
    pub async fn discover(
        &self,
        query: &DiscoveryQuery,
    ) -> Result<Arc<Vec<Agent>>, OrchestrationError> {
        let cache_key = serde_json::to_string(query)?;
        if let Some(hit) = self.discovery_cache.get(&cache_key).await {
            debug!("discovery cache hit");
            return Ok(hit);
        }

        let mut matches: Vec<Agent> = self
            .agents
            .iter()
            .filter(|a| self.matches(a.value(), query))
            .map(|a| a.clone())
            .collect();

        matches.sort_by(|a, b| {
            let score_a = self.health_score(&a.id);
            let score_b = self.health_score(&b.id);
            score_b
                .partial_cmp(&score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.current_tasks.len().cmp(&b.current_tasks.len()))
                .then_with(|| a.performance.last_activity.cmp(&b.performance.last_activity))
        });

        let result = Arc::new(matches);
        self.discovery_cache
            .insert(cache_key, result.clone())
            .await;
        Ok(result)
    }

    fn matches(&self, agent: &Agent, query: &DiscoveryQuery) -> bool {
        if query.exclude.contains(&agent.id) {
            return false;
        }
        let caps = agent.capability_types();
        if !query.capabilities.iter().all(|c| caps.contains(c.as_str())) {
            return false;
        }
        if !query.tags.is_empty() && !query.tags.iter().any(|t| agent.tags.contains(t)) {
            return false;
        }
        if let Some(region) = &query.region {
            if agent.region.as_ref() != Some(region) {
                return false;
            }
        }
        if let Some(min_uptime) = query.min_uptime_pct {
            let uptime = self
                .health
                .get(&agent.id)
                .map(|h| h.uptime_pct)
                .unwrap_or(0.0);
            if uptime < min_uptime {
                return false;
            }
        }
        if let Some(max_rtt) = query.max_response_ms {
            let rtt = self
                .health
                .get(&agent.id)
                .map(|h| h.avg_response_ms)
                .unwrap_or(f64::MAX);
            if rtt > max_rtt as f64 {
                return false;
            }
        }
        true
    }

    /// Union of capability types over agents that could take more work.
    pub fn available_capabilities(&self, per_capability: bool) -> HashSet<String> {
        let mut caps = HashSet::new();
        for agent in self.agents.iter() {
            let available = match agent.status {
                AgentStatus::Idle => true,
                AgentStatus::Busy => agent.has_capacity(per_capability, &[]),
                _ => false,
            };
            if available {
                for c in &agent.capabilities {
                    caps.insert(c.capability_type.clone());
                }
            }
        }
        caps
    }

    // -- conductor-facing mutators ------------------------------------------

    pub async fn assign_task(&self, id: &str, task_id: &str) -> Result<(), OrchestrationError> {
        let Some(mut entry) = self.agents.get_mut(id) else {
            return Err(OrchestrationError::NotFound(format!("agent {}", id)));
        };
        let agent = entry.value_mut();
        agent.current_tasks.push(task_id.to_string());
        agent.status = AgentStatus::Busy;
        agent.performance.last_activity = Utc::now();
        agent.updated = Utc::now();
        let snapshot = agent.clone();
        drop(entry);

        self.persist(&snapshot).await?;
        self.discovery_cache.invalidate_all();
        Ok(())
    }

    /// Drop the task link and fold the outcome into the performance counters.
    pub async fn release_task(
        &self,
        id: &str,
        task_id: &str,
        success: bool,
        execution_ms: u64,
    ) -> Result<(), OrchestrationError> {
        let Some(mut entry) = self.agents.get_mut(id) else {
            // Agent may have unregistered while the task was in flight.
            return Ok(());
        };
        let agent = entry.value_mut();
        agent.current_tasks.retain(|t| t != task_id);
        if agent.current_tasks.is_empty() && agent.status == AgentStatus::Busy {
            agent.status = AgentStatus::Idle;
        }

        let perf = &mut agent.performance;
        let prior = perf.tasks_completed as f64;
        perf.avg_execution_ms =
            (perf.avg_execution_ms * prior + execution_ms as f64) / (prior + 1.0);
        perf.success_rate = (perf.success_rate * prior + if success { 1.0 } else { 0.0 })
            / (prior + 1.0);
        perf.tasks_completed += 1;
        perf.last_activity = Utc::now();
        agent.updated = Utc::now();
        let snapshot = agent.clone();
        drop(entry);

        self.persist(&snapshot).await?;
        self.discovery_cache.invalidate_all();
        Ok(())
    }

    /// Remove a task link without touching performance counters (used for
    /// cancellation, where the agent neither succeeded nor failed).
    pub async fn unlink_task(&self, id: &str, task_id: &str) -> Result<(), OrchestrationError> {
        let Some(mut entry) = self.agents.get_mut(id) else {
            return Ok(());
        };
        let agent = entry.value_mut();
        agent.current_tasks.retain(|t| t != task_id);
        if agent.current_tasks.is_empty() && agent.status == AgentStatus::Busy {
            agent.status = AgentStatus::Idle;
        }
        agent.updated = Utc::now();
        let snapshot = agent.clone();
        drop(entry);

        self.persist(&snapshot).await?;
        self.discovery_cache.invalidate_all();
        Ok(())
    }

    pub async fn set_status(
        &self,
        id: &str,
        status: AgentStatus,
    ) -> Result<(), OrchestrationError> {
        let Some(mut entry) = self.agents.get_mut(id) else {
            return Err(OrchestrationError::NotFound(format!("agent {}", id)));
        };
        entry.value_mut().status = status;
        entry.value_mut().updated = Utc::now();
        let snapshot = entry.clone();
        drop(entry);

        self.persist(&snapshot).await?;
        self.discovery_cache.invalidate_all();
        Ok(())
    }

    /// Tasks currently linked to an agent; used for reassignment on loss.
    pub fn tasks_of(&self, id: &str) -> Vec<TaskId> {
        self.agents
            .get(id)
            .map(|a| a.current_tasks.clone())
            .unwrap_or_default()
    }

    // -- health -------------------------------------------------------------

    /// Fold one probe result into the agent's rolling window. A transition
    /// into `unhealthy` takes the agent offline and announces the loss, so
    /// the scheduler reassigns its tasks; recovery returns it to rotation.
    pub async fn record_health_result(&self, id: &str, result: HealthCheckResult) {
        let Some(mut record) = self.health.get_mut(id) else {
            return;
        };
        let previous = record.state;
        record.push(result);

        let (cpu, memory) = self
            .agents
            .get(id)
            .map(|a| (a.health.cpu_usage, a.health.memory_usage))
            .unwrap_or((0.0, 0.0));
        record.degraded = cpu > 90.0
            || memory > 90.0
            || record.avg_response_ms > DEGRADED_RTT_MS as f64;
        let snapshot = record.clone();
        drop(record);

        if let Ok(json) = serde_json::to_string(&snapshot) {
            if let Err(e) = self
                .store
                .put(&keys::agent_health(id), &json, Some(HEALTH_TTL))
                .await
            {
                warn!(agent_id = %id, "failed to persist health record: {}", e);
            }
        }

        if previous != HealthState::Unhealthy && snapshot.state == HealthState::Unhealthy {
            if self.agents.contains_key(id) {
                if let Err(e) = self.set_status(id, AgentStatus::Offline).await {
                    warn!(agent_id = %id, "failed to mark unhealthy agent offline: {}", e);
                }
                warn!(agent_id = %id, "agent unhealthy, taken offline");
                self.events.emit(SystemEvent::AgentDisconnected {
                    agent_id: id.to_string(),
                });
            }
        } else if previous == HealthState::Unhealthy && snapshot.state == HealthState::Healthy {
            let was_offline = self
                .agents
                .get(id)
                .map(|a| a.status == AgentStatus::Offline)
                .unwrap_or(false);
            if was_offline {
                if let Err(e) = self.set_status(id, AgentStatus::Idle).await {
                    warn!(agent_id = %id, "failed to restore recovered agent: {}", e);
                } else {
                    info!(agent_id = %id, "agent recovered, back in rotation");
                }
            }
        }
    }

    /// Probe every agent once over its first HTTP endpoint. Agents without an
    /// HTTP endpoint are left to connection-level liveness reporting.
    pub async fn probe_all(&self) {
        let targets: Vec<(AgentId, String)> = self
            .agents
            .iter()
            .filter_map(|a| {
                a.endpoints
                    .iter()
                    .find(|e| e.url.starts_with("http://") || e.url.starts_with("https://"))
                    .map(|e| (a.id.clone(), e.url.clone()))
            })
            .collect();

        for (id, url) in targets {
            let started = std::time::Instant::now();
            let outcome = self
                .http
                .get(format!("{}/health", url.trim_end_matches('/')))
                .timeout(PROBE_TIMEOUT)
                .send()
                .await;
            let elapsed = started.elapsed().as_millis() as u64;
            let result = match outcome {
                Ok(resp) if resp.status().is_success() => HealthCheckResult {
                    success: true,
                    response_time_ms: elapsed,
                    checked_at: Utc::now(),
                    error: None,
                },
                Ok(resp) => HealthCheckResult {
                    success: false,
                    response_time_ms: elapsed,
                    checked_at: Utc::now(),
                    error: Some(format!("health endpoint returned {}", resp.status())),
                },
                Err(e) => HealthCheckResult {
                    success: false,
                    response_time_ms: elapsed,
                    checked_at: Utc::now(),
                    error: Some(e.to_string()),
                },
            };
            self.record_health_result(&id, result).await;
        }
    }

    /// Periodic probe loop; exits when the shutdown signal flips.
    pub async fn run_health_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(
            self.config.agent_health_check_interval_secs.max(1),
        ));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.probe_all().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("health loop stopped");
                        return;
                    }
                }
            }
        }
    }

    async fn persist(&self, agent: &Agent) -> Result<(), OrchestrationError> {
        let json = serde_json::to_string(agent)?;
        self.store
            .put(
                &keys::agent_registration(&agent.id),
                &json,
                Some(Duration::from_secs(self.config.registration_ttl_secs)),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentEndpoint, Capability, ResourceRequirements};
    use state_store::MemoryStore;
    use std::collections::HashMap;

    fn registry() -> AgentRegistry {
        AgentRegistry::new(
            Arc::new(MemoryStore::new()),
            RegistryConfig::default(),
            EventBus::new(),
        )
    }

    fn spec(name: &str, caps: &[&str]) -> AgentSpec {
        AgentSpec {
            name: name.into(),
            agent_type: "worker".into(),
            capabilities: caps
                .iter()
                .map(|c| Capability {
                    capability_type: (*c).into(),
                    priority: 0,
                    max_concurrency: 2,
                    estimated_execution_ms: 100,
                    dependencies: vec![],
                    resources: ResourceRequirements::default(),
                })
                .collect(),
            endpoints: vec![AgentEndpoint {
                url: "ws://localhost:9000".into(),
            }],
            tags: vec!["general".into()],
            region: Some("us-east".into()),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let r = registry();
        let id = r.register(spec("a1", &["compute"])).await.unwrap();
        let agent = r.get(&id).unwrap();
        assert_eq!(agent.name, "a1");
        assert_eq!(agent.status, AgentStatus::Idle);
        assert_eq!(r.health_of(&id).unwrap().state, HealthState::Unknown);
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_specs() {
        let r = registry();

        let mut no_name = spec("x", &["compute"]);
        no_name.name = "".into();
        assert!(matches!(
            r.register(no_name).await.unwrap_err(),
            OrchestrationError::InvalidSpec(_)
        ));

        let mut no_caps = spec("x", &["compute"]);
        no_caps.capabilities.clear();
        assert!(r.register(no_caps).await.is_err());

        let mut zero_conc = spec("x", &["compute"]);
        zero_conc.capabilities[0].max_concurrency = 0;
        assert!(r.register(zero_conc).await.is_err());

        let mut no_endpoint = spec("x", &["compute"]);
        no_endpoint.endpoints.clear();
        assert!(r.register(no_endpoint).await.is_err());
    }

    #[tokio::test]
    async fn test_unregister_unknown_is_not_found() {
        let r = registry();
        assert!(matches!(
            r.unregister("ghost").await.unwrap_err(),
            OrchestrationError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_discover_filters_capabilities_and_exclusions() {
        let r = registry();
        let gpu = r.register(spec("gpu-agent", &["gpu", "compute"])).await.unwrap();
        let cpu = r.register(spec("cpu-agent", &["compute"])).await.unwrap();

        let query = DiscoveryQuery {
            capabilities: vec!["gpu".into()],
            ..Default::default()
        };
        let found = r.discover(&query).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, gpu);

        let query = DiscoveryQuery {
            capabilities: vec!["compute".into()],
            exclude: vec![gpu.clone()],
            ..Default::default()
        };
        let found = r.discover(&query).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, cpu);
    }

    #[tokio::test]
    async fn test_discover_cache_flushed_on_mutation() {
        let r = registry();
        r.register(spec("a1", &["compute"])).await.unwrap();

        let query = DiscoveryQuery::default();
        assert_eq!(r.discover(&query).await.unwrap().len(), 1);

        r.register(spec("a2", &["compute"])).await.unwrap();
        // Second register invalidated the cached result.
        assert_eq!(r.discover(&query).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_health_window_derivation() {
        let r = registry();
        let id = r.register(spec("a1", &["compute"])).await.unwrap();

        let ok = |ms| HealthCheckResult {
            success: true,
            response_time_ms: ms,
            checked_at: Utc::now(),
            error: None,
        };
        let fail = || HealthCheckResult {
            success: false,
            response_time_ms: 10,
            checked_at: Utc::now(),
            error: Some("connection refused".into()),
        };

        r.record_health_result(&id, ok(20)).await;
        r.record_health_result(&id, ok(30)).await;
        assert_eq!(r.health_of(&id).unwrap().state, HealthState::Healthy);

        r.record_health_result(&id, fail()).await;
        r.record_health_result(&id, fail()).await;
        // Last three: ok, fail, fail -> unhealthy.
        assert_eq!(r.health_of(&id).unwrap().state, HealthState::Unhealthy);

        let record = r.health_of(&id).unwrap();
        assert_eq!(record.recent_errors().len(), 2);
        assert!((record.uptime_pct - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unhealthy_transition_takes_agent_offline() {
        let events = EventBus::new();
        let r = AgentRegistry::new(
            Arc::new(MemoryStore::new()),
            RegistryConfig::default(),
            events.clone(),
        );
        let mut rx = events.subscribe();
        let id = r.register(spec("a1", &["compute"])).await.unwrap();

        r.record_health_result(
            &id,
            HealthCheckResult {
                success: false,
                response_time_ms: 10,
                checked_at: Utc::now(),
                error: Some("connection refused".into()),
            },
        )
        .await;

        assert_eq!(r.health_of(&id).unwrap().state, HealthState::Unhealthy);
        assert_eq!(r.get(&id).unwrap().status, AgentStatus::Offline);

        let mut saw_disconnect = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SystemEvent::AgentDisconnected { ref agent_id } if agent_id == &id)
            {
                saw_disconnect = true;
            }
        }
        assert!(saw_disconnect);

        // Two successful probes make the window healthy again (2 of last 3)
        // and restore the agent to scheduling rotation.
        for _ in 0..2 {
            r.record_health_result(
                &id,
                HealthCheckResult {
                    success: true,
                    response_time_ms: 10,
                    checked_at: Utc::now(),
                    error: None,
                },
            )
            .await;
        }
        assert_eq!(r.health_of(&id).unwrap().state, HealthState::Healthy);
        assert_eq!(r.get(&id).unwrap().status, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn test_degraded_on_slow_probes() {
        let r = registry();
        let id = r.register(spec("a1", &["compute"])).await.unwrap();
        r.record_health_result(
            &id,
            HealthCheckResult {
                success: true,
                response_time_ms: 6_000,
                checked_at: Utc::now(),
                error: None,
            },
        )
        .await;
        assert!(r.health_of(&id).unwrap().degraded);
    }

    #[tokio::test]
    async fn test_release_task_updates_performance() {
        let r = registry();
        let id = r.register(spec("a1", &["compute"])).await.unwrap();
        r.assign_task(&id, "t1").await.unwrap();
        assert_eq!(r.get(&id).unwrap().status, AgentStatus::Busy);

        r.release_task(&id, "t1", true, 200).await.unwrap();
        let agent = r.get(&id).unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert!(agent.current_tasks.is_empty());
        assert_eq!(agent.performance.tasks_completed, 1);
        assert!((agent.performance.avg_execution_ms - 200.0).abs() < 1e-9);
        assert!((agent.performance.success_rate - 1.0).abs() < 1e-9);

        r.assign_task(&id, "t2").await.unwrap();
        r.release_task(&id, "t2", false, 100).await.unwrap();
        let agent = r.get(&id).unwrap();
        assert!((agent.performance.success_rate - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_available_capabilities_skips_saturated_agents() {
        let r = registry();
        let id = r.register(spec("a1", &["compute"])).await.unwrap();
        // Primary capability allows 2 concurrent tasks.
        r.assign_task(&id, "t1").await.unwrap();
        assert!(r.available_capabilities(false).contains("compute"));
        r.assign_task(&id, "t2").await.unwrap();
        assert!(r.available_capabilities(false).is_empty());
    }
}
