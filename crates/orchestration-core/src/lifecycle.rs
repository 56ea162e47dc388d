//! Lifecycle manager: templates, deployments, rollouts, auto-scaling.
//!
//! Deployments are sets of agent instances stamped from a template. Update
//! strategies (rolling, recreate, blue-green, canary) drive instances from
//! one template revision to the next; an auto-scaler loop adjusts replica
//! counts against reported utilization with cooldown, keeping a ring of the
//! last hundred scaling events per deployment.

use crate::config::AutoScalingConfig;
use crate::events::{EventBus, SystemEvent};
use crate::types::{
    AgentInstance, AgentTemplate, BatchSize, CanaryStep, Deployment, DeploymentStatus,
    HealthProbe, InstanceHealth, InstanceStatus, ProbeKind, UpdateStrategy,
};
use crate::OrchestrationError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use state_store::{keys, StateStore};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SCALING_EVENT_RING: usize = 100;
const BATCH_HEALTHY_TIMEOUT: Duration = Duration::from_secs(300);
const RECREATE_STOP_TIMEOUT: Duration = Duration::from_secs(60);
const WAIT_POLL: Duration = Duration::from_millis(100);
const AUTOSCALE_INTERVAL: Duration = Duration::from_secs(60);

/// Optional canary analysis hook; a missing hook passes every step.
#[async_trait]
pub trait AnalysisHook: Send + Sync + 'static {
    async fn analyze(&self, deployment_id: &str, step: &CanaryStep) -> bool;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingEvent {
    pub at: DateTime<Utc>,
    pub from: u32,
    pub to: u32,
    pub reason: String,
}

pub struct LifecycleManager {
    store: Arc<dyn StateStore>,
    events: EventBus,
    auto_scaling: AutoScalingConfig,
    templates: DashMap<String, AgentTemplate>,
    deployments: DashMap<String, Deployment>,
    instances: DashMap<String, AgentInstance>,
    scaling_events: DashMap<String, VecDeque<ScalingEvent>>,
    last_scaled: DashMap<String, DateTime<Utc>>,
    /// Reported utilization percentage per deployment, fed by the optimizer.
    utilization: DashMap<String, f64>,
    probe_failures: DashMap<String, u32>,
    analysis: Option<Arc<dyn AnalysisHook>>,
    http: reqwest::Client,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<dyn StateStore>,
        auto_scaling: AutoScalingConfig,
        events: EventBus,
    ) -> Arc<Self> {
        Self::build(store, auto_scaling, events, None)
    }

    pub fn with_analysis_hook(
        store: Arc<dyn StateStore>,
        auto_scaling: AutoScalingConfig,
        events: EventBus,
        hook: Arc<dyn AnalysisHook>,
    ) -> Arc<Self> {
        Self::build(store, auto_scaling, events, Some(hook))
    }

    fn build(
        store: Arc<dyn StateStore>,
        auto_scaling: AutoScalingConfig,
        events: EventBus,
        analysis: Option<Arc<dyn AnalysisHook>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            events,
            auto_scaling,
            templates: DashMap::new(),
            deployments: DashMap::new(),
            instances: DashMap::new(),
            scaling_events: DashMap::new(),
            last_scaled: DashMap::new(),
            utilization: DashMap::new(),
            probe_failures: DashMap::new(),
            analysis,
            http: reqwest::Client::new(),
        })
    }

    // -- templates ----------------------------------------------------------

    pub async fn register_template(
        &self,
        mut template: AgentTemplate,
    ) -> Result<String, OrchestrationError> {
        if template.name.trim().is_empty() {
            return Err(OrchestrationError::InvalidSpec(
                "template name is empty".into(),
            ));
        }
        if template.image.trim().is_empty() {
            return Err(OrchestrationError::InvalidSpec(
                "template image is empty".into(),
            ));
        }
        if let Some(scaling) = &template.scaling {
            if scaling.min_replicas > scaling.max_replicas {
                return Err(OrchestrationError::InvalidSpec(
                    "scaling min_replicas exceeds max_replicas".into(),
                ));
            }
        }
        if template.id.is_empty() {
            template.id = Uuid::new_v4().to_string();
        }

        let json = serde_json::to_string(&template)?;
        self.store
            .put(&keys::template(&template.id), &json, None)
            .await?;
        let id = template.id.clone();
        self.templates.insert(id.clone(), template);
        Ok(id)
    }

    pub fn template(&self, id: &str) -> Option<AgentTemplate> {
        self.templates.get(id).map(|t| t.clone())
    }

    // -- deployments --------------------------------------------------------

    pub async fn create_deployment(
        &self,
        template_id: &str,
        replicas: u32,
        env_overrides: HashMap<String, String>,
    ) -> Result<Deployment, OrchestrationError> {
        let Some(template) = self.template(template_id) else {
            return Err(OrchestrationError::NotFound(format!(
                "template {}",
                template_id
            )));
        };
        if replicas == 0 {
            return Err(OrchestrationError::InvalidSpec(
                "deployment needs at least one replica".into(),
            ));
        }

        let now = Utc::now();
        let deployment = Deployment {
            id: Uuid::new_v4().to_string(),
            template_id: template_id.to_string(),
            replicas,
            env_overrides,
            status: DeploymentStatus::Running,
            created: now,
            updated: now,
        };

        for _ in 0..replicas {
            self.start_instance(&deployment.id, 1, &template);
        }

        self.persist_deployment(&deployment).await?;
        self.deployments
            .insert(deployment.id.clone(), deployment.clone());
        info!(deployment_id = %deployment.id, replicas, "deployment created");
        self.events.emit(SystemEvent::DeploymentCreated {
            deployment_id: deployment.id.clone(),
        });
        Ok(deployment)
    }

    pub fn deployment(&self, id: &str) -> Option<Deployment> {
        self.deployments.get(id).map(|d| d.clone())
    }

    pub fn deployments(&self) -> Vec<Deployment> {
        self.deployments.iter().map(|d| d.clone()).collect()
    }

    pub fn instances_of(&self, deployment_id: &str) -> Vec<AgentInstance> {
        self.instances
            .iter()
            .filter(|i| i.deployment_id == deployment_id)
            .map(|i| i.clone())
            .collect()
    }

    pub async fn remove_deployment(&self, id: &str) -> Result<(), OrchestrationError> {
        let Some(mut deployment) = self.deployments.get_mut(id) else {
            return Err(OrchestrationError::NotFound(format!("deployment {}", id)));
        };
        deployment.status = DeploymentStatus::Removed;
        deployment.updated = Utc::now();
        let snapshot = deployment.clone();
        drop(deployment);

        for instance in self.instances_of(id) {
            self.stop_instance(&instance.id);
        }
        self.instances.retain(|_, i| i.deployment_id != id);
        self.persist_deployment(&snapshot).await?;
        self.deployments.remove(id);
        self.store.delete(&keys::deployment(id)).await?;

        info!(deployment_id = %id, "deployment removed");
        self.events.emit(SystemEvent::DeploymentRemoved {
            deployment_id: id.to_string(),
        });
        Ok(())
    }

    // -- scaling ------------------------------------------------------------

    pub async fn scale(
        &self,
        deployment_id: &str,
        replicas: u32,
        reason: &str,
    ) -> Result<(), OrchestrationError> {
        let (from, template) = {
            let Some(deployment) = self.deployments.get(deployment_id) else {
                return Err(OrchestrationError::NotFound(format!(
                    "deployment {}",
                    deployment_id
                )));
            };
            let Some(template) = self.template(&deployment.template_id) else {
                return Err(OrchestrationError::NotFound(format!(
                    "template {}",
                    deployment.template_id
                )));
            };
            (deployment.replicas, template)
        };
        if replicas == 0 {
            return Err(OrchestrationError::InvalidSpec(
                "cannot scale to zero replicas".into(),
            ));
        }
        if from == replicas {
            return Ok(());
        }

        let revision = self.current_revision(deployment_id);
        if replicas > from {
            for _ in from..replicas {
                self.start_instance(deployment_id, revision, &template);
            }
        } else {
            let excess: Vec<String> = self
                .instances_of(deployment_id)
                .into_iter()
                .rev()
                .take((from - replicas) as usize)
                .map(|i| i.id)
                .collect();
            for id in excess {
                self.stop_instance(&id);
                self.instances.remove(&id);
            }
        }

        if let Some(mut deployment) = self.deployments.get_mut(deployment_id) {
            deployment.replicas = replicas;
            deployment.updated = Utc::now();
            let snapshot = deployment.clone();
            drop(deployment);
            self.persist_deployment(&snapshot).await?;
        }

        self.record_scaling_event(deployment_id, from, replicas, reason);
        self.last_scaled
            .insert(deployment_id.to_string(), Utc::now());
        info!(deployment_id, from, to = replicas, reason, "deployment scaled");
        self.events.emit(SystemEvent::DeploymentScaled {
            deployment_id: deployment_id.to_string(),
            from,
            to: replicas,
        });
        Ok(())
    }

    pub fn scaling_history(&self, deployment_id: &str) -> Vec<ScalingEvent> {
        self.scaling_events
            .get(deployment_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn record_scaling_event(&self, deployment_id: &str, from: u32, to: u32, reason: &str) {
        let mut ring = self
            .scaling_events
            .entry(deployment_id.to_string())
            .or_default();
        if ring.len() >= SCALING_EVENT_RING {
            ring.pop_front();
        }
        ring.push_back(ScalingEvent {
            at: Utc::now(),
            from,
            to,
            reason: reason.to_string(),
        });
    }

    /// Feed the utilization gauge the auto-scaler evaluates.
    pub fn report_utilization(&self, deployment_id: &str, utilization_pct: f64) {
        self.utilization
            .insert(deployment_id.to_string(), utilization_pct);
    }

    /// One auto-scaler pass over every deployment with a scaling policy.
    pub async fn autoscale_tick(&self) {
        if !self.auto_scaling.enabled {
            return;
        }
        let deployments: Vec<Deployment> = self.deployments();
        for deployment in deployments {
            let Some(template) = self.template(&deployment.template_id) else {
                continue;
            };
            let Some(policy) = template.scaling else {
                continue;
            };
            let Some(utilization) = self
                .utilization
                .get(&deployment.id)
                .map(|u| *u)
            else {
                continue;
            };

            // Cooldown gate against flapping.
            if let Some(last) = self.last_scaled.get(&deployment.id) {
                let elapsed = Utc::now().signed_duration_since(*last);
                if elapsed.num_seconds() < policy.cooldown_secs as i64 {
                    continue;
                }
            }

            let current = deployment.replicas;
            let target = if utilization > policy.scale_up_threshold
                && current < policy.max_replicas
            {
                Some(current + 1)
            } else if utilization < policy.scale_down_threshold && current > policy.min_replicas
            {
                Some(current - 1)
            } else {
                None
            };

            if let Some(target) = target {
                let reason = format!("utilization {:.1}%", utilization);
                if let Err(e) = self.scale(&deployment.id, target, &reason).await {
                    warn!(deployment_id = %deployment.id, "autoscale failed: {}", e);
                }
            }
        }
    }

    // -- updates ------------------------------------------------------------

    /// Roll a deployment to its template's current definition using the
    /// template's update strategy.
    pub async fn update_deployment(&self, deployment_id: &str) -> Result<(), OrchestrationError> {
        let (deployment, template) = {
            let Some(deployment) = self.deployments.get(deployment_id) else {
                return Err(OrchestrationError::NotFound(format!(
                    "deployment {}",
                    deployment_id
                )));
            };
            let Some(template) = self.template(&deployment.template_id) else {
                return Err(OrchestrationError::NotFound(format!(
                    "template {}",
                    deployment.template_id
                )));
            };
            (deployment.clone(), template)
        };

        self.set_deployment_status(deployment_id, DeploymentStatus::Updating)
            .await?;
        let next_revision = self.current_revision(deployment_id) + 1;

        let result = match template.update_strategy.clone() {
            UpdateStrategy::Rolling { max_unavailable } => {
                self.rolling_update(&deployment, &template, next_revision, &max_unavailable)
                    .await
            }
            UpdateStrategy::Recreate => {
                self.recreate_update(&deployment, &template, next_revision)
                    .await
            }
            UpdateStrategy::BlueGreen => {
                self.blue_green_update(&deployment, &template, next_revision)
                    .await
            }
            UpdateStrategy::Canary { steps } => {
                self.canary_update(&deployment, &template, next_revision, &steps)
                    .await
            }
        };

        match result {
            Ok(()) => {
                self.set_deployment_status(deployment_id, DeploymentStatus::Running)
                    .await?;
                self.events.emit(SystemEvent::DeploymentUpdated {
                    deployment_id: deployment_id.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                self.set_deployment_status(deployment_id, DeploymentStatus::Failed)
                    .await?;
                Err(e)
            }
        }
    }

    /// Update in batches of `max_unavailable`, waiting for each batch to be
    /// running and healthy before the next.
    async fn rolling_update(
        &self,
        deployment: &Deployment,
        template: &AgentTemplate,
        revision: u64,
        max_unavailable: &BatchSize,
    ) -> Result<(), OrchestrationError> {
        let batch_size = max_unavailable.resolve(deployment.replicas) as usize;
        let old: Vec<AgentInstance> = self
            .instances_of(&deployment.id)
            .into_iter()
            .filter(|i| i.template_revision < revision)
            .collect();

        for batch in old.chunks(batch_size) {
            let mut fresh = Vec::new();
            for instance in batch {
                self.stop_instance(&instance.id);
                self.instances.remove(&instance.id);
                fresh.push(self.start_instance(&deployment.id, revision, template));
            }
            self.wait_for_instances(&fresh, BATCH_HEALTHY_TIMEOUT, |i| {
                i.status == InstanceStatus::Running && i.health != InstanceHealth::Unhealthy
            })
            .await?;
        }
        Ok(())
    }

    /// Stop everything, wait for full stop, start the new revision.
    async fn recreate_update(
        &self,
        deployment: &Deployment,
        template: &AgentTemplate,
        revision: u64,
    ) -> Result<(), OrchestrationError> {
        let old: Vec<String> = self
            .instances_of(&deployment.id)
            .into_iter()
            .map(|i| i.id)
            .collect();
        for id in &old {
            self.stop_instance(id);
        }
        self.wait_for_instances(&old, RECREATE_STOP_TIMEOUT, |i| {
            i.status == InstanceStatus::Stopped
        })
        .await?;
        for id in &old {
            self.instances.remove(id);
        }

        for _ in 0..deployment.replicas {
            self.start_instance(&deployment.id, revision, template);
        }
        Ok(())
    }

    /// Provision a parallel set, wait ready, then retire the old set.
    async fn blue_green_update(
        &self,
        deployment: &Deployment,
        template: &AgentTemplate,
        revision: u64,
    ) -> Result<(), OrchestrationError> {
        let old: Vec<String> = self
            .instances_of(&deployment.id)
            .into_iter()
            .map(|i| i.id)
            .collect();

        let mut green = Vec::new();
        for _ in 0..deployment.replicas {
            green.push(self.start_instance(&deployment.id, revision, template));
        }
        self.wait_for_instances(&green, BATCH_HEALTHY_TIMEOUT, |i| {
            i.status == InstanceStatus::Running
        })
        .await?;

        // Traffic pointer switch is the revision bump; old set retires after.
        for id in &old {
            self.stop_instance(id);
            self.instances.remove(id);
        }
        debug!(deployment_id = %deployment.id, revision, "blue-green switch complete");
        Ok(())
    }

    /// Weighted canary steps with optional pause and analysis; abort stops
    /// all canaries.
    async fn canary_update(
        &self,
        deployment: &Deployment,
        template: &AgentTemplate,
        revision: u64,
        steps: &[CanaryStep],
    ) -> Result<(), OrchestrationError> {
        let mut canaries: Vec<String> = Vec::new();

        for step in steps {
            let desired =
                ((deployment.replicas as f64 * step.weight as f64) / 100.0).ceil() as usize;
            while canaries.len() < desired {
                canaries.push(self.start_instance(&deployment.id, revision, template));
            }
            self.wait_for_instances(&canaries, BATCH_HEALTHY_TIMEOUT, |i| {
                i.status == InstanceStatus::Running
            })
            .await?;

            if let Some(pause) = step.pause_secs {
                tokio::time::sleep(Duration::from_secs(pause)).await;
            }

            if step.analysis.is_some() {
                let passed = match &self.analysis {
                    Some(hook) => hook.analyze(&deployment.id, step).await,
                    None => true,
                };
                if !passed {
                    warn!(deployment_id = %deployment.id, "canary analysis failed, aborting");
                    for id in &canaries {
                        self.stop_instance(id);
                        self.instances.remove(id);
                    }
                    return Err(OrchestrationError::InvalidSpec(
                        "canary analysis rejected the rollout".into(),
                    ));
                }
            }
        }

        // All steps passed: update the remaining old instances in place and
        // trim canaries beyond the replica count.
        let old: Vec<String> = self
            .instances_of(&deployment.id)
            .into_iter()
            .filter(|i| i.template_revision < revision)
            .map(|i| i.id)
            .collect();
        for id in old {
            self.stop_instance(&id);
            self.instances.remove(&id);
            self.start_instance(&deployment.id, revision, template);
        }
        let mut all = self.instances_of(&deployment.id);
        while all.len() > deployment.replicas as usize {
            let instance = all.pop().expect("length checked");
            self.stop_instance(&instance.id);
            self.instances.remove(&instance.id);
        }
        Ok(())
    }

    // -- instances ----------------------------------------------------------

    fn start_instance(
        &self,
        deployment_id: &str,
        revision: u64,
        template: &AgentTemplate,
    ) -> String {
        let instance = AgentInstance {
            id: Uuid::new_v4().to_string(),
            deployment_id: deployment_id.to_string(),
            template_revision: revision,
            status: InstanceStatus::Running,
            health: InstanceHealth::Unknown,
            node: None,
            ports: HashMap::new(),
            started_at: Some(Utc::now()),
            restarts: 0,
        };
        debug!(instance_id = %instance.id, image = %template.image, "instance started");
        let id = instance.id.clone();
        self.instances.insert(id.clone(), instance);
        id
    }

    fn stop_instance(&self, instance_id: &str) {
        if let Some(mut instance) = self.instances.get_mut(instance_id) {
            instance.status = InstanceStatus::Stopped;
        }
        self.probe_failures.remove(instance_id);
    }

    pub async fn restart_instance(&self, instance_id: &str) -> Result<(), OrchestrationError> {
        let Some(mut instance) = self.instances.get_mut(instance_id) else {
            return Err(OrchestrationError::NotFound(format!(
                "instance {}",
                instance_id
            )));
        };
        instance.restarts += 1;
        instance.status = InstanceStatus::Running;
        instance.health = InstanceHealth::Unknown;
        instance.started_at = Some(Utc::now());
        info!(instance_id, restarts = instance.restarts, "instance restarted");
        Ok(())
    }

    async fn wait_for_instances<F>(
        &self,
        ids: &[String],
        timeout: Duration,
        predicate: F,
    ) -> Result<(), OrchestrationError>
    where
        F: Fn(&AgentInstance) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let all_ready = ids.iter().all(|id| {
                self.instances
                    .get(id)
                    .map(|i| predicate(&i))
                    .unwrap_or(false)
            });
            if all_ready {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(OrchestrationError::Timeout(timeout.as_millis() as u64));
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    // -- health probes ------------------------------------------------------

    /// Probe every running instance whose template defines a probe. The
    /// failure threshold counts consecutive failures.
    pub async fn probe_instances(&self) {
        let targets: Vec<(String, String, HealthProbe)> = self
            .instances
            .iter()
            .filter(|i| i.status == InstanceStatus::Running)
            .filter_map(|i| {
                let deployment = self.deployments.get(&i.deployment_id)?;
                let template = self.templates.get(&deployment.template_id)?;
                template
                    .health_probe
                    .clone()
                    .map(|probe| (i.id.clone(), i.deployment_id.clone(), probe))
            })
            .collect();

        for (instance_id, deployment_id, probe) in targets {
            if let Some(started) = self.instances.get(&instance_id).and_then(|i| i.started_at) {
                let age = Utc::now().signed_duration_since(started);
                if age.num_seconds() < probe.initial_delay_secs as i64 {
                    continue;
                }
            }

            let healthy = self.run_probe(&probe).await;
            if healthy {
                self.probe_failures.remove(&instance_id);
                if let Some(mut instance) = self.instances.get_mut(&instance_id) {
                    instance.health = InstanceHealth::Healthy;
                }
                continue;
            }

            let failures = {
                let mut failures = self.probe_failures.entry(instance_id.clone()).or_insert(0);
                *failures += 1;
                *failures
            };
            if failures >= probe.failure_threshold {
                if let Some(mut instance) = self.instances.get_mut(&instance_id) {
                    instance.health = InstanceHealth::Unhealthy;
                }
                warn!(instance_id = %instance_id, failures, "instance unhealthy");
                self.events.emit(SystemEvent::InstanceUnhealthy {
                    deployment_id,
                    instance_id,
                });
            }
        }
    }

    async fn run_probe(&self, probe: &HealthProbe) -> bool {
        let timeout = Duration::from_secs(probe.timeout_secs.max(1));
        match &probe.kind {
            ProbeKind::Http { path, port } => {
                let url = format!("http://127.0.0.1:{}{}", port, path);
                matches!(
                    self.http.get(&url).timeout(timeout).send().await,
                    Ok(resp) if resp.status().is_success()
                )
            }
            ProbeKind::Tcp { port } => tokio::time::timeout(
                timeout,
                tokio::net::TcpStream::connect(("127.0.0.1", *port)),
            )
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false),
            ProbeKind::Exec { command } => {
                let result = tokio::time::timeout(
                    timeout,
                    tokio::process::Command::new("sh").arg("-c").arg(command).status(),
                )
                .await;
                matches!(result, Ok(Ok(status)) if status.success())
            }
        }
    }

    fn current_revision(&self, deployment_id: &str) -> u64 {
        self.instances_of(deployment_id)
            .iter()
            .map(|i| i.template_revision)
            .max()
            .unwrap_or(1)
    }

    async fn set_deployment_status(
        &self,
        id: &str,
        status: DeploymentStatus,
    ) -> Result<(), OrchestrationError> {
        if let Some(mut deployment) = self.deployments.get_mut(id) {
            deployment.status = status;
            deployment.updated = Utc::now();
            let snapshot = deployment.clone();
            drop(deployment);
            self.persist_deployment(&snapshot).await?;
        }
        Ok(())
    }

    async fn persist_deployment(&self, deployment: &Deployment) -> Result<(), OrchestrationError> {
        let json = serde_json::to_string(deployment)?;
        self.store
            .put(&keys::deployment(&deployment.id), &json, None)
            .await?;
        Ok(())
    }

    /// Auto-scaler and probe loop.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut scaler = tokio::time::interval(AUTOSCALE_INTERVAL);
        scaler.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = scaler.tick() => {
                    self.probe_instances().await;
                    self.autoscale_tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("lifecycle loop stopped");
                        return;
                    }
                }
            }
        }
    }
}
