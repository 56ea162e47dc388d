//! Orchestrator facade: wiring, lifecycle of the periodic loops, and the
//! transport-neutral control API.

use crate::conductor::{AgentInvoker, Conductor, RouterInvoker};
use crate::config::OrchestratorConfig;
use crate::events::{EventBus, SystemEvent};
use crate::execution::{ExecutionEngine, PlanOutcome, PlanStatus};
use crate::lifecycle::LifecycleManager;
use crate::metrics::EngineMetrics;
use crate::optimizer::{PerformanceOptimizer, PerformanceReport};
use crate::queue::{LaneDepths, TaskQueue};
use crate::registry::{AgentRegistry, DiscoveryQuery};
use crate::resources::ResourceMonitor;
use crate::router::MessageRouter;
use crate::types::{
    Agent, AgentId, AgentSpec, AgentStatus, ExecutionPlan, Task, TaskId, TaskSpec, Workflow,
};
use crate::worker_pool::{TaskHandler, WorkerPool};
use crate::OrchestrationError;
use chrono::Duration as ChronoDuration;
use serde::Serialize;
use state_store::StateStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
const METRICS_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Aggregated point-in-time view served by `getSystemMetrics`.
#[derive(Debug, Clone, Serialize)]
pub struct SystemMetricsReport {
    pub agents: HashMap<String, u64>,
    pub queue: LaneDepths,
    pub inflight_tasks: usize,
    pub active_connections: usize,
    pub deployments: usize,
    pub uptime_secs: u64,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    events: EventBus,
    queue: Arc<TaskQueue>,
    registry: Arc<AgentRegistry>,
    router: Arc<MessageRouter>,
    conductor: Arc<Conductor>,
    engine: Arc<ExecutionEngine>,
    lifecycle: Arc<LifecycleManager>,
    optimizer: Arc<PerformanceOptimizer>,
    metrics: Arc<EngineMetrics>,
    shutdown: watch::Sender<bool>,
    accepting: AtomicBool,
    started_at: Instant,
}

impl Orchestrator {
    /// Wire the full engine over a store. Remote agents are reached through
    /// the router; plan tasks run on the in-process worker pool driven by
    /// `handler`.
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn StateStore>,
        handler: Arc<dyn TaskHandler>,
    ) -> Arc<Self> {
        Self::build(config, store, handler, None)
    }

    /// Same wiring with a custom invoker; tests substitute scripted agents.
    pub fn with_invoker(
        config: OrchestratorConfig,
        store: Arc<dyn StateStore>,
        handler: Arc<dyn TaskHandler>,
        invoker: Arc<dyn AgentInvoker>,
    ) -> Arc<Self> {
        Self::build(config, store, handler, Some(invoker))
    }

    fn build(
        config: OrchestratorConfig,
        store: Arc<dyn StateStore>,
        handler: Arc<dyn TaskHandler>,
        invoker: Option<Arc<dyn AgentInvoker>>,
    ) -> Arc<Self> {
        let events = EventBus::new();
        let queue = Arc::new(TaskQueue::new(
            store.clone(),
            config.queue.clone(),
            events.clone(),
        ));
        let registry = Arc::new(AgentRegistry::new(
            store.clone(),
            config.registry.clone(),
            events.clone(),
        ));
        let router = MessageRouter::new(
            config.message.clone(),
            config.websocket.clone(),
            store.clone(),
            events.clone(),
        );
        let invoker = invoker.unwrap_or_else(|| RouterInvoker::new(router.clone()));
        let conductor = Conductor::new(
            queue.clone(),
            registry.clone(),
            invoker,
            store.clone(),
            config.scheduler.clone(),
            events.clone(),
        );
        let pool = WorkerPool::new(config.worker_pool.size, handler);
        let resources = ResourceMonitor::new(config.resources.clone(), events.clone());
        let engine = ExecutionEngine::new(pool, resources, events.clone());
        let lifecycle = LifecycleManager::new(
            store.clone(),
            config.auto_scaling.clone(),
            events.clone(),
        );
        let optimizer = PerformanceOptimizer::new(
            store,
            registry.clone(),
            queue.clone(),
            lifecycle.clone(),
            conductor.clone(),
            events.clone(),
        );

        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            events,
            queue,
            registry,
            router,
            conductor,
            engine,
            lifecycle,
            optimizer,
            metrics: Arc::new(EngineMetrics::new()),
            shutdown,
            accepting: AtomicBool::new(true),
            started_at: Instant::now(),
        })
    }

    /// Spawn every periodic loop. Idempotent callers should invoke once.
    pub fn start(self: &Arc<Self>) {
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(self.conductor.clone().run(shutdown.clone()));
        tokio::spawn(self.registry.clone().run_health_loop(shutdown.clone()));
        tokio::spawn(self.router.clone().run(shutdown.clone()));
        tokio::spawn(self.lifecycle.clone().run(shutdown.clone()));
        tokio::spawn(self.optimizer.clone().run(shutdown.clone()));
        tokio::spawn(self.clone().observe_events(shutdown.clone()));
        tokio::spawn(self.clone().sample_gauges(shutdown));

        info!("orchestration engine started");
        self.events.emit(SystemEvent::Initialized);
    }

    /// Stop admission, wait up to the grace period for in-flight work, then
    /// stop every loop.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        info!("shutdown requested, draining in-flight work");

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while self.conductor.inflight_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let leftover = self.conductor.inflight_count();
        if leftover > 0 {
            warn!(leftover, "shutdown grace period expired with tasks in flight");
        }

        let _ = self.shutdown.send(true);
        self.events.emit(SystemEvent::Shutdown);
        info!("orchestration engine stopped");
    }

    fn ensure_accepting(&self) -> Result<(), OrchestrationError> {
        if self.accepting.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(OrchestrationError::InvalidSpec(
                "engine is shutting down".into(),
            ))
        }
    }

    // -- control API --------------------------------------------------------

    pub async fn register_agent(&self, spec: AgentSpec) -> Result<AgentId, OrchestrationError> {
        self.ensure_accepting()?;
        let urls: Vec<String> = spec.endpoints.iter().map(|e| e.url.clone()).collect();
        let id = self.registry.register(spec).await?;
        self.router.set_endpoints(&id, urls);
        Ok(id)
    }

    /// The agent's task links are cleared and its tasks requeued before this
    /// returns.
    pub async fn unregister_agent(&self, id: &str) -> Result<(), OrchestrationError> {
        let agent = self.registry.unregister(id).await?;
        self.conductor
            .handle_agent_loss(&agent.id, agent.current_tasks)
            .await?;
        self.router.remove_agent(id);
        Ok(())
    }

    pub async fn update_agent(
        &self,
        id: &str,
        spec: AgentSpec,
    ) -> Result<(), OrchestrationError> {
        let urls: Vec<String> = spec.endpoints.iter().map(|e| e.url.clone()).collect();
        self.registry.update(id, spec).await?;
        self.router.set_endpoints(id, urls);
        Ok(())
    }

    pub async fn submit_task(&self, spec: TaskSpec) -> Result<TaskId, OrchestrationError> {
        self.ensure_accepting()?;
        self.metrics.task_submitted();
        self.conductor.submit_task(spec).await
    }

    pub async fn submit_workflow(
        &self,
        workflow: Workflow,
    ) -> Result<(String, Vec<TaskId>), OrchestrationError> {
        self.ensure_accepting()?;
        self.conductor.submit_workflow(workflow).await
    }

    pub fn submit_plan(&self, plan: ExecutionPlan) -> Result<String, OrchestrationError> {
        self.ensure_accepting()?;
        self.engine.submit(plan)
    }

    pub async fn cancel_task(&self, id: &str) -> Result<(), OrchestrationError> {
        self.conductor.cancel_task(id).await
    }

    pub fn cancel_plan(&self, id: &str) -> Result<(), OrchestrationError> {
        self.engine.cancel_plan(id)
    }

    pub fn agent_status(&self, id: Option<&str>) -> Result<Vec<Agent>, OrchestrationError> {
        match id {
            Some(id) => self
                .registry
                .get(id)
                .map(|a| vec![a])
                .ok_or_else(|| OrchestrationError::NotFound(format!("agent {}", id))),
            None => Ok(self.registry.list()),
        }
    }

    pub async fn task_status(&self, id: &str) -> Result<Task, OrchestrationError> {
        self.conductor.task_status(id).await
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>, OrchestrationError> {
        self.queue.tasks().await
    }

    pub fn plan_status(&self, id: &str) -> Result<PlanStatus, OrchestrationError> {
        self.engine
            .status(id)
            .ok_or_else(|| OrchestrationError::NotFound(format!("plan {}", id)))
    }

    pub async fn wait_for_plan(&self, id: &str) -> Result<PlanOutcome, OrchestrationError> {
        self.engine.wait(id).await
    }

    pub async fn discover_agents(
        &self,
        query: &DiscoveryQuery,
    ) -> Result<Arc<Vec<Agent>>, OrchestrationError> {
        self.registry.discover(query).await
    }

    pub async fn system_metrics(&self) -> Result<SystemMetricsReport, OrchestrationError> {
        let mut agents: HashMap<String, u64> = HashMap::new();
        for agent in self.registry.list() {
            let label = match agent.status {
                AgentStatus::Idle => "idle",
                AgentStatus::Busy => "busy",
                AgentStatus::Error => "error",
                AgentStatus::Maintenance => "maintenance",
                AgentStatus::Offline => "offline",
            };
            *agents.entry(label.to_string()).or_insert(0) += 1;
        }

        Ok(SystemMetricsReport {
            agents,
            queue: self.queue.lane_depths().await?,
            inflight_tasks: self.conductor.inflight_count(),
            active_connections: self.router.connection_count(),
            deployments: self.lifecycle.deployments().len(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        })
    }

    pub async fn generate_report(&self, window_secs: u64) -> PerformanceReport {
        self.optimizer
            .generate_report(ChronoDuration::seconds(window_secs.max(1) as i64))
            .await
    }

    // -- component access (gateway wiring) ----------------------------------

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn optimizer(&self) -> &Arc<PerformanceOptimizer> {
        &self.optimizer
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // -- background listeners -----------------------------------------------

    /// Fold events into prometheus counters and drive the agent-loss path
    /// when a connection drops.
    async fn observe_events(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.events.subscribe();
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(SystemEvent::TaskRetry { .. }) => self.metrics.task_retried(),
                        Ok(SystemEvent::MessageDeliveryFailed { .. }) => {
                            self.metrics.transport_failure()
                        }
                        Ok(SystemEvent::TaskCompleted { task_id })
                        | Ok(SystemEvent::TaskStarted { task_id }) => {
                            self.observe_task_timing(&task_id).await;
                        }
                        Ok(SystemEvent::TaskFailed { .. }) => {
                            if let Ok(depths) = self.queue.lane_depths().await {
                                self.metrics
                                    .set_queue_depth("dead_letter", depths.dead_letter as f64);
                            }
                        }
                        Ok(SystemEvent::AgentDisconnected { agent_id }) => {
                            self.on_agent_disconnected(&agent_id).await;
                        }
                        Ok(SystemEvent::AgentConnected { agent_id }) => {
                            self.on_agent_connected(&agent_id).await;
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn observe_task_timing(&self, task_id: &str) {
        let Ok(Some(task)) = self.queue.task(task_id).await else {
            return;
        };
        if let (Some(started), Some(completed)) = (task.started_at, task.completed_at) {
            let duration = completed.signed_duration_since(started);
            self.metrics
                .observe_task_duration(duration.num_milliseconds().max(0) as f64 / 1_000.0);
        } else if let Some(started) = task.started_at {
            let wait = started.signed_duration_since(task.created_at);
            self.metrics
                .observe_task_wait(wait.num_milliseconds().max(0) as f64 / 1_000.0);
        }
    }

    /// A reconnecting agent that was taken offline rejoins the rotation.
    async fn on_agent_connected(&self, agent_id: &str) {
        let was_offline = self
            .registry
            .get(agent_id)
            .map(|a| a.status == AgentStatus::Offline)
            .unwrap_or(false);
        if was_offline {
            if let Err(e) = self.registry.set_status(agent_id, AgentStatus::Idle).await {
                warn!(agent_id, "failed to restore reconnected agent: {}", e);
            }
        }
    }

    /// A dropped connection is agent loss: mark offline, requeue its tasks.
    async fn on_agent_disconnected(&self, agent_id: &str) {
        if self.registry.get(agent_id).is_none() {
            return;
        }
        if let Err(e) = self.registry.set_status(agent_id, AgentStatus::Offline).await {
            warn!(agent_id, "failed to mark agent offline: {}", e);
        }
        let tasks = self.registry.tasks_of(agent_id);
        if tasks.is_empty() {
            return;
        }
        for task_id in &tasks {
            if let Err(e) = self.registry.unlink_task(agent_id, task_id).await {
                warn!(agent_id, task_id, "failed to unlink task: {}", e);
            }
        }
        if let Err(e) = self.conductor.handle_agent_loss(&agent_id.to_string(), tasks).await {
            warn!(agent_id, "agent-loss requeue failed: {}", e);
        }
    }

    /// Periodic gauge sampling for agents, lanes, and connections.
    async fn sample_gauges(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(METRICS_SAMPLE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let mut counts: HashMap<&str, f64> = HashMap::from([
                        ("idle", 0.0), ("busy", 0.0), ("error", 0.0),
                        ("maintenance", 0.0), ("offline", 0.0),
                    ]);
                    for agent in self.registry.list() {
                        let label = match agent.status {
                            AgentStatus::Idle => "idle",
                            AgentStatus::Busy => "busy",
                            AgentStatus::Error => "error",
                            AgentStatus::Maintenance => "maintenance",
                            AgentStatus::Offline => "offline",
                        };
                        *counts.entry(label).or_insert(0.0) += 1.0;
                    }
                    for (status, count) in counts {
                        self.metrics.set_agents(status, count);
                    }

                    if let Ok(depths) = self.queue.lane_depths().await {
                        self.metrics.set_queue_depth("ready", depths.ready as f64);
                        self.metrics.set_queue_depth("processing", depths.processing as f64);
                        self.metrics.set_queue_depth("delayed", depths.delayed as f64);
                        self.metrics.set_queue_depth("dead_letter", depths.dead_letter as f64);
                    }
                    self.metrics
                        .set_active_connections(self.router.connection_count() as f64);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}
