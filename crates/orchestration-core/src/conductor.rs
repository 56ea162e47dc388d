//! Conductor: admission and scheduling.
//!
//! Drives the task state machine (`pending -> assigned -> running ->
//! completed | failed`, retry resets to pending, any state to cancelled).
//! Each tick drains the ready lane up to the dispatch budget, matches
//! capabilities against the registry, picks an agent per the configured
//! allocation strategy, and invokes it under the task's timeout.

use crate::config::{AllocationStrategy, SchedulerConfig};
use crate::events::{EventBus, SystemEvent};
use crate::graph::DependencyGraph;
use crate::queue::TaskQueue;
use crate::registry::AgentRegistry;
use crate::router::MessageRouter;
use crate::types::{
    Agent, AgentId, AgentStatus, Message, MessageType, Recipient, Task, TaskId, TaskSpec,
    TaskStatus, Workflow,
};
use crate::OrchestrationError;
use async_trait::async_trait;
use chrono::Utc;
use state_store::{keys, StateStore};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Hold applied to a claimed task whose dependencies are still in flight.
const DEPENDENCY_HOLD_MS: u64 = 500;

/// Seam between scheduling and the transport that reaches an agent.
#[async_trait]
pub trait AgentInvoker: Send + Sync + 'static {
    async fn invoke(&self, agent: &Agent, task: &Task) -> Result<serde_json::Value, String>;
}

/// Default invoker: a `request` message to the agent over the router, with
/// the task as payload; the correlated response carries result or error.
pub struct RouterInvoker {
    router: Arc<MessageRouter>,
}

impl RouterInvoker {
    pub fn new(router: Arc<MessageRouter>) -> Arc<Self> {
        Arc::new(Self { router })
    }
}

#[async_trait]
impl AgentInvoker for RouterInvoker {
    async fn invoke(&self, agent: &Agent, task: &Task) -> Result<serde_json::Value, String> {
        let mut message = Message::new(
            MessageType::Request,
            "conductor",
            Recipient::One(agent.id.clone()),
        );
        message.payload = serde_json::json!({
            "kind": "task_execution",
            "task": task,
        });

        let response = self
            .router
            .request(message, Duration::from_millis(task.constraints.timeout_ms))
            .await
            .map_err(|e| e.to_string())?;

        if let Some(error) = response.payload.get("error").and_then(|e| e.as_str()) {
            return Err(error.to_string());
        }
        Ok(response
            .payload
            .get("result")
            .cloned()
            .unwrap_or(serde_json::Value::Null))
    }
}

pub struct Conductor {
    queue: Arc<TaskQueue>,
    registry: Arc<AgentRegistry>,
    invoker: Arc<dyn AgentInvoker>,
    events: EventBus,
    config: SchedulerConfig,
    inflight: Arc<AtomicUsize>,
    kick: Arc<Notify>,
    store: Arc<dyn StateStore>,
}

impl Conductor {
    pub fn new(
        queue: Arc<TaskQueue>,
        registry: Arc<AgentRegistry>,
        invoker: Arc<dyn AgentInvoker>,
        store: Arc<dyn StateStore>,
        config: SchedulerConfig,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            registry,
            invoker,
            events,
            config,
            inflight: Arc::new(AtomicUsize::new(0)),
            kick: Arc::new(Notify::new()),
            store,
        })
    }

    // -- admission ----------------------------------------------------------

    pub async fn submit_task(&self, mut spec: TaskSpec) -> Result<TaskId, OrchestrationError> {
        if spec.constraints.timeout_ms == 0 {
            spec.constraints.timeout_ms = self.config.task_timeout_ms;
        }
        Self::validate_spec(&spec)?;
        let task = Task::from_spec(spec);
        let id = self.queue.enqueue(task).await?;
        self.events.emit(SystemEvent::TaskSubmitted {
            task_id: id.clone(),
        });
        self.kick.notify_one();
        Ok(id)
    }

    /// Expand a workflow into task submissions. The dependency map is
    /// validated as a DAG and folded into each task's dependency list; the
    /// workflow id doubles as the batch id, so `batchCompleted` fires when
    /// the last member finishes.
    pub async fn submit_workflow(
        &self,
        workflow: Workflow,
    ) -> Result<(String, Vec<TaskId>), OrchestrationError> {
        if workflow.tasks.is_empty() {
            return Err(OrchestrationError::InvalidSpec(
                "workflow contains no tasks".into(),
            ));
        }

        let mut specs = workflow.tasks;
        for spec in &mut specs {
            Self::validate_spec(spec)?;
            if spec.id.is_none() {
                spec.id = Some(Uuid::new_v4().to_string());
            }
        }
        let ids: Vec<TaskId> = specs
            .iter()
            .map(|s| s.id.clone().expect("ids assigned above"))
            .collect();

        // Rejects cycles and unknown references before any mutation.
        DependencyGraph::build(&ids, &workflow.dependencies)?;

        let workflow_id = Uuid::new_v4().to_string();
        let members = serde_json::to_string(&ids)?;
        self.store
            .put(
                &keys::batch(&workflow_id),
                &members,
                Some(Duration::from_secs(86_400)),
            )
            .await?;

        for mut spec in specs {
            let id = spec.id.clone().expect("ids assigned above");
            if let Some(deps) = workflow.dependencies.get(&id) {
                spec.dependencies = deps.clone();
            }
            spec.batch_id = Some(workflow_id.clone());
            let task = Task::from_spec(spec);
            self.queue.enqueue(task).await?;
            self.events.emit(SystemEvent::TaskSubmitted { task_id: id });
        }

        info!(workflow_id = %workflow_id, tasks = ids.len(), "workflow submitted");
        self.kick.notify_one();
        Ok((workflow_id, ids))
    }

    pub async fn cancel_task(&self, id: &str) -> Result<(), OrchestrationError> {
        let assigned = self
            .queue
            .task(id)
            .await?
            .and_then(|t| t.assigned_agent.clone());
        self.queue.cancel(id).await?;
        if let Some(agent_id) = assigned {
            self.registry.unlink_task(&agent_id, id).await?;
        }
        Ok(())
    }

    pub async fn task_status(&self, id: &str) -> Result<Task, OrchestrationError> {
        self.queue
            .task(id)
            .await?
            .ok_or_else(|| OrchestrationError::NotFound(format!("task {}", id)))
    }

    fn validate_spec(spec: &TaskSpec) -> Result<(), OrchestrationError> {
        if spec.task_type.trim().is_empty() {
            return Err(OrchestrationError::InvalidSpec("task type is empty".into()));
        }
        if spec.constraints.timeout_ms == 0 {
            return Err(OrchestrationError::InvalidSpec(
                "task timeout must be positive".into(),
            ));
        }
        Ok(())
    }

    // -- scheduling ---------------------------------------------------------

    /// One scheduling pass: recover stale work, promote ripe delayed tasks,
    /// then dispatch as much of the ready lane as budget and agents allow.
    pub async fn tick(self: &Arc<Self>) {
        if let Err(e) = self.queue.reap_stale().await {
            warn!("stale reap failed: {}", e);
        }
        if let Err(e) = self.queue.promote_delayed().await {
            warn!("delayed promotion failed: {}", e);
        }
        if let Err(e) = self.dispatch().await {
            warn!("dispatch pass failed: {}", e);
        }
    }

    async fn dispatch(self: &Arc<Self>) -> Result<(), OrchestrationError> {
        let inflight = self.inflight.load(Ordering::Relaxed);
        let budget = self.config.max_concurrent_tasks.saturating_sub(inflight);
        if budget == 0 {
            return Ok(());
        }

        let capabilities = self
            .registry
            .available_capabilities(self.config.per_capability_concurrency);
        let batch = self.queue.dequeue_batch(budget, &capabilities).await?;

        for task in batch {
            // Hold tasks whose dependencies have not completed yet.
            match self.dependencies_state(&task).await? {
                DependencyState::Ready => {}
                DependencyState::Waiting => {
                    self.queue.defer(&task.id, DEPENDENCY_HOLD_MS).await?;
                    continue;
                }
                DependencyState::Failed(dep) => {
                    self.queue
                        .fail(&task.id, &format!("dependency {} failed", dep))
                        .await?;
                    self.events.emit(SystemEvent::TaskFailed {
                        task_id: task.id.clone(),
                        error: format!("dependency {} failed", dep),
                    });
                    continue;
                }
            }

            let Some(agent) = self.select_agent(&task) else {
                // No candidate: return the task to the head of its class and
                // stop this pass so it cannot be starved by later tasks.
                self.queue.push_front(&task.id).await?;
                break;
            };

            self.assign_and_run(task, agent).await?;
        }
        Ok(())
    }

    async fn dependencies_state(
        &self,
        task: &Task,
    ) -> Result<DependencyState, OrchestrationError> {
        for dep in &task.dependencies {
            match self.queue.task(dep).await? {
                Some(dep_task) => match dep_task.status {
                    TaskStatus::Completed => {}
                    TaskStatus::Failed | TaskStatus::Cancelled => {
                        return Ok(DependencyState::Failed(dep.clone()));
                    }
                    _ => return Ok(DependencyState::Waiting),
                },
                // Unknown dependency record: treat as still pending.
                None => return Ok(DependencyState::Waiting),
            }
        }
        Ok(DependencyState::Ready)
    }

    /// Candidates: idle, or busy below their concurrency bound, with every
    /// required capability. Selection per the configured strategy.
    fn select_agent(&self, task: &Task) -> Option<Agent> {
        let candidates: Vec<Agent> = self
            .registry
            .list()
            .into_iter()
            .filter(|agent| {
                let available = match agent.status {
                    AgentStatus::Idle => true,
                    AgentStatus::Busy => agent.has_capacity(
                        self.config.per_capability_concurrency,
                        &task.required_capabilities,
                    ),
                    _ => false,
                };
                if !available {
                    return false;
                }
                let caps = agent.capability_types();
                task.required_capabilities
                    .iter()
                    .all(|c| caps.contains(c.as_str()))
            })
            .collect();

        if candidates.is_empty() {
            return None;
        }

        let best = match self.config.resource_allocation_strategy {
            AllocationStrategy::Balanced => candidates.into_iter().max_by(|a, b| {
                let score = |agent: &Agent| {
                    0.6 * agent.performance.success_rate
                        + 0.4 * (1.0 - agent.current_tasks.len() as f64 / 10.0)
                };
                score(a)
                    .partial_cmp(&score(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            }),
            AllocationStrategy::Performance => candidates.into_iter().max_by(|a, b| {
                a.performance
                    .success_rate
                    .partial_cmp(&b.performance.success_rate)
                    .unwrap_or(std::cmp::Ordering::Equal)
            }),
            AllocationStrategy::CostOptimized => candidates
                .into_iter()
                .min_by_key(|agent| agent.current_tasks.len()),
        };
        best
    }

    async fn assign_and_run(
        self: &Arc<Self>,
        mut task: Task,
        agent: Agent,
    ) -> Result<(), OrchestrationError> {
        task.status = TaskStatus::Assigned;
        task.assigned_agent = Some(agent.id.clone());
        self.queue.save_task(&task).await?;
        self.registry.assign_task(&agent.id, &task.id).await?;
        self.events.emit(SystemEvent::TaskAssigned {
            task_id: task.id.clone(),
            agent_id: agent.id.clone(),
        });

        let conductor = self.clone();
        self.inflight.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            conductor.execute_assignment(task, agent).await;
            conductor.inflight.fetch_sub(1, Ordering::Relaxed);
            conductor.kick.notify_one();
        });
        Ok(())
    }

    async fn execute_assignment(&self, mut task: Task, agent: Agent) {
        task.status = TaskStatus::Running;
        if task.started_at.is_none() {
            task.started_at = Some(Utc::now());
        }
        if let Err(e) = self.queue.save_task(&task).await {
            warn!(task_id = %task.id, "failed to persist running state: {}", e);
        }
        self.events.emit(SystemEvent::TaskStarted {
            task_id: task.id.clone(),
        });

        let started = std::time::Instant::now();
        let timeout = Duration::from_millis(task.constraints.timeout_ms);
        let outcome = tokio::time::timeout(timeout, self.invoker.invoke(&agent, &task)).await;
        let execution_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(result)) => {
                if let Err(e) = self.queue.complete(&task.id, result).await {
                    warn!(task_id = %task.id, "completion bookkeeping failed: {}", e);
                }
                if let Err(e) = self
                    .registry
                    .release_task(&agent.id, &task.id, true, execution_ms)
                    .await
                {
                    warn!(agent_id = %agent.id, "agent release failed: {}", e);
                }
                debug!(task_id = %task.id, execution_ms, "task completed");
                self.events.emit(SystemEvent::TaskCompleted {
                    task_id: task.id.clone(),
                });
            }
            Ok(Err(error)) => {
                self.record_failure(&task, &agent, &error, execution_ms).await;
            }
            Err(_) => {
                self.record_failure(&task, &agent, "timeout", execution_ms).await;
            }
        }
    }

    async fn record_failure(&self, task: &Task, agent: &Agent, error: &str, execution_ms: u64) {
        if let Err(e) = self.queue.fail(&task.id, error).await {
            warn!(task_id = %task.id, "failure bookkeeping failed: {}", e);
        }
        if let Err(e) = self
            .registry
            .release_task(&agent.id, &task.id, false, execution_ms)
            .await
        {
            warn!(agent_id = %agent.id, "agent release failed: {}", e);
        }
        self.events.emit(SystemEvent::TaskFailed {
            task_id: task.id.clone(),
            error: error.to_string(),
        });
    }

    // -- agent loss ---------------------------------------------------------

    /// Reset every task linked to a lost agent and requeue at the head of
    /// the ready lane. The links are cleared before this returns.
    pub async fn handle_agent_loss(
        &self,
        agent_id: &AgentId,
        tasks: Vec<TaskId>,
    ) -> Result<(), OrchestrationError> {
        for task_id in tasks {
            match self.queue.task(&task_id).await? {
                Some(task) if !task.is_terminal() => {
                    self.queue.push_front(&task_id).await?;
                    info!(task_id = %task_id, agent_id = %agent_id, "task requeued after agent loss");
                }
                _ => {}
            }
        }
        self.kick.notify_one();
        Ok(())
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.load(Ordering::Relaxed)
    }

    /// Scheduler loop: a pass every tick interval, and immediately on
    /// submission or completion.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms.max(10)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = self.kick.notified() => self.tick().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("conductor loop stopped");
                        return;
                    }
                }
            }
        }
    }
}

enum DependencyState {
    Ready,
    Waiting,
    Failed(TaskId),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QueueConfig, RegistryConfig};
    use crate::types::{AgentEndpoint, AgentSpec, Capability, TaskPriority};
    use parking_lot::Mutex;
    use state_store::{MemoryStore, StateStore};
    use std::collections::HashMap as StdHashMap;

    /// Scripted invoker: per-task-type delay and outcome.
    struct ScriptedInvoker {
        delay_ms: u64,
        fail_types: Vec<String>,
        calls: Mutex<Vec<(AgentId, TaskId)>>,
    }

    impl ScriptedInvoker {
        fn new(delay_ms: u64, fail_types: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                delay_ms,
                fail_types: fail_types.iter().map(|s| s.to_string()).collect(),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(AgentId, TaskId)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl AgentInvoker for ScriptedInvoker {
        async fn invoke(&self, agent: &Agent, task: &Task) -> Result<serde_json::Value, String> {
            self.calls.lock().push((agent.id.clone(), task.id.clone()));
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            if self.fail_types.contains(&task.task_type) {
                Err("scripted failure".to_string())
            } else {
                Ok(serde_json::json!({"handled": task.id}))
            }
        }
    }

    struct Fixture {
        conductor: Arc<Conductor>,
        queue: Arc<TaskQueue>,
        registry: Arc<AgentRegistry>,
        invoker: Arc<ScriptedInvoker>,
    }

    async fn fixture(invoker: Arc<ScriptedInvoker>, config: SchedulerConfig) -> Fixture {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let events = EventBus::new();
        let queue = Arc::new(TaskQueue::new(
            store.clone(),
            QueueConfig {
                retry_delay_ms: 20,
                ..Default::default()
            },
            events.clone(),
        ));
        let registry = Arc::new(AgentRegistry::new(
            store.clone(),
            RegistryConfig::default(),
            events.clone(),
        ));
        let conductor = Conductor::new(
            queue.clone(),
            registry.clone(),
            invoker.clone(),
            store,
            config,
            events,
        );
        Fixture {
            conductor,
            queue,
            registry,
            invoker,
        }
    }

    fn agent_spec(name: &str, cap: &str, max_concurrency: u32) -> AgentSpec {
        AgentSpec {
            name: name.into(),
            agent_type: "worker".into(),
            capabilities: vec![Capability {
                capability_type: cap.into(),
                priority: 0,
                max_concurrency,
                estimated_execution_ms: 10,
                dependencies: vec![],
                resources: Default::default(),
            }],
            endpoints: vec![AgentEndpoint {
                url: "ws://localhost:9000".into(),
            }],
            tags: vec![],
            region: None,
            metadata: StdHashMap::new(),
        }
    }

    fn task_spec(task_type: &str, caps: &[&str]) -> TaskSpec {
        TaskSpec {
            id: None,
            task_type: task_type.into(),
            priority: TaskPriority::Medium,
            payload: serde_json::Value::Null,
            dependencies: vec![],
            required_capabilities: caps.iter().map(|c| c.to_string()).collect(),
            constraints: Default::default(),
            scheduled_for: None,
            batch_id: None,
        }
    }

    async fn drain(f: &Fixture, passes: usize) {
        for _ in 0..passes {
            f.conductor.tick().await;
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
    }

    #[tokio::test]
    async fn test_capacity_one_runs_tasks_in_turn() {
        let f = fixture(ScriptedInvoker::new(60, &[]), SchedulerConfig::default()).await;
        f.registry.register(agent_spec("a", "x", 1)).await.unwrap();

        let t1 = f.conductor.submit_task(task_spec("work", &["x"])).await.unwrap();
        let t2 = f.conductor.submit_task(task_spec("work", &["x"])).await.unwrap();

        f.conductor.tick().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // First task running, second still pending behind the capacity bound.
        assert_eq!(
            f.queue.task(&t1).await.unwrap().unwrap().status,
            TaskStatus::Running
        );
        assert_eq!(
            f.queue.task(&t2).await.unwrap().unwrap().status,
            TaskStatus::Pending
        );

        drain(&f, 4).await;
        assert_eq!(
            f.queue.task(&t1).await.unwrap().unwrap().status,
            TaskStatus::Completed
        );
        assert_eq!(
            f.queue.task(&t2).await.unwrap().unwrap().status,
            TaskStatus::Completed
        );
        assert_eq!(f.queue.size().await.unwrap(), 0);
        let agent = f.registry.list().pop().unwrap();
        assert!(agent.current_tasks.is_empty());
    }

    #[tokio::test]
    async fn test_capability_mismatch_leaves_task_pending() {
        let f = fixture(ScriptedInvoker::new(0, &[]), SchedulerConfig::default()).await;
        f.registry.register(agent_spec("a", "x", 1)).await.unwrap();

        let t = f
            .conductor
            .submit_task(task_spec("work", &["gpu"]))
            .await
            .unwrap();
        drain(&f, 2).await;
        assert_eq!(
            f.queue.task(&t).await.unwrap().unwrap().status,
            TaskStatus::Pending
        );
        assert!(f.invoker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_retries_then_dead_letter() {
        let f = fixture(ScriptedInvoker::new(0, &["doomed"]), SchedulerConfig::default()).await;
        f.registry.register(agent_spec("a", "x", 1)).await.unwrap();

        let mut spec = task_spec("doomed", &["x"]);
        spec.constraints.max_retries = 2;
        let t = f.conductor.submit_task(spec).await.unwrap();

        drain(&f, 8).await;
        let task = f.queue.task(&t).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 2);
        // Exactly 3 execution attempts: initial + 2 retries.
        assert_eq!(f.invoker.calls().len(), 3);
        assert_eq!(f.queue.lane_depths().await.unwrap().dead_letter, 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let f = fixture(ScriptedInvoker::new(500, &[]), SchedulerConfig::default()).await;
        f.registry.register(agent_spec("a", "x", 1)).await.unwrap();

        let mut spec = task_spec("slow", &["x"]);
        spec.constraints.timeout_ms = 30;
        spec.constraints.max_retries = 0;
        let t = f.conductor.submit_task(spec).await.unwrap();

        drain(&f, 3).await;
        let task = f.queue.task(&t).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_workflow_respects_dependency_order() {
        let f = fixture(ScriptedInvoker::new(10, &[]), SchedulerConfig::default()).await;
        f.registry.register(agent_spec("a1", "x", 2)).await.unwrap();
        f.registry.register(agent_spec("a2", "x", 2)).await.unwrap();

        let mut t1 = task_spec("step", &["x"]);
        t1.id = Some("w-t1".into());
        let mut t2 = task_spec("step", &["x"]);
        t2.id = Some("w-t2".into());
        let mut t3 = task_spec("step", &["x"]);
        t3.id = Some("w-t3".into());

        let workflow = Workflow {
            name: "pipeline".into(),
            tasks: vec![t1, t2, t3],
            dependencies: StdHashMap::from([
                ("w-t2".to_string(), vec!["w-t1".to_string()]),
                ("w-t3".to_string(), vec!["w-t2".to_string()]),
            ]),
        };
        let (_wf, ids) = f.conductor.submit_workflow(workflow).await.unwrap();
        assert_eq!(ids.len(), 3);

        drain(&f, 60).await;
        for id in &ids {
            assert_eq!(
                f.queue.task(id).await.unwrap().unwrap().status,
                TaskStatus::Completed
            );
        }
        let order: Vec<TaskId> = f.invoker.calls().into_iter().map(|(_, t)| t).collect();
        assert_eq!(order, vec!["w-t1", "w-t2", "w-t3"]);
    }

    #[tokio::test]
    async fn test_cyclic_workflow_rejected_without_mutation() {
        let f = fixture(ScriptedInvoker::new(0, &[]), SchedulerConfig::default()).await;

        let mut t1 = task_spec("step", &[]);
        t1.id = Some("c1".into());
        let mut t2 = task_spec("step", &[]);
        t2.id = Some("c2".into());
        let workflow = Workflow {
            name: "cyclic".into(),
            tasks: vec![t1, t2],
            dependencies: StdHashMap::from([
                ("c1".to_string(), vec!["c2".to_string()]),
                ("c2".to_string(), vec!["c1".to_string()]),
            ]),
        };
        assert!(matches!(
            f.conductor.submit_workflow(workflow).await.unwrap_err(),
            OrchestrationError::Cyclic
        ));
        assert_eq!(f.queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_agent_loss_requeues_and_other_agents_finish() {
        let f = fixture(ScriptedInvoker::new(100, &[]), SchedulerConfig::default()).await;
        f.registry.register(agent_spec("a1", "x", 1)).await.unwrap();
        let doomed = f.registry.register(agent_spec("a2", "x", 1)).await.unwrap();

        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(f.conductor.submit_task(task_spec("work", &["x"])).await.unwrap());
        }
        f.conductor.tick().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Simulate losing a2 mid-flight: unregister and hand its tasks back.
        let lost = f.registry.unregister(&doomed).await.unwrap();
        f.conductor
            .handle_agent_loss(&doomed, lost.current_tasks.clone())
            .await
            .unwrap();

        drain(&f, 20).await;
        for id in &ids {
            assert_eq!(
                f.queue.task(id).await.unwrap().unwrap().status,
                TaskStatus::Completed
            );
        }
        // Nothing ran on a2 after its removal.
        let late_calls = f
            .invoker
            .calls()
            .into_iter()
            .filter(|(agent, _)| agent == &doomed)
            .count();
        assert!(late_calls <= 1);
    }

    #[tokio::test]
    async fn test_cost_optimized_picks_least_loaded() {
        let f = fixture(
            ScriptedInvoker::new(200, &[]),
            SchedulerConfig {
                resource_allocation_strategy: AllocationStrategy::CostOptimized,
                ..Default::default()
            },
        )
        .await;
        let busy = f.registry.register(agent_spec("busy", "x", 4)).await.unwrap();
        let idle = f.registry.register(agent_spec("idle", "x", 4)).await.unwrap();
        f.registry.assign_task(&busy, "preexisting").await.unwrap();

        f.conductor.submit_task(task_spec("work", &["x"])).await.unwrap();
        f.conductor.tick().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let calls = f.invoker.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, idle);
    }

    #[tokio::test]
    async fn test_cancel_task_clears_agent_link() {
        let f = fixture(ScriptedInvoker::new(300, &[]), SchedulerConfig::default()).await;
        let agent = f.registry.register(agent_spec("a", "x", 1)).await.unwrap();
        let t = f.conductor.submit_task(task_spec("work", &["x"])).await.unwrap();
        f.conductor.tick().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        f.conductor.cancel_task(&t).await.unwrap();
        let task = f.queue.task(&t).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(f.registry.get(&agent).unwrap().current_tasks.is_empty());

        // Idempotent.
        f.conductor.cancel_task(&t).await.unwrap();
    }
}
