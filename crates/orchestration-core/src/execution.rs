//! Parallel execution engine: plans, dependency DAGs, group semantics.
//!
//! Plans run in-process on the worker pool. Groups execute in declaration
//! order: sequential members one by one, parallel members under a semaphore
//! sized by the group (or plan) bound, conditional members only when the
//! condition holds against the completed-task set. Tasks not named by any
//! group form an implicit final parallel group.

use crate::condition;
use crate::events::{EventBus, SystemEvent};
use crate::graph::DependencyGraph;
use crate::resources::ResourceMonitor;
use crate::types::{ExecutionPlan, GroupType, Task, TaskGroup, TaskId};
use crate::worker_pool::{WorkOutcome, WorkerPool};
use crate::OrchestrationError;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

const MIN_PLAN_TIMEOUT_MS: u64 = 1_000;
const POOL_RETRY_DELAY: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl PlanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PlanStatus::Completed | PlanStatus::Failed | PlanStatus::Cancelled
        )
    }
}

/// Final snapshot of one plan run.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub plan_id: String,
    pub status: PlanStatus,
    pub results: HashMap<TaskId, WorkOutcome>,
}

/// Execution-relevant shape of a validated plan.
struct PlanShape {
    task_order: Vec<TaskId>,
    groups: Vec<TaskGroup>,
    max_concurrency: usize,
    timeout_ms: u64,
}

struct PlanRuntime {
    plan_id: String,
    tasks: HashMap<TaskId, Task>,
    deps: HashMap<TaskId, Vec<TaskId>>,
    graph: Mutex<DependencyGraph>,
    results: Arc<DashMap<TaskId, WorkOutcome>>,
    notify: Notify,
    cancel: watch::Receiver<bool>,
    /// Set when rollback-on-failure stops the plan, so the final status
    /// reads failed rather than cancelled.
    abort_tx: watch::Sender<bool>,
    rollback_on_failure: bool,
    rolled_back: std::sync::atomic::AtomicBool,
}

struct PlanHandle {
    status: watch::Sender<PlanStatus>,
    cancel: watch::Sender<bool>,
    results: Arc<DashMap<TaskId, WorkOutcome>>,
}

pub struct ExecutionEngine {
    pool: Arc<WorkerPool>,
    resources: ResourceMonitor,
    events: EventBus,
    plans: DashMap<String, PlanHandle>,
}

impl ExecutionEngine {
    pub fn new(pool: Arc<WorkerPool>, resources: ResourceMonitor, events: EventBus) -> Arc<Self> {
        Arc::new(Self {
            pool,
            resources,
            events,
            plans: DashMap::new(),
        })
    }

    /// Validate and start a plan; returns its id immediately.
    pub fn submit(self: &Arc<Self>, plan: ExecutionPlan) -> Result<String, OrchestrationError> {
        let (plan_id, runtime, shape, cancel_tx) = self.prepare(plan)?;

        let (status_tx, _) = watch::channel(PlanStatus::Pending);
        self.plans.insert(
            plan_id.clone(),
            PlanHandle {
                status: status_tx,
                cancel: cancel_tx,
                results: runtime.results.clone(),
            },
        );

        let engine = self.clone();
        let id = plan_id.clone();
        tokio::spawn(async move {
            engine.drive(id, runtime, shape).await;
        });
        Ok(plan_id)
    }

    /// Advisory stop: in-flight tasks are asked to cancel; their results are
    /// discarded from the plan's point of view.
    pub fn cancel_plan(&self, plan_id: &str) -> Result<(), OrchestrationError> {
        let Some(handle) = self.plans.get(plan_id) else {
            return Err(OrchestrationError::NotFound(format!("plan {}", plan_id)));
        };
        if handle.status.borrow().is_terminal() {
            return Ok(());
        }
        let _ = handle.cancel.send(true);
        info!(plan_id, "plan cancellation requested");
        self.events.emit(SystemEvent::PlanCancelled {
            plan_id: plan_id.to_string(),
        });
        Ok(())
    }

    pub fn status(&self, plan_id: &str) -> Option<PlanStatus> {
        self.plans.get(plan_id).map(|h| *h.status.borrow())
    }

    /// Wait until the plan reaches a terminal status.
    pub async fn wait(&self, plan_id: &str) -> Result<PlanOutcome, OrchestrationError> {
        let mut rx = {
            let Some(handle) = self.plans.get(plan_id) else {
                return Err(OrchestrationError::NotFound(format!("plan {}", plan_id)));
            };
            handle.status.subscribe()
        };
        loop {
            let status = *rx.borrow();
            if status.is_terminal() {
                let results = self
                    .plans
                    .get(plan_id)
                    .map(|h| {
                        h.results
                            .iter()
                            .map(|e| (e.key().clone(), e.value().clone()))
                            .collect()
                    })
                    .unwrap_or_default();
                return Ok(PlanOutcome {
                    plan_id: plan_id.to_string(),
                    status,
                    results,
                });
            }
            if rx.changed().await.is_err() {
                return Err(OrchestrationError::NotFound(format!("plan {}", plan_id)));
            }
        }
    }

    // -- validation ---------------------------------------------------------

    #[allow(clippy::type_complexity)]
    fn prepare(
        &self,
        mut plan: ExecutionPlan,
    ) -> Result<(String, PlanRuntime, PlanShape, watch::Sender<bool>), OrchestrationError> {
        if plan.tasks.is_empty() {
            return Err(OrchestrationError::InvalidSpec(
                "plan contains no tasks".into(),
            ));
        }
        if plan.max_concurrency < 1 {
            return Err(OrchestrationError::InvalidSpec(
                "plan max_concurrency must be at least 1".into(),
            ));
        }
        if plan.timeout_ms < MIN_PLAN_TIMEOUT_MS {
            return Err(OrchestrationError::InvalidSpec(format!(
                "plan timeout must be at least {} ms",
                MIN_PLAN_TIMEOUT_MS
            )));
        }

        for spec in &mut plan.tasks {
            if spec.id.is_none() {
                spec.id = Some(Uuid::new_v4().to_string());
            }
        }
        let ids: Vec<TaskId> = plan
            .tasks
            .iter()
            .map(|t| t.id.clone().expect("ids assigned above"))
            .collect();
        let unique: HashSet<&TaskId> = ids.iter().collect();
        if unique.len() != ids.len() {
            return Err(OrchestrationError::InvalidSpec(
                "duplicate task ids in plan".into(),
            ));
        }

        let mut seen_members = HashSet::new();
        for group in &plan.groups {
            for member in &group.tasks {
                if !unique.contains(member) {
                    return Err(OrchestrationError::InvalidSpec(format!(
                        "group references unknown task {}",
                        member
                    )));
                }
                if !seen_members.insert(member.clone()) {
                    return Err(OrchestrationError::InvalidSpec(format!(
                        "task {} appears in more than one group",
                        member
                    )));
                }
            }
            if group.max_concurrency == Some(0) {
                return Err(OrchestrationError::InvalidSpec(
                    "group max_concurrency must be at least 1".into(),
                ));
            }
        }

        let graph = DependencyGraph::build(&ids, &plan.dependencies)?;

        let plan_id = Uuid::new_v4().to_string();
        let tasks: HashMap<TaskId, Task> = plan
            .tasks
            .iter()
            .map(|spec| {
                let task = Task::from_spec(spec.clone());
                (task.id.clone(), task)
            })
            .collect();
        let deps: HashMap<TaskId, Vec<TaskId>> = ids
            .iter()
            .map(|id| {
                (
                    id.clone(),
                    plan.dependencies.get(id).cloned().unwrap_or_default(),
                )
            })
            .collect();

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let runtime = PlanRuntime {
            plan_id: plan_id.clone(),
            tasks,
            deps,
            graph: Mutex::new(graph),
            results: Arc::new(DashMap::new()),
            notify: Notify::new(),
            cancel: cancel_rx,
            abort_tx: cancel_tx.clone(),
            rollback_on_failure: plan.rollback_on_failure,
            rolled_back: std::sync::atomic::AtomicBool::new(false),
        };
        let shape = PlanShape {
            task_order: ids,
            groups: plan.groups.clone(),
            max_concurrency: plan.max_concurrency,
            timeout_ms: plan.timeout_ms,
        };

        Ok((plan_id, runtime, shape, cancel_tx))
    }

    // -- execution ----------------------------------------------------------

    async fn drive(self: Arc<Self>, plan_id: String, runtime: PlanRuntime, shape: PlanShape) {
        self.set_status(&plan_id, PlanStatus::Running);
        self.events.emit(SystemEvent::PlanStarted {
            plan_id: plan_id.clone(),
        });

        let runtime = Arc::new(runtime);
        let deadline = Duration::from_millis(shape.timeout_ms);

        let timed_out = tokio::time::timeout(deadline, self.run_groups(runtime.clone(), &shape))
            .await
            .is_err();

        let rolled_back = runtime
            .rolled_back
            .load(std::sync::atomic::Ordering::SeqCst);
        let cancelled = *runtime.cancel.borrow() && !rolled_back;
        // A branch the condition ruled out is not a failure.
        let any_failed = runtime
            .results
            .iter()
            .any(|e| matches!(e.value(), WorkOutcome::Failed(err) if err != "skipped"));

        let final_status = if cancelled {
            PlanStatus::Cancelled
        } else if timed_out {
            warn!(plan_id = %plan_id, "plan exceeded its time budget");
            PlanStatus::Failed
        } else if any_failed {
            PlanStatus::Failed
        } else {
            PlanStatus::Completed
        };

        self.set_status(&plan_id, final_status);
        match final_status {
            PlanStatus::Completed => self.events.emit(SystemEvent::PlanCompleted {
                plan_id: plan_id.clone(),
            }),
            PlanStatus::Failed => self.events.emit(SystemEvent::PlanFailed {
                plan_id: plan_id.clone(),
                error: if timed_out {
                    "plan timeout".to_string()
                } else {
                    "one or more tasks failed".to_string()
                },
            }),
            // cancel_plan already announced the cancellation
            _ => {}
        }
    }

    async fn run_groups(&self, runtime: Arc<PlanRuntime>, shape: &PlanShape) {
        let grouped: HashSet<TaskId> = shape
            .groups
            .iter()
            .flat_map(|g| g.tasks.iter().cloned())
            .collect();

        for group in &shape.groups {
            if *runtime.cancel.borrow() {
                return;
            }
            self.run_group(runtime.clone(), group, shape.max_concurrency)
                .await;
        }

        // Implicit final parallel group for ungrouped tasks, in list order.
        let ungrouped: Vec<TaskId> = shape
            .task_order
            .iter()
            .filter(|id| !grouped.contains(*id))
            .cloned()
            .collect();
        if !ungrouped.is_empty() {
            self.run_parallel(runtime, &ungrouped, shape.max_concurrency)
                .await;
        }
    }

    async fn run_group(
        &self,
        runtime: Arc<PlanRuntime>,
        group: &TaskGroup,
        plan_concurrency: usize,
    ) {
        let bound = group.max_concurrency.unwrap_or(plan_concurrency).max(1);
        match group.group_type {
            GroupType::Sequential => {
                for task_id in &group.tasks {
                    if *runtime.cancel.borrow() {
                        return;
                    }
                    self.run_task_after_deps(runtime.clone(), task_id, None)
                        .await;
                }
            }
            GroupType::Parallel => {
                self.run_parallel(runtime, &group.tasks, bound).await;
            }
            GroupType::Conditional => {
                let truthy = {
                    let graph = runtime.graph.lock();
                    let condition_text = group.condition.as_deref().unwrap_or("");
                    condition::evaluate(condition_text, &|path| {
                        path.strip_prefix("task_")
                            .and_then(|rest| rest.strip_suffix("_completed"))
                            .filter(|id| runtime.tasks.contains_key(*id))
                            .map(|id| if graph.is_completed(id) { 1.0 } else { 0.0 })
                    })
                };
                if !truthy {
                    debug!(plan_id = %runtime.plan_id, "conditional branch skipped");
                    for task_id in &group.tasks {
                        runtime
                            .results
                            .insert(task_id.clone(), WorkOutcome::Failed("skipped".into()));
                    }
                    runtime.notify.notify_waiters();
                    return;
                }
                self.run_parallel(runtime, &group.tasks, bound).await;
            }
        }
    }

    async fn run_parallel(&self, runtime: Arc<PlanRuntime>, tasks: &[TaskId], bound: usize) {
        let semaphore = Arc::new(Semaphore::new(bound.max(1)));
        let futures: Vec<_> = tasks
            .iter()
            .map(|task_id| {
                let runtime = runtime.clone();
                let semaphore = semaphore.clone();
                let task_id = task_id.clone();
                async move {
                    self.run_task_after_deps(runtime, &task_id, Some(semaphore))
                        .await;
                }
            })
            .collect();
        join_all(futures).await;
    }

    /// Wait for dependencies, then (for parallel groups) a semaphore permit,
    /// then execute. Permits are acquired after dependency waits so a blocked
    /// task cannot starve the group.
    async fn run_task_after_deps(
        &self,
        runtime: Arc<PlanRuntime>,
        task_id: &str,
        semaphore: Option<Arc<Semaphore>>,
    ) {
        if runtime.results.contains_key(task_id) {
            return;
        }

        let deps = runtime.deps.get(task_id).cloned().unwrap_or_default();
        loop {
            let notified = runtime.notify.notified();

            if *runtime.cancel.borrow() {
                runtime
                    .results
                    .insert(task_id.to_string(), WorkOutcome::Failed("cancelled".into()));
                runtime.notify.notify_waiters();
                return;
            }

            let mut dep_failed = false;
            let mut ready = true;
            {
                let graph = runtime.graph.lock();
                for dep in &deps {
                    if graph.is_completed(dep) {
                        continue;
                    }
                    match runtime.results.get(dep).map(|r| r.value().clone()) {
                        Some(WorkOutcome::Failed(_)) => {
                            dep_failed = true;
                            break;
                        }
                        _ => {
                            ready = false;
                            break;
                        }
                    }
                }
            }
            if dep_failed {
                runtime.results.insert(
                    task_id.to_string(),
                    WorkOutcome::Failed("dependency_failed".into()),
                );
                runtime.notify.notify_waiters();
                return;
            }
            if ready {
                break;
            }
            notified.await;
        }

        let _permit = match semaphore {
            Some(sem) => Some(sem.acquire_owned().await.expect("semaphore never closed")),
            None => None,
        };

        self.run_task(runtime, task_id).await;
    }

    async fn run_task(&self, runtime: Arc<PlanRuntime>, task_id: &str) {
        let Some(task) = runtime.tasks.get(task_id) else {
            return;
        };

        let guard = match self.resources.try_acquire(task.priority) {
            Ok(guard) => guard,
            Err(e) => {
                warn!(task_id, "plan task rejected: {}", e);
                runtime.results.insert(
                    task_id.to_string(),
                    WorkOutcome::Failed("insufficient_resources".into()),
                );
                runtime.notify.notify_waiters();
                return;
            }
        };

        // An exhausted pool is retryable; the plan deadline bounds the loop.
        let outcome = loop {
            if *runtime.cancel.borrow() {
                break WorkOutcome::Failed("cancelled".into());
            }
            match self.pool.execute_task(task, runtime.cancel.clone()).await {
                Ok(outcome) => break outcome,
                Err(OrchestrationError::InsufficientResources(_)) => {
                    tokio::time::sleep(POOL_RETRY_DELAY).await;
                }
                Err(OrchestrationError::Timeout(_)) => {
                    break WorkOutcome::Failed("timeout".into());
                }
                Err(e) => break WorkOutcome::Failed(e.to_string()),
            }
        };
        drop(guard);

        if let WorkOutcome::Completed(_) = outcome {
            runtime.graph.lock().mark_completed(task_id);
        } else if runtime.rollback_on_failure && !*runtime.cancel.borrow() {
            warn!(plan_id = %runtime.plan_id, task_id, "task failed, rolling back plan");
            runtime
                .rolled_back
                .store(true, std::sync::atomic::Ordering::SeqCst);
            let _ = runtime.abort_tx.send(true);
        }
        runtime.results.insert(task_id.to_string(), outcome);
        runtime.notify.notify_waiters();
    }

    fn set_status(&self, plan_id: &str, status: PlanStatus) {
        if let Some(handle) = self.plans.get(plan_id) {
            let _ = handle.status.send(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceLimitsConfig;
    use crate::types::{TaskConstraints, TaskPriority, TaskSpec};
    use crate::worker_pool::TaskHandler;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records concurrency high-water mark and execution order.
    struct ProbeHandler {
        delay_ms: u64,
        running: AtomicUsize,
        max_running: AtomicUsize,
        order: Mutex<Vec<TaskId>>,
    }

    impl ProbeHandler {
        fn new(delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                delay_ms,
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
                order: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TaskHandler for ProbeHandler {
        async fn handle(&self, task: &Task) -> Result<serde_json::Value, String> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            self.order.lock().push(task.id.clone());
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if task.task_type == "failing" {
                Err("boom".to_string())
            } else {
                Ok(serde_json::json!({"done": task.id}))
            }
        }
    }

    fn engine_with(handler: Arc<ProbeHandler>, workers: usize) -> Arc<ExecutionEngine> {
        let pool = WorkerPool::new(workers, handler);
        let resources = ResourceMonitor::new(
            ResourceLimitsConfig {
                max_cpu_usage: 100.0,
                max_memory_mb: 1_000_000,
                max_network_mbps: 1_000_000,
                max_disk_io_mbps: 1_000_000,
            },
            EventBus::new(),
        );
        ExecutionEngine::new(pool, resources, EventBus::new())
    }

    fn spec(id: &str, task_type: &str) -> TaskSpec {
        TaskSpec {
            id: Some(id.to_string()),
            task_type: task_type.to_string(),
            priority: TaskPriority::Medium,
            payload: serde_json::Value::Null,
            dependencies: vec![],
            required_capabilities: vec![],
            constraints: TaskConstraints {
                max_retries: 0,
                timeout_ms: 10_000,
                deadline: None,
            },
            scheduled_for: None,
            batch_id: None,
        }
    }

    fn plan(tasks: Vec<TaskSpec>) -> ExecutionPlan {
        ExecutionPlan {
            name: "test-plan".into(),
            tasks,
            dependencies: HashMap::new(),
            groups: vec![],
            max_concurrency: 4,
            timeout_ms: 30_000,
            rollback_on_failure: false,
        }
    }

    #[tokio::test]
    async fn test_single_task_plan_executes_once() {
        let handler = ProbeHandler::new(0);
        let engine = engine_with(handler.clone(), 2);
        let id = engine.submit(plan(vec![spec("t1", "ok")])).unwrap();

        let outcome = engine.wait(&id).await.unwrap();
        assert_eq!(outcome.status, PlanStatus::Completed);
        assert_eq!(handler.order.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_parallel_group_respects_concurrency_bound() {
        let handler = ProbeHandler::new(30);
        let engine = engine_with(handler.clone(), 10);

        let tasks: Vec<TaskSpec> = (0..10).map(|i| spec(&format!("t{}", i), "ok")).collect();
        let members: Vec<TaskId> = tasks.iter().map(|t| t.id.clone().unwrap()).collect();
        let mut p = plan(tasks);
        p.groups = vec![TaskGroup {
            group_type: GroupType::Parallel,
            tasks: members,
            max_concurrency: Some(3),
            condition: None,
        }];

        let id = engine.submit(p).unwrap();
        let outcome = engine.wait(&id).await.unwrap();
        assert_eq!(outcome.status, PlanStatus::Completed);
        assert!(handler.max_running.load(Ordering::SeqCst) <= 3);
        assert_eq!(outcome.results.len(), 10);
    }

    #[tokio::test]
    async fn test_dependencies_enforce_order() {
        let handler = ProbeHandler::new(5);
        let engine = engine_with(handler.clone(), 4);

        let mut p = plan(vec![spec("t1", "ok"), spec("t2", "ok"), spec("t3", "ok")]);
        p.dependencies = HashMap::from([
            ("t2".to_string(), vec!["t1".to_string()]),
            ("t3".to_string(), vec!["t2".to_string()]),
        ]);

        let id = engine.submit(p).unwrap();
        let outcome = engine.wait(&id).await.unwrap();
        assert_eq!(outcome.status, PlanStatus::Completed);
        assert_eq!(*handler.order.lock(), vec!["t1", "t2", "t3"]);
    }

    #[tokio::test]
    async fn test_cyclic_plan_rejected_without_state() {
        let handler = ProbeHandler::new(0);
        let engine = engine_with(handler, 2);

        let mut p = plan(vec![spec("t1", "ok"), spec("t2", "ok")]);
        p.dependencies = HashMap::from([
            ("t1".to_string(), vec!["t2".to_string()]),
            ("t2".to_string(), vec!["t1".to_string()]),
        ]);

        assert!(matches!(
            engine.submit(p).unwrap_err(),
            OrchestrationError::Cyclic
        ));
        assert!(engine.plans.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_plans_rejected() {
        let handler = ProbeHandler::new(0);
        let engine = engine_with(handler, 2);

        assert!(engine.submit(plan(vec![])).is_err());

        let mut zero_conc = plan(vec![spec("t1", "ok")]);
        zero_conc.max_concurrency = 0;
        assert!(engine.submit(zero_conc).is_err());

        let mut short_timeout = plan(vec![spec("t1", "ok")]);
        short_timeout.timeout_ms = 100;
        assert!(engine.submit(short_timeout).is_err());

        let mut ghost_group = plan(vec![spec("t1", "ok")]);
        ghost_group.groups = vec![TaskGroup {
            group_type: GroupType::Parallel,
            tasks: vec!["ghost".to_string()],
            max_concurrency: None,
            condition: None,
        }];
        assert!(engine.submit(ghost_group).is_err());
    }

    #[tokio::test]
    async fn test_failed_dependency_fails_dependents() {
        let handler = ProbeHandler::new(0);
        let engine = engine_with(handler, 2);

        let mut p = plan(vec![spec("t1", "failing"), spec("t2", "ok")]);
        p.dependencies = HashMap::from([("t2".to_string(), vec!["t1".to_string()])]);

        let id = engine.submit(p).unwrap();
        let outcome = engine.wait(&id).await.unwrap();
        assert_eq!(outcome.status, PlanStatus::Failed);
        assert!(
            matches!(outcome.results.get("t2"), Some(WorkOutcome::Failed(e)) if e == "dependency_failed")
        );
    }

    #[tokio::test]
    async fn test_conditional_group_branches() {
        let handler = ProbeHandler::new(0);
        let engine = engine_with(handler.clone(), 2);

        let mut p = plan(vec![spec("base", "ok"), spec("branch", "ok")]);
        p.groups = vec![
            TaskGroup {
                group_type: GroupType::Sequential,
                tasks: vec!["base".to_string()],
                max_concurrency: None,
                condition: None,
            },
            TaskGroup {
                group_type: GroupType::Conditional,
                tasks: vec!["branch".to_string()],
                max_concurrency: None,
                condition: Some("task_base_completed".to_string()),
            },
        ];

        let id = engine.submit(p).unwrap();
        let outcome = engine.wait(&id).await.unwrap();
        assert_eq!(outcome.status, PlanStatus::Completed);
        assert_eq!(handler.order.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_conditional_group_skips_falsy_branch() {
        let handler = ProbeHandler::new(0);
        let engine = engine_with(handler.clone(), 2);

        let mut p = plan(vec![spec("base", "ok"), spec("branch", "ok")]);
        p.groups = vec![
            TaskGroup {
                group_type: GroupType::Sequential,
                tasks: vec!["base".to_string()],
                max_concurrency: None,
                condition: None,
            },
            TaskGroup {
                group_type: GroupType::Conditional,
                tasks: vec!["branch".to_string()],
                max_concurrency: None,
                // Unparseable conditions evaluate to false.
                condition: Some("task_base_completed AND".to_string()),
            },
        ];

        let id = engine.submit(p).unwrap();
        let outcome = engine.wait(&id).await.unwrap();
        assert_eq!(outcome.status, PlanStatus::Completed);
        assert_eq!(handler.order.lock().len(), 1);
        assert!(
            matches!(outcome.results.get("branch"), Some(WorkOutcome::Failed(e)) if e == "skipped")
        );
    }

    #[tokio::test]
    async fn test_rollback_on_failure_stops_plan() {
        let handler = ProbeHandler::new(100);
        let engine = engine_with(handler.clone(), 1);

        let mut specs = vec![spec("bad", "failing")];
        for i in 0..4 {
            specs.push(spec(&format!("t{}", i), "ok"));
        }
        let mut p = plan(specs);
        p.rollback_on_failure = true;

        let id = engine.submit(p).unwrap();
        let outcome = engine.wait(&id).await.unwrap();
        // A rollback reads as failure, not operator cancellation.
        assert_eq!(outcome.status, PlanStatus::Failed);
        assert!(handler.order.lock().len() < 5);
    }

    #[tokio::test]
    async fn test_cancel_plan_stops_remaining_work() {
        let handler = ProbeHandler::new(200);
        let engine = engine_with(handler.clone(), 1);

        let tasks: Vec<TaskSpec> = (0..5).map(|i| spec(&format!("t{}", i), "ok")).collect();
        let id = engine.submit(plan(tasks)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.cancel_plan(&id).unwrap();

        let outcome = engine.wait(&id).await.unwrap();
        assert_eq!(outcome.status, PlanStatus::Cancelled);
        assert!(handler.order.lock().len() < 5);
    }

    #[tokio::test]
    async fn test_cancel_unknown_plan_is_not_found() {
        let handler = ProbeHandler::new(0);
        let engine = engine_with(handler, 1);
        assert!(matches!(
            engine.cancel_plan("ghost").unwrap_err(),
            OrchestrationError::NotFound(_)
        ));
    }
}
