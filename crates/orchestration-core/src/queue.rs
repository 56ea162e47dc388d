//! Priority task queue over the shared store.
//!
//! Four lanes: ready (`queue:main`), processing, delayed, and dead-letter.
//! Each lane is a score-ordered set holding task ids; full task records live
//! at `task:<id>`. A task is in at most one lane at any instant: every lane
//! move happens under that task's lock, which is the transactional primitive
//! the single-leader deployment relies on.

use crate::config::QueueConfig;
use crate::events::{EventBus, SystemEvent};
use crate::types::{Task, TaskId, TaskStatus};
use crate::OrchestrationError;
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use state_store::{keys, StateStore};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Score band reserved for age bonuses; one full band separates priorities.
const PRIORITY_BAND: f64 = 1_000_000.0;
const AGE_BONUS_CAP_SECS: f64 = 900_000.0;
/// Age bonus used when a task is pushed back to the head of its class.
const HEAD_BONUS: f64 = 950_000.0;

const TASK_TTL: Duration = Duration::from_secs(86_400);

pub struct TaskQueue {
    store: Arc<dyn StateStore>,
    config: QueueConfig,
    events: EventBus,
    insertion_nonce: AtomicU64,
    task_locks: DashMap<TaskId, Arc<Mutex<()>>>,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn StateStore>, config: QueueConfig, events: EventBus) -> Self {
        Self {
            store,
            config,
            events,
            insertion_nonce: AtomicU64::new(0),
            task_locks: DashMap::new(),
        }
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        self.task_locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn release_lock(&self, id: &str) {
        self.task_locks.remove(id);
    }

    /// `base * 10^6 + age_bonus + insertion_nonce`: strict priority bands, age
    /// anti-starvation within a band, deterministic tie-break.
    fn score(&self, task: &Task) -> f64 {
        let age_secs = (Utc::now() - task.created_at).num_seconds().max(0) as f64;
        let nonce = self.insertion_nonce.fetch_add(1, Ordering::Relaxed);
        let tie_break = 1.0 - ((nonce % 1_000_000) as f64 / PRIORITY_BAND);
        task.priority.base_score() * PRIORITY_BAND + age_secs.min(AGE_BONUS_CAP_SECS) + tie_break
    }

    fn head_score(&self, task: &Task) -> f64 {
        task.priority.base_score() * PRIORITY_BAND + HEAD_BONUS
    }

    pub async fn task(&self, id: &str) -> Result<Option<Task>, OrchestrationError> {
        match self.store.get(&keys::task(id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn save_task(&self, task: &Task) -> Result<(), OrchestrationError> {
        let json = serde_json::to_string(task)?;
        self.store
            .put(&keys::task(&task.id), &json, Some(TASK_TTL))
            .await?;
        Ok(())
    }

    /// Admit a task: delayed lane when `scheduled_for` is in the future,
    /// otherwise ready. Re-admitting a known task id is a no-op.
    pub async fn enqueue(&self, task: Task) -> Result<TaskId, OrchestrationError> {
        let lock = self.lock_for(&task.id);
        let _guard = lock.lock().await;

        if self.task(&task.id).await?.is_some() {
            debug!(task_id = %task.id, "duplicate enqueue ignored");
            return Ok(task.id);
        }

        let ready = self.store.zcard(keys::QUEUE_READY).await?;
        let delayed = self.store.zcard(keys::QUEUE_DELAYED).await?;
        if (ready + delayed) as usize >= self.config.max_size {
            return Err(OrchestrationError::QueueFull(self.config.max_size));
        }

        self.save_task(&task).await?;

        match task.scheduled_for {
            Some(at) if at > Utc::now() => {
                self.store
                    .zadd(keys::QUEUE_DELAYED, &task.id, at.timestamp_millis() as f64)
                    .await?;
                debug!(task_id = %task.id, scheduled_for = %at, "task enqueued to delayed lane");
            }
            _ => {
                let score = self.score(&task);
                self.store.zadd(keys::QUEUE_READY, &task.id, score).await?;
                debug!(task_id = %task.id, score, "task enqueued");
            }
        }
        Ok(task.id)
    }

    /// Pop up to `n` ready tasks whose required capabilities are covered by
    /// `capabilities`, move them to processing, and stamp `started_at`.
    pub async fn dequeue_batch(
        &self,
        n: usize,
        capabilities: &HashSet<String>,
    ) -> Result<Vec<Task>, OrchestrationError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        // Over-scan so capability-filtered entries do not shrink the batch.
        let window = (n * 4).max(32);
        let candidates = self.store.ztop(keys::QUEUE_READY, window).await?;

        let mut claimed = Vec::new();
        for entry in candidates {
            if claimed.len() >= n {
                break;
            }
            let lock = self.lock_for(&entry.member);
            let _guard = lock.lock().await;

            // Re-check under the lock: another dequeue may have claimed it.
            if self
                .store
                .zscore(keys::QUEUE_READY, &entry.member)
                .await?
                .is_none()
            {
                continue;
            }

            let Some(mut task) = self.task(&entry.member).await? else {
                // Record expired out from under the lane; drop the orphan.
                self.store.zrem(keys::QUEUE_READY, &entry.member).await?;
                warn!(task_id = %entry.member, "orphaned queue entry removed");
                continue;
            };
            if task.is_terminal() {
                self.store.zrem(keys::QUEUE_READY, &entry.member).await?;
                continue;
            }

            let covered = task
                .required_capabilities
                .iter()
                .all(|c| capabilities.contains(c));
            if !covered {
                continue;
            }

            self.store.zrem(keys::QUEUE_READY, &entry.member).await?;
            task.started_at = Some(Utc::now());
            self.save_task(&task).await?;
            self.store
                .zadd(
                    keys::QUEUE_PROCESSING,
                    &task.id,
                    Utc::now().timestamp_millis() as f64,
                )
                .await?;
            claimed.push(task);
        }
        Ok(claimed)
    }

    /// Remove from processing and mark completed; checks the task's batch.
    pub async fn complete(
        &self,
        id: &str,
        result: serde_json::Value,
    ) -> Result<(), OrchestrationError> {
        let lock = self.lock_for(id);
        {
            let _guard = lock.lock().await;

            let Some(mut task) = self.task(id).await? else {
                return Err(OrchestrationError::NotFound(format!("task {}", id)));
            };
            if task.status == TaskStatus::Completed {
                return Ok(());
            }

            // Clear every lane: a reassignment race may have returned the
            // task to ready while this completion was in flight.
            for lane in [
                keys::QUEUE_READY,
                keys::QUEUE_PROCESSING,
                keys::QUEUE_DELAYED,
            ] {
                self.store.zrem(lane, id).await?;
            }
            task.status = TaskStatus::Completed;
            task.completed_at = Some(Utc::now());
            task.result = Some(result);
            self.save_task(&task).await?;

            if let Some(batch_id) = task.batch_id.clone() {
                self.check_batch(&batch_id).await?;
            }
        }
        self.release_lock(id);
        Ok(())
    }

    /// Remove from processing; retry with exponential backoff while budget
    /// remains, otherwise dead-letter.
    pub async fn fail(&self, id: &str, error: &str) -> Result<(), OrchestrationError> {
        let lock = self.lock_for(id);
        let mut terminal = false;
        {
            let _guard = lock.lock().await;

            let Some(mut task) = self.task(id).await? else {
                return Err(OrchestrationError::NotFound(format!("task {}", id)));
            };
            if task.is_terminal() {
                return Ok(());
            }

            self.store.zrem(keys::QUEUE_PROCESSING, id).await?;
            task.error = Some(error.to_string());
            task.assigned_agent = None;
            task.started_at = None;

            if task.retry_count < task.constraints.max_retries {
                task.retry_count += 1;
                let delay_ms =
                    self.config.retry_delay_ms * 2u64.pow(task.retry_count.saturating_sub(1));
                let due = Utc::now() + ChronoDuration::milliseconds(delay_ms as i64);
                task.status = TaskStatus::Pending;
                task.scheduled_for = Some(due);
                self.save_task(&task).await?;
                self.store
                    .zadd(keys::QUEUE_DELAYED, id, due.timestamp_millis() as f64)
                    .await?;
                info!(task_id = %id, retry = task.retry_count, delay_ms, "task scheduled for retry");
                self.events.emit(SystemEvent::TaskRetry {
                    task_id: id.to_string(),
                    retry_count: task.retry_count,
                });
            } else {
                task.status = TaskStatus::Failed;
                task.completed_at = Some(Utc::now());
                self.save_task(&task).await?;
                if self.config.dead_letter_queue {
                    self.store
                        .zadd(keys::QUEUE_DLQ, id, Utc::now().timestamp_millis() as f64)
                        .await?;
                }
                warn!(task_id = %id, error, "task failed permanently");
                terminal = true;
            }
        }
        if terminal {
            self.release_lock(id);
        }
        Ok(())
    }

    /// Remove from whichever lane holds the task and mark it cancelled.
    /// Calling twice is equivalent to calling once.
    pub async fn cancel(&self, id: &str) -> Result<(), OrchestrationError> {
        let lock = self.lock_for(id);
        {
            let _guard = lock.lock().await;

            let Some(mut task) = self.task(id).await? else {
                return Err(OrchestrationError::NotFound(format!("task {}", id)));
            };

            for lane in [
                keys::QUEUE_READY,
                keys::QUEUE_PROCESSING,
                keys::QUEUE_DELAYED,
                keys::QUEUE_DLQ,
            ] {
                self.store.zrem(lane, id).await?;
            }

            if !task.is_terminal() {
                task.status = TaskStatus::Cancelled;
                task.completed_at = Some(Utc::now());
                task.assigned_agent = None;
                self.save_task(&task).await?;
                info!(task_id = %id, "task cancelled");
            }
        }
        self.release_lock(id);
        Ok(())
    }

    /// Return processing entries older than the visibility timeout to the
    /// ready lane with `started_at` cleared.
    pub async fn reap_stale(&self) -> Result<Vec<TaskId>, OrchestrationError> {
        let cutoff =
            (Utc::now().timestamp_millis() - self.config.visibility_timeout_ms as i64) as f64;
        let stale = self
            .store
            .zrange_by_score(keys::QUEUE_PROCESSING, 0.0, cutoff, self.config.batch_size)
            .await?;

        let mut reaped = Vec::new();
        for entry in stale {
            let lock = self.lock_for(&entry.member);
            let _guard = lock.lock().await;

            if self
                .store
                .zscore(keys::QUEUE_PROCESSING, &entry.member)
                .await?
                .is_none()
            {
                continue;
            }
            let Some(mut task) = self.task(&entry.member).await? else {
                self.store.zrem(keys::QUEUE_PROCESSING, &entry.member).await?;
                continue;
            };

            self.store.zrem(keys::QUEUE_PROCESSING, &entry.member).await?;
            task.started_at = None;
            task.assigned_agent = None;
            task.status = TaskStatus::Pending;
            self.save_task(&task).await?;
            let score = self.score(&task);
            self.store
                .zadd(keys::QUEUE_READY, &entry.member, score)
                .await?;

            warn!(task_id = %entry.member, "stale task returned to ready lane");
            self.events.emit(SystemEvent::TaskStale {
                task_id: entry.member.clone(),
            });
            reaped.push(entry.member);
        }
        Ok(reaped)
    }

    /// Move ripe delayed tasks to the ready lane.
    pub async fn promote_delayed(&self) -> Result<usize, OrchestrationError> {
        let now = Utc::now().timestamp_millis() as f64;
        let ripe = self
            .store
            .zrange_by_score(keys::QUEUE_DELAYED, 0.0, now, self.config.batch_size.max(64))
            .await?;

        let mut promoted = 0;
        for entry in ripe {
            let lock = self.lock_for(&entry.member);
            let _guard = lock.lock().await;

            if !self.store.zrem(keys::QUEUE_DELAYED, &entry.member).await? {
                continue;
            }
            let Some(task) = self.task(&entry.member).await? else {
                continue;
            };
            let score = self.score(&task);
            self.store
                .zadd(keys::QUEUE_READY, &entry.member, score)
                .await?;
            promoted += 1;
        }
        if promoted > 0 {
            debug!(promoted, "delayed tasks promoted");
        }
        Ok(promoted)
    }

    /// Park a claimed task in the delayed lane for a short hold, e.g. while
    /// its dependencies are still running.
    pub async fn defer(&self, id: &str, delay_ms: u64) -> Result<(), OrchestrationError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let Some(mut task) = self.task(id).await? else {
            return Err(OrchestrationError::NotFound(format!("task {}", id)));
        };
        for lane in [keys::QUEUE_READY, keys::QUEUE_PROCESSING] {
            self.store.zrem(lane, id).await?;
        }
        let due = Utc::now() + ChronoDuration::milliseconds(delay_ms as i64);
        task.status = TaskStatus::Pending;
        task.started_at = None;
        task.assigned_agent = None;
        task.scheduled_for = Some(due);
        self.save_task(&task).await?;
        self.store
            .zadd(keys::QUEUE_DELAYED, id, due.timestamp_millis() as f64)
            .await?;
        Ok(())
    }

    /// Requeue at the head of the task's priority class (agent loss, no
    /// candidate available).
    pub async fn push_front(&self, id: &str) -> Result<(), OrchestrationError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let Some(mut task) = self.task(id).await? else {
            return Err(OrchestrationError::NotFound(format!("task {}", id)));
        };
        for lane in [keys::QUEUE_PROCESSING, keys::QUEUE_DELAYED] {
            self.store.zrem(lane, id).await?;
        }
        task.status = TaskStatus::Pending;
        task.assigned_agent = None;
        task.started_at = None;
        self.save_task(&task).await?;
        self.store
            .zadd(keys::QUEUE_READY, id, self.head_score(&task))
            .await?;
        Ok(())
    }

    pub async fn lane_depths(&self) -> Result<LaneDepths, OrchestrationError> {
        Ok(LaneDepths {
            ready: self.store.zcard(keys::QUEUE_READY).await?,
            processing: self.store.zcard(keys::QUEUE_PROCESSING).await?,
            delayed: self.store.zcard(keys::QUEUE_DELAYED).await?,
            dead_letter: self.store.zcard(keys::QUEUE_DLQ).await?,
        })
    }

    /// Admission-relevant size: tasks waiting to run.
    pub async fn size(&self) -> Result<u64, OrchestrationError> {
        let depths = self.lane_depths().await?;
        Ok(depths.ready + depths.delayed)
    }

    /// Every task record still within its retention window.
    pub async fn tasks(&self) -> Result<Vec<Task>, OrchestrationError> {
        let mut tasks = Vec::new();
        for key in self.store.keys(keys::TASK).await? {
            if let Some(json) = self.store.get(&key).await? {
                tasks.push(serde_json::from_str(&json)?);
            }
        }
        Ok(tasks)
    }

    /// Dead-letter entries, oldest first.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<Task>, OrchestrationError> {
        let entries = self
            .store
            .zrange_by_score(keys::QUEUE_DLQ, 0.0, f64::INFINITY, limit)
            .await?;
        let mut tasks = Vec::new();
        for entry in entries {
            if let Some(task) = self.task(&entry.member).await? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    /// Move a dead-letter task back to ready with a fresh retry budget.
    pub async fn requeue_dead_letter(&self, id: &str) -> Result<(), OrchestrationError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        if !self.store.zrem(keys::QUEUE_DLQ, id).await? {
            return Err(OrchestrationError::NotFound(format!(
                "dead-letter task {}",
                id
            )));
        }
        let Some(mut task) = self.task(id).await? else {
            return Err(OrchestrationError::NotFound(format!("task {}", id)));
        };
        task.status = TaskStatus::Pending;
        task.retry_count = 0;
        task.error = None;
        task.completed_at = None;
        self.save_task(&task).await?;
        let score = self.score(&task);
        self.store.zadd(keys::QUEUE_READY, id, score).await?;
        info!(task_id = %id, "dead-letter task requeued");
        Ok(())
    }

    async fn check_batch(&self, batch_id: &str) -> Result<(), OrchestrationError> {
        let Some(json) = self.store.get(&keys::batch(batch_id)).await? else {
            return Ok(());
        };
        let members: Vec<TaskId> = serde_json::from_str(&json)?;
        for member in &members {
            match self.task(member).await? {
                Some(task) if task.is_terminal() => {}
                _ => return Ok(()),
            }
        }
        info!(batch_id, "batch completed");
        self.events.emit(SystemEvent::BatchCompleted {
            batch_id: batch_id.to_string(),
        });
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct LaneDepths {
    pub ready: u64,
    pub processing: u64,
    pub delayed: u64,
    pub dead_letter: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TaskPriority, TaskSpec};
    use state_store::MemoryStore;

    fn queue_with(config: QueueConfig) -> TaskQueue {
        TaskQueue::new(Arc::new(MemoryStore::new()), config, EventBus::new())
    }

    fn queue() -> TaskQueue {
        queue_with(QueueConfig::default())
    }

    fn task(priority: TaskPriority) -> Task {
        Task::from_spec(TaskSpec {
            id: None,
            task_type: "test".into(),
            priority,
            payload: serde_json::Value::Null,
            dependencies: vec![],
            required_capabilities: vec![],
            constraints: Default::default(),
            scheduled_for: None,
            batch_id: None,
        })
    }

    fn any_caps() -> HashSet<String> {
        HashSet::new()
    }

    #[tokio::test]
    async fn test_priority_order_and_fifo_within_class() {
        let q = queue();
        let low = task(TaskPriority::Low);
        let first_med = task(TaskPriority::Medium);
        let second_med = task(TaskPriority::Medium);
        let critical = task(TaskPriority::Critical);

        for t in [&low, &first_med, &second_med, &critical] {
            q.enqueue(t.clone()).await.unwrap();
        }

        let batch = q.dequeue_batch(4, &any_caps()).await.unwrap();
        let ids: Vec<_> = batch.iter().map(|t| t.id.clone()).collect();
        assert_eq!(
            ids,
            vec![
                critical.id.clone(),
                first_med.id.clone(),
                second_med.id.clone(),
                low.id.clone()
            ]
        );
    }

    #[tokio::test]
    async fn test_round_trip_leaves_queue_empty() {
        let q = queue();
        let t = task(TaskPriority::Medium);
        let id = q.enqueue(t).await.unwrap();

        let batch = q.dequeue_batch(1, &any_caps()).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batch[0].started_at.is_some());

        q.complete(&id, serde_json::json!({"ok": true})).await.unwrap();

        assert_eq!(q.size().await.unwrap(), 0);
        let depths = q.lane_depths().await.unwrap();
        assert_eq!(depths.processing, 0);
        let stored = q.task(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_queue_full_rejection() {
        let q = queue_with(QueueConfig {
            max_size: 2,
            ..Default::default()
        });
        q.enqueue(task(TaskPriority::Low)).await.unwrap();
        q.enqueue(task(TaskPriority::Low)).await.unwrap();
        let err = q.enqueue(task(TaskPriority::Low)).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::QueueFull(2)));
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_is_noop() {
        let q = queue();
        let t = task(TaskPriority::Medium);
        q.enqueue(t.clone()).await.unwrap();
        q.enqueue(t.clone()).await.unwrap();
        assert_eq!(q.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_capability_filter_skips_uncovered_tasks() {
        let q = queue();
        let mut needs_gpu = task(TaskPriority::High);
        needs_gpu.required_capabilities = vec!["gpu".into()];
        let plain = task(TaskPriority::Low);
        q.enqueue(needs_gpu.clone()).await.unwrap();
        q.enqueue(plain.clone()).await.unwrap();

        let caps: HashSet<String> = ["cpu".to_string()].into();
        let batch = q.dequeue_batch(2, &caps).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, plain.id);
        // The gpu task stays ready for a capable consumer.
        assert_eq!(q.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_scheduled_task_lands_in_delayed_lane() {
        let q = queue();
        let mut t = task(TaskPriority::Medium);
        t.scheduled_for = Some(Utc::now() + ChronoDuration::seconds(60));
        q.enqueue(t).await.unwrap();

        let depths = q.lane_depths().await.unwrap();
        assert_eq!(depths.delayed, 1);
        assert_eq!(depths.ready, 0);
        assert!(q.dequeue_batch(1, &any_caps()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_promote_delayed_moves_only_ripe_tasks() {
        let q = queue();
        let mut ripe = task(TaskPriority::Medium);
        ripe.scheduled_for = Some(Utc::now() - ChronoDuration::seconds(1));
        let mut future = task(TaskPriority::Medium);
        future.scheduled_for = Some(Utc::now() + ChronoDuration::seconds(120));

        // Direct lane insert: enqueue would route the ripe one to ready.
        q.save_task(&ripe).await.unwrap();
        q.store
            .zadd(
                keys::QUEUE_DELAYED,
                &ripe.id,
                ripe.scheduled_for.unwrap().timestamp_millis() as f64,
            )
            .await
            .unwrap();
        q.enqueue(future).await.unwrap();

        assert_eq!(q.promote_delayed().await.unwrap(), 1);
        let depths = q.lane_depths().await.unwrap();
        assert_eq!(depths.ready, 1);
        assert_eq!(depths.delayed, 1);
    }

    #[tokio::test]
    async fn test_fail_applies_exponential_backoff() {
        let q = queue_with(QueueConfig {
            retry_delay_ms: 1_000,
            ..Default::default()
        });
        let mut t = task(TaskPriority::Medium);
        t.constraints.max_retries = 2;
        let id = q.enqueue(t).await.unwrap();
        q.dequeue_batch(1, &any_caps()).await.unwrap();

        let before = Utc::now();
        q.fail(&id, "boom").await.unwrap();
        let after_first = q.task(&id).await.unwrap().unwrap();
        assert_eq!(after_first.retry_count, 1);
        assert_eq!(after_first.status, TaskStatus::Pending);
        let delay = after_first.scheduled_for.unwrap() - before;
        assert!(delay.num_milliseconds() >= 900 && delay.num_milliseconds() <= 1_500);

        // Second failure doubles the delay.
        q.store.zrem(keys::QUEUE_DELAYED, &id).await.unwrap();
        q.store
            .zadd(
                keys::QUEUE_PROCESSING,
                &id,
                Utc::now().timestamp_millis() as f64,
            )
            .await
            .unwrap();
        let before = Utc::now();
        q.fail(&id, "boom again").await.unwrap();
        let after_second = q.task(&id).await.unwrap().unwrap();
        assert_eq!(after_second.retry_count, 2);
        let delay = after_second.scheduled_for.unwrap() - before;
        assert!(delay.num_milliseconds() >= 1_900 && delay.num_milliseconds() <= 2_500);
    }

    #[tokio::test]
    async fn test_exhausted_retries_reach_dead_letter() {
        let q = queue();
        let mut t = task(TaskPriority::Medium);
        t.constraints.max_retries = 0;
        let id = q.enqueue(t).await.unwrap();
        q.dequeue_batch(1, &any_caps()).await.unwrap();
        q.fail(&id, "fatal").await.unwrap();

        let stored = q.task(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        let depths = q.lane_depths().await.unwrap();
        assert_eq!(depths.dead_letter, 1);
        assert_eq!(depths.ready, 0);
        assert_eq!(depths.processing, 0);

        let dlq = q.dead_letters(10).await.unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].id, id);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let q = queue();
        let id = q.enqueue(task(TaskPriority::Medium)).await.unwrap();
        q.cancel(&id).await.unwrap();
        q.cancel(&id).await.unwrap();
        let stored = q.task(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
        assert_eq!(q.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_unknown_task_is_not_found() {
        let q = queue();
        assert!(matches!(
            q.cancel("missing").await.unwrap_err(),
            OrchestrationError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_reap_stale_returns_tasks_to_ready() {
        let q = queue_with(QueueConfig {
            visibility_timeout_ms: 0,
            ..Default::default()
        });
        let id = q.enqueue(task(TaskPriority::Medium)).await.unwrap();
        q.dequeue_batch(1, &any_caps()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let reaped = q.reap_stale().await.unwrap();
        assert_eq!(reaped, vec![id.clone()]);
        let stored = q.task(&id).await.unwrap().unwrap();
        assert!(stored.started_at.is_none());
        let depths = q.lane_depths().await.unwrap();
        assert_eq!(depths.ready, 1);
        assert_eq!(depths.processing, 0);
    }

    #[tokio::test]
    async fn test_task_never_in_two_lanes() {
        let q = queue();
        let id = q.enqueue(task(TaskPriority::Medium)).await.unwrap();
        q.dequeue_batch(1, &any_caps()).await.unwrap();

        let mut lanes = 0;
        for lane in [
            keys::QUEUE_READY,
            keys::QUEUE_PROCESSING,
            keys::QUEUE_DELAYED,
            keys::QUEUE_DLQ,
        ] {
            if q.store.zscore(lane, &id).await.unwrap().is_some() {
                lanes += 1;
            }
        }
        assert_eq!(lanes, 1);
    }

    #[tokio::test]
    async fn test_requeue_dead_letter_resets_retry_budget() {
        let q = queue();
        let mut t = task(TaskPriority::Medium);
        t.constraints.max_retries = 0;
        let id = q.enqueue(t).await.unwrap();
        q.dequeue_batch(1, &any_caps()).await.unwrap();
        q.fail(&id, "fatal").await.unwrap();

        q.requeue_dead_letter(&id).await.unwrap();
        let stored = q.task(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(stored.retry_count, 0);
        let depths = q.lane_depths().await.unwrap();
        assert_eq!(depths.ready, 1);
        assert_eq!(depths.dead_letter, 0);
    }
}
