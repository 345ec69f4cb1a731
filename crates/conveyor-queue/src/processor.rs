use crate::executor::TaskExecutor;
use crate::queue::TaskQueue;
use async_trait::async_trait;
use chrono::Utc;
use conveyor_core::{
    ConveyorError, ConveyorResult, Task, TaskOutcome, TaskPayload, TaskPriority, TaskStatus,
    TaskStore, TaskSubmitter,
};
use conveyor_pool::{ResourceMonitor, WorkerPool};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Retry behaviour for failing tasks.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
        }
    }
}

/// Exponential backoff for a given zero-based attempt, capped at the
/// policy maximum.
fn compute_backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    let millis = policy
        .backoff_base
        .as_millis()
        .saturating_mul(2u128.saturating_pow(attempt))
        .min(policy.backoff_max.as_millis());
    Duration::from_millis(millis as u64)
}

/// Timing knobs for the processor.
#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    /// Hard per-task execution timeout.
    pub task_timeout: Duration,
    /// How long admission waits for a worker before re-queueing a task.
    pub acquire_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(300),
            acquire_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

struct Inner<W: Send + 'static> {
    queue: Mutex<TaskQueue>,
    pool: Arc<WorkerPool<W>>,
    executor: Arc<dyn TaskExecutor<W>>,
    store: Arc<dyn TaskStore>,
    monitor: Option<Arc<ResourceMonitor>>,
    outcome_tx: broadcast::Sender<TaskOutcome>,
    notify: Notify,
    /// Cancellation signals for in-flight executions.
    running: Mutex<HashMap<Uuid, oneshot::Sender<()>>>,
    shutting_down: AtomicBool,
    options: ProcessorOptions,
}

/// Durable FIFO/priority queue of runnable tasks.
///
/// One admission loop dequeues tasks whose dependencies are satisfied,
/// acquires a worker from the pool (the capacity bound), and spawns the
/// execution off-loop so queue processing is never blocked by a single
/// long task. Terminal outcomes are persisted and broadcast.
pub struct TaskQueueProcessor<W: Send + 'static> {
    inner: Arc<Inner<W>>,
}

impl<W: Send + 'static> Clone for TaskQueueProcessor<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: Send + 'static> TaskQueueProcessor<W> {
    pub fn new(
        pool: Arc<WorkerPool<W>>,
        executor: Arc<dyn TaskExecutor<W>>,
        store: Arc<dyn TaskStore>,
        options: ProcessorOptions,
    ) -> Self {
        Self::with_monitor(pool, executor, store, None, options)
    }

    /// Like [`new`](Self::new), optionally attaching a resource monitor;
    /// admissions pause while it reports throttle or emergency pressure.
    pub fn with_monitor(
        pool: Arc<WorkerPool<W>>,
        executor: Arc<dyn TaskExecutor<W>>,
        store: Arc<dyn TaskStore>,
        monitor: Option<Arc<ResourceMonitor>>,
        options: ProcessorOptions,
    ) -> Self {
        let (outcome_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(TaskQueue::new()),
                pool,
                executor,
                store,
                monitor,
                outcome_tx,
                notify: Notify::new(),
                running: Mutex::new(HashMap::new()),
                shutting_down: AtomicBool::new(false),
                options,
            }),
        }
    }

    /// Build a task from parts and enqueue it.
    pub async fn submit(
        &self,
        payload: TaskPayload,
        priority: TaskPriority,
        dependencies: Vec<Uuid>,
    ) -> ConveyorResult<Uuid> {
        let task = Task::new(payload)
            .with_priority(priority)
            .with_dependencies(dependencies)
            .with_max_attempts(self.inner.options.retry.max_attempts);
        self.submit_task(task).await
    }

    /// Enqueue a pre-built task (workflow and batch path).
    pub async fn submit_task(&self, task: Task) -> ConveyorResult<Uuid> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(ConveyorError::ShuttingDown);
        }
        let id = {
            let mut queue = self.inner.queue.lock().await;
            for dep in &task.dependency_ids {
                if !queue.is_known(*dep) {
                    return Err(ConveyorError::TaskNotFound(*dep));
                }
            }
            queue.add(task.clone())
        };
        self.inner.store.save(&task).await?;
        debug!(task_id = %id, kind = %task.payload.kind, "task enqueued");
        self.inner.notify.notify_one();
        Ok(id)
    }

    pub async fn get_status(&self, id: Uuid) -> ConveyorResult<TaskStatus> {
        if let Some(task) = self.inner.queue.lock().await.get(id) {
            return Ok(task.status.clone());
        }
        match self.inner.store.load(id).await? {
            Some(task) => Ok(task.status),
            None => Err(ConveyorError::TaskNotFound(id)),
        }
    }

    pub async fn get_task(&self, id: Uuid) -> ConveyorResult<Option<Task>> {
        if let Some(task) = self.inner.queue.lock().await.get(id) {
            return Ok(Some(task.clone()));
        }
        self.inner.store.load(id).await
    }

    /// Subscribe to terminal task outcomes.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskOutcome> {
        self.inner.outcome_tx.subscribe()
    }

    /// Cancel a task. Pending tasks go terminal immediately; running tasks
    /// receive a best-effort cancellation signal and report Cancelled once
    /// the execution unwinds (or Failed via timeout if it never does).
    pub async fn cancel(&self, id: Uuid) -> ConveyorResult<()> {
        let pending_cancelled = {
            let mut queue = self.inner.queue.lock().await;
            match queue.get(id) {
                Some(task) if task.status == TaskStatus::Pending => queue.record_cancelled(id),
                Some(_) => None,
                None => return Err(ConveyorError::TaskNotFound(id)),
            }
        };

        if let Some(task) = pending_cancelled {
            self.inner.store.save(&task).await?;
            self.broadcast_outcome(&task);
            self.fail_blocked_dependents(id).await?;
            self.inner.queue.lock().await.evict_terminal(id);
            self.inner.notify.notify_one();
            return Ok(());
        }

        // The signal channel is registered before worker acquisition, so a
        // running task is always reachable here, including one still parked
        // waiting for a worker.
        if let Some(signal) = self.inner.running.lock().await.remove(&id) {
            let _ = signal.send(());
            info!(task_id = %id, "cancellation signalled to running task");
        }
        Ok(())
    }

    /// Spawn the admission loop. Runs until [`shutdown`](Self::shutdown).
    pub fn spawn_admission_loop(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.admission_loop().await })
    }

    async fn admission_loop(&self) {
        info!("admission loop started");
        loop {
            if self.inner.shutting_down.load(Ordering::SeqCst) {
                break;
            }

            if let Some(monitor) = &self.inner.monitor {
                if monitor.should_throttle().await {
                    warn!("resource pressure, pausing admissions");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
            }

            let next = {
                let mut queue = self.inner.queue.lock().await;
                queue.pop_ready(Utc::now())
            };

            match next {
                Some(task) => self.admit(task).await,
                None => self.wait_for_work().await,
            }
        }
        info!("admission loop stopped");
    }

    /// Sleep until new work arrives or the earliest retry backoff is due.
    async fn wait_for_work(&self) {
        let earliest = { self.inner.queue.lock().await.earliest_retry() };
        let sleep_for = earliest
            .and_then(|due| due.signed_duration_since(Utc::now()).to_std().ok())
            .unwrap_or(Duration::from_millis(200));
        tokio::select! {
            _ = self.inner.notify.notified() => {}
            _ = tokio::time::sleep(sleep_for) => {}
        }
    }

    async fn admit(&self, task: Task) {
        // Register the cancellation channel before acquiring a worker: the
        // task is already marked Running, and acquisition can park for the
        // full acquire timeout under a saturated pool. A cancel arriving in
        // that window must land somewhere.
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        self.inner.running.lock().await.insert(task.id, cancel_tx);

        let pooled = match self.inner.pool.acquire(self.inner.options.acquire_timeout).await {
            Ok(pooled) => pooled,
            Err(e) => {
                self.inner.running.lock().await.remove(&task.id);
                if cancel_rx.try_recv().is_ok() {
                    self.finish_cancelled(task.id).await;
                    return;
                }
                // Saturated or shutting down: give the slot back untouched.
                warn!(task_id = %task.id, error = %e, "worker acquisition failed, re-queueing");
                self.inner.queue.lock().await.unadmit(task.id);
                if matches!(e, ConveyorError::ShuttingDown) {
                    self.inner.shutting_down.store(true, Ordering::SeqCst);
                }
                return;
            }
        };

        if let Err(e) = self.inner.store.save(&task).await {
            warn!(task_id = %task.id, error = %e, "failed to persist running status");
        }

        let this = self.clone();
        tokio::spawn(async move {
            this.execute_task(task, pooled, cancel_rx).await;
        });
    }

    async fn execute_task(
        &self,
        task: Task,
        mut pooled: conveyor_pool::PooledWorker<W>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let task_id = task.id;

        // Cancelled while parked waiting for a worker: the worker was never
        // used, so it goes straight back to the idle set.
        if cancel_rx.try_recv().is_ok() {
            self.inner.pool.release(pooled).await;
            self.finish_cancelled(task_id).await;
            self.inner.notify.notify_one();
            return;
        }

        debug!(task_id = %task_id, attempt = task.attempt_count, "executing task");

        let outcome = {
            let exec = tokio::time::timeout(
                self.inner.options.task_timeout,
                self.inner.executor.execute(&mut pooled.worker, &task.payload),
            );
            tokio::pin!(exec);
            tokio::select! {
                result = &mut exec => Some(result),
                _ = cancel_rx => None,
            }
        };

        self.inner.running.lock().await.remove(&task_id);

        match outcome {
            Some(Ok(Ok(value))) => {
                self.inner.pool.release(pooled).await;
                self.finish_success(task_id, value).await;
            }
            Some(Ok(Err(e))) => {
                // The worker may be wedged after an executor error.
                self.inner.pool.recycle(pooled).await;
                self.finish_failure(task_id, &task, &e.to_string()).await;
            }
            Some(Err(_elapsed)) => {
                self.inner.pool.recycle(pooled).await;
                let reason = format!(
                    "execution timed out after {:?}",
                    self.inner.options.task_timeout
                );
                self.finish_failure(task_id, &task, &reason).await;
            }
            None => {
                self.inner.pool.recycle(pooled).await;
                self.finish_cancelled(task_id).await;
            }
        }

        self.inner.notify.notify_one();
    }

    async fn finish_success(&self, task_id: Uuid, value: serde_json::Value) {
        let updated = { self.inner.queue.lock().await.record_success(task_id, value) };
        if let Some(task) = updated {
            info!(task_id = %task_id, "task succeeded");
            if let Err(e) = self.inner.store.save(&task).await {
                warn!(task_id = %task_id, error = %e, "failed to persist success");
            }
            self.broadcast_outcome(&task);
            self.inner.queue.lock().await.evict_terminal(task_id);
        }
    }

    async fn finish_cancelled(&self, task_id: Uuid) {
        let cancelled = { self.inner.queue.lock().await.record_cancelled(task_id) };
        if let Some(task) = cancelled {
            info!(task_id = %task_id, "task cancelled");
            if let Err(e) = self.inner.store.save(&task).await {
                warn!(task_id = %task_id, error = %e, "failed to persist cancellation");
            }
            self.broadcast_outcome(&task);
            if let Err(e) = self.fail_blocked_dependents(task_id).await {
                warn!(task_id = %task_id, error = %e, "failed to cascade cancellation");
            }
            self.inner.queue.lock().await.evict_terminal(task_id);
        }
    }

    async fn finish_failure(&self, task_id: Uuid, task: &Task, reason: &str) {
        // attempt_count was incremented on admission; zero-based backoff slot.
        let backoff = compute_backoff(
            &self.inner.options.retry,
            task.attempt_count.saturating_sub(1),
        );
        let retry_after = Utc::now()
            + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::seconds(1));

        let recorded = {
            let mut queue = self.inner.queue.lock().await;
            queue.record_failure(task_id, reason, Some(retry_after))
        };

        match recorded {
            Some((task, true)) => {
                warn!(
                    task_id = %task_id,
                    attempt = task.attempt_count,
                    max = task.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    reason,
                    "task failed, retrying with backoff"
                );
                if let Err(e) = self.inner.store.save(&task).await {
                    warn!(task_id = %task_id, error = %e, "failed to persist retry state");
                }
            }
            Some((task, false)) => {
                error!(task_id = %task_id, reason, "task failed terminally");
                if let Err(e) = self.inner.store.save(&task).await {
                    warn!(task_id = %task_id, error = %e, "failed to persist terminal failure");
                }
                self.broadcast_outcome(&task);
                if let Err(e) = self.fail_blocked_dependents(task_id).await {
                    warn!(task_id = %task_id, error = %e, "failed to cascade dependency failure");
                }
                self.inner.queue.lock().await.evict_terminal(task_id);
            }
            None => {}
        }
    }

    /// Terminally fail standalone tasks whose dependency chain can no
    /// longer succeed. Never drops them silently.
    async fn fail_blocked_dependents(&self, root: Uuid) -> ConveyorResult<()> {
        let failed: Vec<Task> = {
            let mut queue = self.inner.queue.lock().await;
            let blocked = queue.blocked_standalone_dependents(root);
            blocked
                .into_iter()
                .filter_map(|id| {
                    queue.mark_failed(id, format!("dependency {root} did not succeed"))
                })
                .collect()
        };
        for task in &failed {
            self.inner.store.save(task).await?;
            self.broadcast_outcome(task);
        }
        if !failed.is_empty() {
            let mut queue = self.inner.queue.lock().await;
            for task in &failed {
                queue.evict_terminal(task.id);
            }
        }
        Ok(())
    }

    fn broadcast_outcome(&self, task: &Task) {
        let _ = self.inner.outcome_tx.send(TaskOutcome {
            task_id: task.id,
            status: task.status.clone(),
            workflow_instance: task.workflow_instance,
            result: task.result.clone(),
        });
    }

    /// Cooperative shutdown: stop admissions, signal cancellation to
    /// in-flight tasks, wait up to `grace` for them to unwind, then release
    /// all pool handles.
    pub async fn shutdown(&self, grace: Duration) {
        info!("processor shutting down");
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();

        {
            let mut running = self.inner.running.lock().await;
            for (id, signal) in running.drain() {
                debug!(task_id = %id, "signalling cancellation for shutdown");
                let _ = signal.send(());
            }
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let in_flight = { self.inner.queue.lock().await.running_ids().len() };
            if in_flight == 0 || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        self.inner.pool.shutdown().await;
    }
}

#[async_trait]
impl<W: Send + 'static> TaskSubmitter for TaskQueueProcessor<W> {
    async fn submit(&self, task: Task) -> ConveyorResult<Uuid> {
        self.submit_task(task).await
    }

    async fn status(&self, id: Uuid) -> ConveyorResult<TaskStatus> {
        self.get_status(id).await
    }

    async fn cancel(&self, id: Uuid) -> ConveyorResult<()> {
        TaskQueueProcessor::cancel(self, id).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        };
        assert_eq!(compute_backoff(&policy, 0), Duration::from_millis(500));
        assert_eq!(compute_backoff(&policy, 1), Duration::from_millis(1000));
        assert_eq!(compute_backoff(&policy, 2), Duration::from_millis(2000));
        assert_eq!(compute_backoff(&policy, 3), Duration::from_millis(4000));
        assert_eq!(compute_backoff(&policy, 10), Duration::from_secs(30));
    }
}
