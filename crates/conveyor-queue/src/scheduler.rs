use chrono::{DateTime, Utc};
use conveyor_core::{
    ConveyorError, ConveyorResult, MemoryRecordStore, RecordStore, Task, TaskPayload,
    TaskPriority, TaskSubmitter,
};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// When a scheduled definition fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Fire once at the given instant (immediately if already past).
    OneTime(DateTime<Utc>),
    /// Fire on a 7-field cron expression: sec min hour dom month dow year.
    Recurring(String),
    /// Fire when [`TaskScheduler::notify_event`] is called with this name.
    OnEvent(String),
    /// Fire only via [`TaskScheduler::fire_now`].
    OnDemand,
}

/// Factory for the tasks a definition produces on each fire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub payload: TaskPayload,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    3
}

impl TaskTemplate {
    pub fn new(payload: TaskPayload) -> Self {
        Self {
            payload,
            priority: TaskPriority::Normal,
            max_attempts: default_max_attempts(),
        }
    }

    pub fn materialize(&self) -> Task {
        Task::new(self.payload.clone())
            .with_priority(self.priority)
            .with_max_attempts(self.max_attempts)
    }
}

/// Append-only record of one past fire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FireRecord {
    pub fired_at: DateTime<Utc>,
    pub task_id: Uuid,
}

/// A scheduled source of tasks. Single-writer: only the scheduler mutates
/// one of these after registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTaskDefinition {
    pub id: Uuid,
    pub trigger: Trigger,
    pub template: TaskTemplate,
    pub enabled: bool,
    pub max_executions: Option<u32>,
    pub execution_count: u32,
    pub history: Vec<FireRecord>,
    /// Next heap-scheduled fire, if any. Event/demand triggers stay `None`.
    pub next_fire: Option<DateTime<Utc>>,
}

struct SchedulerState {
    defs: HashMap<Uuid, ScheduledTaskDefinition>,
    /// Min-heap of `(next_fire, definition id)`. Entries go stale when a
    /// definition is disabled or removed; staleness is checked at pop.
    heap: BinaryHeap<Reverse<(DateTime<Utc>, Uuid)>>,
}

/// Fires scheduled task definitions into the queue processor.
///
/// A single tick loop sleeps until the nearest heap deadline rather than
/// polling on a fixed interval, waking early when registrations change.
pub struct TaskScheduler {
    state: Mutex<SchedulerState>,
    submitter: Arc<dyn TaskSubmitter>,
    store: Arc<dyn RecordStore<ScheduledTaskDefinition>>,
    notify: Notify,
    shutting_down: AtomicBool,
}

impl TaskScheduler {
    pub fn new(submitter: Arc<dyn TaskSubmitter>) -> Self {
        Self::with_store(submitter, Arc::new(MemoryRecordStore::new()))
    }

    /// Like [`new`](Self::new) with a durable definition store; every
    /// mutation is written through, and [`restore`](Self::restore) reloads
    /// definitions after a restart.
    pub fn with_store(
        submitter: Arc<dyn TaskSubmitter>,
        store: Arc<dyn RecordStore<ScheduledTaskDefinition>>,
    ) -> Self {
        Self {
            state: Mutex::new(SchedulerState {
                defs: HashMap::new(),
                heap: BinaryHeap::new(),
            }),
            submitter,
            store,
            notify: Notify::new(),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Reload persisted definitions into an empty scheduler. Stored
    /// deadlines already in the past fire promptly, one catch-up fire per
    /// definition.
    pub async fn restore(&self) -> ConveyorResult<usize> {
        let defs = self.store.load_all().await?;
        let count = defs.len();
        {
            let mut state = self.state.lock().await;
            for def in defs {
                if def.enabled {
                    if let Some(at) = def.next_fire {
                        state.heap.push(Reverse((at, def.id)));
                    }
                }
                state.defs.insert(def.id, def);
            }
        }
        self.notify.notify_waiters();
        info!(count, "scheduled definitions restored");
        Ok(count)
    }

    /// Parse a 7-field cron expression, rejecting invalid ones at
    /// registration time rather than at fire time.
    pub fn parse_cron(expr: &str) -> ConveyorResult<Schedule> {
        Schedule::from_str(expr)
            .map_err(|e| ConveyorError::InvalidSchedule(format!("'{expr}': {e}")))
    }

    /// Next occurrence of a cron expression after now.
    pub fn next_fire_time(expr: &str) -> ConveyorResult<DateTime<Utc>> {
        let schedule = Self::parse_cron(expr)?;
        schedule.upcoming(Utc).next().ok_or_else(|| {
            ConveyorError::InvalidSchedule(format!("'{expr}' has no upcoming fire times"))
        })
    }

    /// Register a definition. Cron expressions are validated here.
    pub async fn register(
        &self,
        trigger: Trigger,
        template: TaskTemplate,
        max_executions: Option<u32>,
    ) -> ConveyorResult<Uuid> {
        let next_fire = match &trigger {
            Trigger::OneTime(at) => Some(*at),
            Trigger::Recurring(expr) => Some(Self::next_fire_time(expr)?),
            Trigger::OnEvent(_) | Trigger::OnDemand => None,
        };

        let def = ScheduledTaskDefinition {
            id: Uuid::new_v4(),
            trigger,
            template,
            enabled: true,
            max_executions,
            execution_count: 0,
            history: Vec::new(),
            next_fire,
        };
        let id = def.id;
        self.store.put(&id.to_string(), &def).await?;

        {
            let mut state = self.state.lock().await;
            if let Some(at) = next_fire {
                state.heap.push(Reverse((at, id)));
            }
            state.defs.insert(id, def);
        }
        debug!(definition_id = %id, "scheduled definition registered");
        self.notify.notify_waiters();
        Ok(id)
    }

    /// Enable or disable a definition. Disabling leaves stale heap entries
    /// behind; they are skipped at pop. Re-enabling recomputes the next fire.
    pub async fn set_enabled(&self, id: Uuid, enabled: bool) -> ConveyorResult<()> {
        let mut state = self.state.lock().await;
        let def = state
            .defs
            .get_mut(&id)
            .ok_or(ConveyorError::TaskNotFound(id))?;
        def.enabled = enabled;
        let reinsert = if enabled {
            let next = match &def.trigger {
                Trigger::Recurring(expr) => Some(Self::next_fire_time(expr)?),
                Trigger::OneTime(at) if def.execution_count == 0 => Some(*at),
                _ => None,
            };
            def.next_fire = next;
            next
        } else {
            def.next_fire = None;
            None
        };
        let snapshot = def.clone();
        if let Some(at) = reinsert {
            state.heap.push(Reverse((at, id)));
        }
        drop(state);
        self.store.put(&id.to_string(), &snapshot).await?;
        self.notify.notify_waiters();
        Ok(())
    }

    /// Remove a definition. If it is mid-fire, the fire completes and the
    /// definition is simply never re-inserted.
    pub async fn remove(&self, id: Uuid) -> ConveyorResult<()> {
        self.state
            .lock()
            .await
            .defs
            .remove(&id)
            .ok_or(ConveyorError::TaskNotFound(id))?;
        self.store.remove(&id.to_string()).await?;
        self.notify.notify_waiters();
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Option<ScheduledTaskDefinition> {
        self.state.lock().await.defs.get(&id).cloned()
    }

    pub async fn definition_count(&self) -> usize {
        self.state.lock().await.defs.len()
    }

    /// Fire every enabled ON_EVENT definition matching `name`, synchronously.
    /// Returns the ids of the tasks created.
    pub async fn notify_event(&self, name: &str) -> Vec<Uuid> {
        let due: Vec<Uuid> = {
            let state = self.state.lock().await;
            state
                .defs
                .values()
                .filter(|d| {
                    d.enabled && matches!(&d.trigger, Trigger::OnEvent(n) if n == name)
                })
                .map(|d| d.id)
                .collect()
        };
        let mut fired = Vec::new();
        for id in due {
            if let Some(task_id) = self.fire_definition(id).await {
                fired.push(task_id);
            }
        }
        fired
    }

    /// Fire a definition immediately (the ON_DEMAND path, also usable for
    /// manual runs of any enabled definition).
    pub async fn fire_now(&self, id: Uuid) -> ConveyorResult<Uuid> {
        {
            let state = self.state.lock().await;
            let def = state.defs.get(&id).ok_or(ConveyorError::TaskNotFound(id))?;
            if !def.enabled {
                return Err(ConveyorError::InvalidSchedule(format!(
                    "definition {id} is disabled"
                )));
            }
        }
        self.fire_definition(id)
            .await
            .ok_or_else(|| ConveyorError::TaskNotFound(id))
    }

    /// Spawn the tick loop. Runs until [`shutdown`](Self::shutdown).
    pub fn spawn_tick_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.tick_loop().await })
    }

    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn tick_loop(&self) {
        info!("scheduler tick loop started");
        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                break;
            }

            let next = self.peek_next_deadline().await;
            match next {
                None => {
                    // Nothing heap-scheduled; sleep until a registration wakes us.
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(std::time::Duration::from_secs(60)) => {}
                    }
                }
                Some((when, id)) => {
                    let now = Utc::now();
                    if when > now {
                        let wait = (when - now).to_std().unwrap_or_default();
                        tokio::select! {
                            _ = tokio::time::sleep(wait) => {}
                            // A registration may have introduced an earlier
                            // deadline; re-evaluate.
                            _ = self.notify.notified() => { continue; }
                        }
                    }
                    if self.take_due_entry(when, id).await {
                        self.fire_definition(id).await;
                    }
                }
            }
        }
        info!("scheduler tick loop stopped");
    }

    /// Earliest live heap entry, discarding stale ones.
    async fn peek_next_deadline(&self) -> Option<(DateTime<Utc>, Uuid)> {
        let mut state = self.state.lock().await;
        loop {
            let &Reverse((when, id)) = state.heap.peek()?;
            let live = state
                .defs
                .get(&id)
                .map_or(false, |d| d.enabled && d.next_fire == Some(when));
            if live {
                return Some((when, id));
            }
            state.heap.pop();
        }
    }

    /// Pop the entry if it is still the live head; the heap may have
    /// changed while the tick loop slept.
    async fn take_due_entry(&self, when: DateTime<Utc>, id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        match state.heap.peek() {
            Some(&Reverse((w, i))) if w == when && i == id => {
                state.heap.pop();
                state
                    .defs
                    .get(&id)
                    .map_or(false, |d| d.enabled && d.next_fire == Some(when))
            }
            _ => false,
        }
    }

    /// Materialize and submit one task for the definition, then advance its
    /// schedule. Returns the created task id.
    async fn fire_definition(&self, id: Uuid) -> Option<Uuid> {
        let template = {
            let state = self.state.lock().await;
            let def = state.defs.get(&id)?;
            if !def.enabled {
                return None;
            }
            def.template.clone()
        };

        let task = template.materialize();
        let task_id = task.id;
        if let Err(e) = self.submitter.submit(task).await {
            warn!(definition_id = %id, error = %e, "scheduled fire failed to submit");
            return None;
        }
        info!(definition_id = %id, task_id = %task_id, "scheduled definition fired");

        let mut state = self.state.lock().await;
        // Removed mid-fire: the fire completed, nothing to re-insert.
        let Some(def) = state.defs.get_mut(&id) else {
            return Some(task_id);
        };
        def.execution_count += 1;
        def.history.push(FireRecord {
            fired_at: Utc::now(),
            task_id,
        });

        let exhausted = def
            .max_executions
            .map_or(false, |max| def.execution_count >= max);
        let mut reinsert = None;
        if exhausted {
            def.enabled = false;
            def.next_fire = None;
            info!(definition_id = %id, "definition reached max executions, disabled");
        } else {
            match def.trigger.clone() {
                Trigger::Recurring(expr) => match Self::next_fire_time(&expr) {
                    Ok(next) => {
                        def.next_fire = Some(next);
                        reinsert = Some(next);
                    }
                    Err(e) => {
                        // Validated at registration; only reachable if the
                        // expression has run out of occurrences.
                        warn!(definition_id = %id, error = %e, "no further occurrences");
                        def.next_fire = None;
                    }
                },
                Trigger::OneTime(_) => {
                    def.enabled = false;
                    def.next_fire = None;
                }
                Trigger::OnEvent(_) | Trigger::OnDemand => {
                    def.next_fire = None;
                }
            }
        }
        let snapshot = def.clone();
        if let Some(next) = reinsert {
            state.heap.push(Reverse((next, id)));
        }
        drop(state);
        if let Err(e) = self.store.put(&id.to_string(), &snapshot).await {
            warn!(definition_id = %id, error = %e, "failed to persist definition state");
        }
        self.notify.notify_waiters();
        Some(task_id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conveyor_core::TaskStatus;

    /// Submitter that records every task it receives.
    struct RecordingSubmitter {
        submitted: Mutex<Vec<Task>>,
    }

    impl RecordingSubmitter {
        fn new() -> Self {
            Self {
                submitted: Mutex::new(Vec::new()),
            }
        }

        async fn count(&self) -> usize {
            self.submitted.lock().await.len()
        }
    }

    #[async_trait]
    impl TaskSubmitter for RecordingSubmitter {
        async fn submit(&self, task: Task) -> ConveyorResult<Uuid> {
            let id = task.id;
            self.submitted.lock().await.push(task);
            Ok(id)
        }

        async fn status(&self, _id: Uuid) -> ConveyorResult<TaskStatus> {
            Ok(TaskStatus::Pending)
        }

        async fn cancel(&self, _id: Uuid) -> ConveyorResult<()> {
            Ok(())
        }
    }

    fn template() -> TaskTemplate {
        TaskTemplate::new(TaskPayload::new("scrape", serde_json::json!({"page": 1})))
    }

    #[tokio::test]
    async fn test_invalid_cron_rejected_at_registration() {
        let scheduler = TaskScheduler::new(Arc::new(RecordingSubmitter::new()));
        let result = scheduler
            .register(
                Trigger::Recurring("not a cron expression".into()),
                template(),
                None,
            )
            .await;
        assert!(matches!(result, Err(ConveyorError::InvalidSchedule(_))));
        assert_eq!(scheduler.definition_count().await, 0);
    }

    #[tokio::test]
    async fn test_one_time_in_past_fires_immediately() {
        let submitter = Arc::new(RecordingSubmitter::new());
        let scheduler = Arc::new(TaskScheduler::new(
            submitter.clone() as Arc<dyn TaskSubmitter>
        ));
        let handle = scheduler.spawn_tick_loop();

        let id = scheduler
            .register(
                Trigger::OneTime(Utc::now() - chrono::Duration::seconds(5)),
                template(),
                None,
            )
            .await
            .unwrap();

        // Give the tick loop a moment.
        for _ in 0..50 {
            if submitter.count().await == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(submitter.count().await, 1);

        let def = scheduler.get(id).await.unwrap();
        assert!(!def.enabled);
        assert_eq!(def.execution_count, 1);
        assert_eq!(def.history.len(), 1);

        scheduler.shutdown();
        handle.abort();
    }

    #[tokio::test]
    async fn test_recurring_respects_max_executions() {
        let submitter = Arc::new(RecordingSubmitter::new());
        let scheduler = Arc::new(TaskScheduler::new(
            submitter.clone() as Arc<dyn TaskSubmitter>
        ));
        let handle = scheduler.spawn_tick_loop();

        // Every second, at most three fires.
        let id = scheduler
            .register(Trigger::Recurring("* * * * * * *".into()), template(), Some(3))
            .await
            .unwrap();

        for _ in 0..120 {
            let def = scheduler.get(id).await.unwrap();
            if !def.enabled {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }

        // Exactly three tasks, then disabled and never re-inserted.
        assert_eq!(submitter.count().await, 3);
        let def = scheduler.get(id).await.unwrap();
        assert!(!def.enabled);
        assert_eq!(def.execution_count, 3);
        assert!(def.next_fire.is_none());

        tokio::time::sleep(std::time::Duration::from_millis(1200)).await;
        assert_eq!(submitter.count().await, 3);

        scheduler.shutdown();
        handle.abort();
    }

    #[tokio::test]
    async fn test_on_event_fires_synchronously() {
        let submitter = Arc::new(RecordingSubmitter::new());
        let scheduler = TaskScheduler::new(submitter.clone() as Arc<dyn TaskSubmitter>);

        let id = scheduler
            .register(Trigger::OnEvent("inbox-updated".into()), template(), None)
            .await
            .unwrap();

        let fired = scheduler.notify_event("inbox-updated").await;
        assert_eq!(fired.len(), 1);
        assert_eq!(submitter.count().await, 1);

        // Unrelated events do not fire it.
        assert!(scheduler.notify_event("other-event").await.is_empty());

        // Disabled definitions are skipped.
        scheduler.set_enabled(id, false).await.unwrap();
        assert!(scheduler.notify_event("inbox-updated").await.is_empty());
    }

    #[tokio::test]
    async fn test_fire_now_on_demand() {
        let submitter = Arc::new(RecordingSubmitter::new());
        let scheduler = TaskScheduler::new(submitter.clone() as Arc<dyn TaskSubmitter>);

        let id = scheduler
            .register(Trigger::OnDemand, template(), None)
            .await
            .unwrap();
        let task_id = scheduler.fire_now(id).await.unwrap();
        assert_eq!(submitter.submitted.lock().await[0].id, task_id);

        scheduler.set_enabled(id, false).await.unwrap();
        assert!(scheduler.fire_now(id).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_mid_lifecycle_is_safe() {
        let submitter = Arc::new(RecordingSubmitter::new());
        let scheduler = TaskScheduler::new(submitter as Arc<dyn TaskSubmitter>);

        let id = scheduler
            .register(Trigger::Recurring("0 0 0 1 1 * 2099".into()), template(), None)
            .await
            .unwrap();
        scheduler.remove(id).await.unwrap();
        assert!(scheduler.get(id).await.is_none());
        // Stale heap entry is skipped, not an error.
        assert!(scheduler.peek_next_deadline().await.is_none());
    }

    #[test]
    fn test_parse_cron_valid_and_invalid() {
        assert!(TaskScheduler::parse_cron("0 * * * * * *").is_ok());
        assert!(TaskScheduler::parse_cron("bogus").is_err());
    }

    #[tokio::test]
    async fn test_definitions_survive_restart() {
        let store: Arc<MemoryRecordStore<ScheduledTaskDefinition>> =
            Arc::new(MemoryRecordStore::new());
        let submitter = Arc::new(RecordingSubmitter::new());
        let scheduler =
            TaskScheduler::with_store(submitter.clone() as Arc<dyn TaskSubmitter>, store.clone());

        let on_demand = scheduler
            .register(Trigger::OnDemand, template(), None)
            .await
            .unwrap();
        let recurring = scheduler
            .register(Trigger::Recurring("0 0 0 1 1 * 2099".into()), template(), None)
            .await
            .unwrap();
        scheduler.fire_now(on_demand).await.unwrap();

        // Fresh scheduler against the same store, as after a restart.
        let revived = TaskScheduler::with_store(
            Arc::new(RecordingSubmitter::new()) as Arc<dyn TaskSubmitter>,
            store,
        );
        assert_eq!(revived.restore().await.unwrap(), 2);

        let def = revived.get(on_demand).await.unwrap();
        assert_eq!(def.execution_count, 1);
        assert_eq!(def.history.len(), 1);

        // The recurring deadline is back on the heap.
        let (when, id) = revived.peek_next_deadline().await.unwrap();
        assert_eq!(id, recurring);
        assert_eq!(Some(when), revived.get(recurring).await.unwrap().next_fire);
    }

    #[tokio::test]
    async fn test_removed_definition_leaves_no_record() {
        let store: Arc<MemoryRecordStore<ScheduledTaskDefinition>> =
            Arc::new(MemoryRecordStore::new());
        let scheduler = TaskScheduler::with_store(
            Arc::new(RecordingSubmitter::new()) as Arc<dyn TaskSubmitter>,
            store.clone(),
        );

        let id = scheduler
            .register(Trigger::OnDemand, template(), None)
            .await
            .unwrap();
        assert!(store.get(&id.to_string()).await.unwrap().is_some());

        scheduler.remove(id).await.unwrap();
        assert!(store.get(&id.to_string()).await.unwrap().is_none());
    }
}
