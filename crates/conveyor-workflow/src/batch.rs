use chrono::{DateTime, Utc};
use conveyor_core::{ConveyorError, ConveyorResult, TaskStatus, TaskSubmitter};
use conveyor_queue::TaskTemplate;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// A fan-out batch: the member task ids created from one template.
#[derive(Debug, Clone)]
pub struct BatchRecord {
    pub id: Uuid,
    pub member_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Aggregated batch outcome; queryable before all members finish.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResult {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub complete: bool,
}

/// Fans one task template out over a list of items and aggregates the
/// member outcomes.
pub struct BatchTaskProcessor {
    submitter: Arc<dyn TaskSubmitter>,
    batches: Mutex<HashMap<Uuid, BatchRecord>>,
}

impl BatchTaskProcessor {
    pub fn new(submitter: Arc<dyn TaskSubmitter>) -> Self {
        Self {
            submitter,
            batches: Mutex::new(HashMap::new()),
        }
    }

    /// Submit one task per item, with the item substituted into
    /// `params["item"]`. All members are independent; the pool provides the
    /// only throttle.
    pub async fn create_batch(
        &self,
        template: TaskTemplate,
        items: Vec<serde_json::Value>,
    ) -> ConveyorResult<Uuid> {
        if items.is_empty() {
            return Err(ConveyorError::Config(
                "batch requires at least one item".into(),
            ));
        }

        let batch_id = Uuid::new_v4();
        let mut member_ids = Vec::with_capacity(items.len());
        for item in items {
            let mut member = template.clone();
            match &mut member.payload.params {
                serde_json::Value::Object(params) => {
                    params.insert("item".into(), item);
                }
                params => {
                    *params = serde_json::json!({ "item": item });
                }
            }
            let task = member.materialize();
            let task_id = self.submitter.submit(task).await?;
            member_ids.push(task_id);
        }

        info!(batch_id = %batch_id, members = member_ids.len(), "batch created");
        self.batches.lock().await.insert(
            batch_id,
            BatchRecord {
                id: batch_id,
                member_ids,
                created_at: Utc::now(),
            },
        );
        Ok(batch_id)
    }

    pub async fn member_ids(&self, batch_id: Uuid) -> ConveyorResult<Vec<Uuid>> {
        self.batches
            .lock()
            .await
            .get(&batch_id)
            .map(|record| record.member_ids.clone())
            .ok_or(ConveyorError::TaskNotFound(batch_id))
    }

    /// Counts so far; `complete` flips once every member is terminal.
    pub async fn batch_result(&self, batch_id: Uuid) -> ConveyorResult<BatchResult> {
        let member_ids = self.member_ids(batch_id).await?;
        let total = member_ids.len();
        let mut succeeded = 0;
        let mut failed = 0;
        let mut terminal = 0;
        for id in member_ids {
            match self.submitter.status(id).await? {
                TaskStatus::Succeeded => {
                    succeeded += 1;
                    terminal += 1;
                }
                TaskStatus::Failed { .. } | TaskStatus::Cancelled => {
                    failed += 1;
                    terminal += 1;
                }
                TaskStatus::Pending | TaskStatus::Running => {}
            }
        }

        let result = BatchResult {
            total,
            succeeded,
            failed,
            success_rate: succeeded as f64 / total as f64,
            complete: terminal == total,
        };
        debug!(batch_id = %batch_id, ?result, "batch queried");
        Ok(result)
    }
}
