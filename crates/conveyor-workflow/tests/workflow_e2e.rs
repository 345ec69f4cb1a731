//! Workflow and batch scenarios against a real queue processor and pool.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use conveyor_core::{
    ConveyorError, ConveyorResult, MemoryTaskStore, TaskPayload, TaskSubmitter,
};
use conveyor_pool::{WorkerFactory, WorkerPool};
use conveyor_queue::{
    ProcessorOptions, RetryPolicy, TaskExecutor, TaskQueueProcessor, TaskTemplate,
};
use conveyor_workflow::{
    BatchTaskProcessor, EdgeKind, ExecutionPolicy, InstanceStatus, NodeRunStatus,
    WorkflowDefinition, WorkflowOrchestrator,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

struct TestWorker;

struct TestFactory;

#[async_trait]
impl WorkerFactory<TestWorker> for TestFactory {
    async fn create(&self) -> ConveyorResult<TestWorker> {
        Ok(TestWorker)
    }

    async fn probe(&self, _worker: &mut TestWorker) -> bool {
        true
    }

    async fn destroy(&self, _worker: TestWorker) {}
}

/// Succeeds echoing the payload, except kinds named `fail` and, for
/// batches, items whose value appears in `params.fail_items`. Records the
/// order in which tasks ran.
struct ScriptedExecutor {
    ran_kinds: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    fn new() -> Self {
        Self {
            ran_kinds: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl TaskExecutor<TestWorker> for ScriptedExecutor {
    async fn execute(
        &self,
        _worker: &mut TestWorker,
        payload: &TaskPayload,
    ) -> ConveyorResult<serde_json::Value> {
        self.ran_kinds.lock().await.push(payload.kind.clone());
        if payload.kind == "fail" {
            return Err(ConveyorError::TaskExecutionFailed("scripted failure".into()));
        }
        if let Some(fail_items) = payload.params.get("fail_items").and_then(|v| v.as_array()) {
            if let Some(item) = payload.params.get("item") {
                if fail_items.contains(item) {
                    return Err(ConveyorError::TaskExecutionFailed(format!(
                        "scripted failure for item {item}"
                    )));
                }
            }
        }
        Ok(serde_json::json!({"echo": payload.params}))
    }
}

struct Harness {
    processor: TaskQueueProcessor<TestWorker>,
    orchestrator: Arc<WorkflowOrchestrator>,
    executor: Arc<ScriptedExecutor>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Harness {
    fn start(max_workers: usize) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let executor = Arc::new(ScriptedExecutor::new());
        let pool = Arc::new(WorkerPool::new(Arc::new(TestFactory), max_workers));
        let options = ProcessorOptions {
            task_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                max_attempts: 1,
                backoff_base: Duration::from_millis(10),
                backoff_max: Duration::from_millis(50),
            },
        };
        let processor = TaskQueueProcessor::new(
            pool,
            executor.clone(),
            Arc::new(MemoryTaskStore::new()),
            options,
        );
        let admission = processor.spawn_admission_loop();

        let submitter: Arc<dyn TaskSubmitter> = Arc::new(processor.clone());
        let orchestrator = WorkflowOrchestrator::new(submitter);
        let listener = orchestrator.spawn_outcome_listener(processor.subscribe());

        Self {
            processor,
            orchestrator,
            executor,
            handles: vec![admission, listener],
        }
    }

    async fn wait_for_resolution(&self, instance_id: uuid::Uuid) -> InstanceStatus {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let instance = self.orchestrator.get_instance(instance_id).await.unwrap();
            if instance.status != InstanceStatus::Running {
                return instance.status;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "instance {instance_id} did not resolve in time"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn stop(self) {
        self.processor.shutdown(Duration::from_secs(1)).await;
        for handle in self.handles {
            handle.abort();
        }
    }
}

fn payload(kind: &str) -> TaskPayload {
    TaskPayload::new(kind, serde_json::json!({}))
}

#[tokio::test]
async fn test_chain_completes_in_order() {
    let harness = Harness::start(4);

    let def = WorkflowDefinition::new("login-flow")
        .with_node("open", payload("open"))
        .with_node("login", payload("login"))
        .with_node("verify", payload("verify"))
        .with_edge("open", "login", EdgeKind::RequiresSuccess)
        .with_edge("login", "verify", EdgeKind::RequiresSuccess);
    let def_id = harness.orchestrator.register(def).await.unwrap();
    let instance_id = harness
        .orchestrator
        .start(def_id, serde_json::Value::Null, ExecutionPolicy::Parallel)
        .await
        .unwrap();

    assert_eq!(
        harness.wait_for_resolution(instance_id).await,
        InstanceStatus::Completed
    );
    let ran = harness.executor.ran_kinds.lock().await.clone();
    assert_eq!(ran, vec!["open", "login", "verify"]);

    let instance = harness.orchestrator.get_instance(instance_id).await.unwrap();
    let results = instance.results();
    assert_eq!(results.len(), 3);
    assert!(results.contains_key("verify"));

    harness.stop().await;
}

#[tokio::test]
async fn test_failure_cancels_downstream_and_fails_instance() {
    let harness = Harness::start(4);

    let def = WorkflowDefinition::new("doomed")
        .with_node("a", payload("fail"))
        .with_node("b", payload("b"))
        .with_node("c", payload("c"))
        .with_edge("a", "b", EdgeKind::RequiresSuccess)
        .with_edge("b", "c", EdgeKind::RequiresSuccess);
    let def_id = harness.orchestrator.register(def).await.unwrap();
    let instance_id = harness
        .orchestrator
        .start(def_id, serde_json::Value::Null, ExecutionPolicy::Parallel)
        .await
        .unwrap();

    // Nothing succeeded, so the whole instance is failed.
    assert_eq!(
        harness.wait_for_resolution(instance_id).await,
        InstanceStatus::Failed
    );
    let instance = harness.orchestrator.get_instance(instance_id).await.unwrap();
    assert_eq!(instance.node_status("a"), Some(NodeRunStatus::Failed));
    // Downstream nodes are explicitly cancelled, never left dangling or run.
    assert_eq!(instance.node_status("b"), Some(NodeRunStatus::Cancelled));
    assert_eq!(instance.node_status("c"), Some(NodeRunStatus::Cancelled));
    // Only the failing node ever reached a worker (retries included).
    let ran = harness.executor.ran_kinds.lock().await.clone();
    assert!(!ran.is_empty());
    assert!(ran.iter().all(|kind| kind == "fail"));

    harness.stop().await;
}

#[tokio::test]
async fn test_partial_resolution_with_mixed_outcomes() {
    let harness = Harness::start(4);

    let def = WorkflowDefinition::new("mixed")
        .with_node("good", payload("good"))
        .with_node("bad", payload("fail"))
        .with_node("after-bad", payload("after-bad"))
        .with_edge("bad", "after-bad", EdgeKind::RequiresSuccess);
    let def_id = harness.orchestrator.register(def).await.unwrap();
    let instance_id = harness
        .orchestrator
        .start(def_id, serde_json::Value::Null, ExecutionPolicy::Parallel)
        .await
        .unwrap();

    assert_eq!(
        harness.wait_for_resolution(instance_id).await,
        InstanceStatus::Partial
    );
    let instance = harness.orchestrator.get_instance(instance_id).await.unwrap();
    assert_eq!(instance.node_status("good"), Some(NodeRunStatus::Succeeded));
    assert_eq!(instance.node_status("bad"), Some(NodeRunStatus::Failed));
    assert_eq!(
        instance.node_status("after-bad"),
        Some(NodeRunStatus::Cancelled)
    );

    harness.stop().await;
}

#[tokio::test]
async fn test_requires_completion_runs_after_parent_failure() {
    let harness = Harness::start(4);

    let def = WorkflowDefinition::new("cleanup")
        .with_node("risky", payload("fail"))
        .with_node("teardown", payload("teardown"))
        .with_edge("risky", "teardown", EdgeKind::RequiresCompletion);
    let def_id = harness.orchestrator.register(def).await.unwrap();
    let instance_id = harness
        .orchestrator
        .start(def_id, serde_json::Value::Null, ExecutionPolicy::Parallel)
        .await
        .unwrap();

    // Teardown still runs, so the instance is partial rather than failed.
    assert_eq!(
        harness.wait_for_resolution(instance_id).await,
        InstanceStatus::Partial
    );
    let ran = harness.executor.ran_kinds.lock().await.clone();
    assert!(ran.contains(&"teardown".to_string()));

    harness.stop().await;
}

#[tokio::test]
async fn test_after_delay_edge_defers_downstream() {
    let harness = Harness::start(4);

    let def = WorkflowDefinition::new("delayed")
        .with_node("first", payload("first"))
        .with_node("second", payload("second"))
        .with_edge("first", "second", EdgeKind::AfterDelay(1));
    let def_id = harness.orchestrator.register(def).await.unwrap();

    let started = tokio::time::Instant::now();
    let instance_id = harness
        .orchestrator
        .start(def_id, serde_json::Value::Null, ExecutionPolicy::Parallel)
        .await
        .unwrap();

    assert_eq!(
        harness.wait_for_resolution(instance_id).await,
        InstanceStatus::Completed
    );
    assert!(started.elapsed() >= Duration::from_secs(1));

    harness.stop().await;
}

#[tokio::test]
async fn test_sequential_policy_runs_one_at_a_time() {
    let harness = Harness::start(4);

    // Independent nodes; sequential still runs them in topological order.
    let def = WorkflowDefinition::new("steps")
        .with_node("one", payload("one"))
        .with_node("two", payload("two"))
        .with_node("three", payload("three"));
    let def_id = harness.orchestrator.register(def).await.unwrap();
    let instance_id = harness
        .orchestrator
        .start(def_id, serde_json::Value::Null, ExecutionPolicy::Sequential)
        .await
        .unwrap();

    assert_eq!(
        harness.wait_for_resolution(instance_id).await,
        InstanceStatus::Completed
    );
    let ran = harness.executor.ran_kinds.lock().await.clone();
    assert_eq!(ran, vec!["one", "two", "three"]);

    harness.stop().await;
}

#[tokio::test]
async fn test_cyclic_definition_rejected_at_registration() {
    let harness = Harness::start(1);

    let def = WorkflowDefinition::new("loop")
        .with_node("a", payload("a"))
        .with_node("b", payload("b"))
        .with_edge("a", "b", EdgeKind::RequiresSuccess)
        .with_edge("b", "a", EdgeKind::RequiresSuccess);
    let result = harness.orchestrator.register(def).await;
    assert!(matches!(result, Err(ConveyorError::CycleDetected(_))));

    harness.stop().await;
}

#[tokio::test]
async fn test_inputs_merged_into_node_params() {
    let harness = Harness::start(2);

    let def = WorkflowDefinition::new("parameterized")
        .with_node("visit", TaskPayload::new("visit", serde_json::json!({"depth": 2})));
    let def_id = harness.orchestrator.register(def).await.unwrap();
    let instance_id = harness
        .orchestrator
        .start(
            def_id,
            serde_json::json!({"url": "https://example.com"}),
            ExecutionPolicy::Parallel,
        )
        .await
        .unwrap();

    assert_eq!(
        harness.wait_for_resolution(instance_id).await,
        InstanceStatus::Completed
    );
    let instance = harness.orchestrator.get_instance(instance_id).await.unwrap();
    let results = instance.results();
    let echoed = &results["visit"]["echo"];
    assert_eq!(echoed["depth"], 2);
    assert_eq!(echoed["url"], "https://example.com");

    harness.stop().await;
}

#[tokio::test]
async fn test_batch_aggregates_mixed_results() {
    let harness = Harness::start(4);

    let submitter: Arc<dyn TaskSubmitter> = Arc::new(harness.processor.clone());
    let batch = BatchTaskProcessor::new(submitter);

    // Items 2 and 4 are scripted to fail.
    let template = TaskTemplate::new(TaskPayload::new(
        "fetch",
        serde_json::json!({"fail_items": [2, 4]}),
    ));
    let items: Vec<serde_json::Value> =
        (1..=4).map(|n| serde_json::json!(n)).collect();
    let batch_id = batch.create_batch(template, items).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let result = loop {
        let result = batch.batch_result(batch_id).await.unwrap();
        if result.complete {
            break result;
        }
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    assert_eq!(result.total, 4);
    assert_eq!(result.succeeded, 2);
    assert_eq!(result.failed, 2);
    assert!((result.success_rate - 0.5).abs() < f64::EPSILON);

    harness.stop().await;
}

#[tokio::test]
async fn test_empty_batch_rejected() {
    let harness = Harness::start(1);
    let submitter: Arc<dyn TaskSubmitter> = Arc::new(harness.processor.clone());
    let batch = BatchTaskProcessor::new(submitter);

    let template = TaskTemplate::new(payload("fetch"));
    assert!(batch.create_batch(template, vec![]).await.is_err());

    harness.stop().await;
}
