use async_trait::async_trait;
use conveyor_core::{ConveyorResult, TaskPayload};

/// The external executor callback supplied by the browser-automation layer.
///
/// The core treats it as an opaque, possibly slow, possibly failing
/// function; the payload shape is never interpreted here.
#[async_trait]
pub trait TaskExecutor<W: Send + 'static>: Send + Sync {
    async fn execute(
        &self,
        worker: &mut W,
        payload: &TaskPayload,
    ) -> ConveyorResult<serde_json::Value>;
}
