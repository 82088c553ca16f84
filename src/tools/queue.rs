use schemars::JsonSchema;
use serde::Deserialize;

use crate::queue::{PriorityInput, RequestId};
use crate::tools::dispatch::DispatchRequest;

/// Request to admit a task into the priority queue.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct EnqueueRequest {
    #[serde(flatten)]
    pub task: DispatchRequest,
    /// "critical", "high", "normal", "low", "background", or 0 (most urgent) to 9.
    pub priority: Option<PriorityInput>,
    /// Wait for the result instead of returning the request id immediately (default false).
    pub wait: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RequestIdRequest {
    /// Request id returned by `enqueue`.
    pub id: RequestId,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PrioritizeRequest {
    /// Request id returned by `enqueue`. Only still-queued requests can be re-prioritized.
    pub id: RequestId,
    /// New priority: named level or 0-9.
    pub priority: PriorityInput,
}
