//! Scheduling and executor RPC contracts
//!
//! The cluster scheduler picks an executor for a task; the executor client
//! dispatches the task to it. Both speak gRPC in production, so failures
//! are reported as `tonic::Status`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::protocol::{ExecutorId, MasterId, ResourceId, ResourceUnit, WorkerId};

/// Request to place a task on an executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleTaskRequest {
    pub task_id: WorkerId,
    pub cost: ResourceUnit,
    pub resource_requirements: Vec<ResourceId>,
}

/// Placement chosen by the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleTaskResponse {
    pub executor_id: ExecutorId,
    pub executor_addr: String,
}

/// Cluster scheduling service
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    async fn schedule_task(
        &self,
        ctx: &CancellationToken,
        request: ScheduleTaskRequest,
        timeout: Duration,
    ) -> std::result::Result<ScheduleTaskResponse, tonic::Status>;
}

/// Arguments of a dispatch call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTaskArgs {
    pub worker_id: WorkerId,
    pub master_id: MasterId,
    pub worker_type: i64,
    pub worker_config: Bytes,
}

/// Fired once the executor has durably accepted the task
pub type OnAccepted = Box<dyn FnOnce() + Send>;
/// Fired on any failure after acceptance
pub type OnFailed = Box<dyn FnOnce(tonic::Status) + Send>;

/// Handle able to dispatch tasks to one executor
#[async_trait]
pub trait ExecutorClient: Send + Sync {
    /// Dispatch a task.
    ///
    /// Implementations call `on_accepted` once the executor has accepted the
    /// task and before confirming it, and `on_failed` if the task fails
    /// after acceptance. A failure before acceptance is only reported
    /// through the returned status.
    async fn dispatch_task(
        &self,
        ctx: &CancellationToken,
        args: DispatchTaskArgs,
        on_accepted: OnAccepted,
        on_failed: OnFailed,
    ) -> std::result::Result<(), tonic::Status>;
}

/// Connection pool of executor clients
pub trait ExecutorClientManager: Send + Sync {
    /// Make `executor_id` reachable at `addr`. Idempotent.
    fn add_executor(&self, executor_id: &str, addr: &str) -> Result<()>;

    /// Client for a previously added executor
    fn executor_client(&self, executor_id: &str) -> Option<Arc<dyn ExecutorClient>>;
}
