// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The workflow service trait and its error taxonomy.
//!
//! The worker core talks to the orchestration server exclusively through
//! [`WorkflowService`]. Transports (gRPC or otherwise) implement this trait;
//! tests use in-memory doubles. Marshalling is out of scope here.

use async_trait::async_trait;
use thiserror::Error;

use crate::task::{
    ActivityTask, GetWorkflowExecutionHistoryRequest, GetWorkflowExecutionHistoryResponse,
    PollActivityTaskQueueRequest, PollWorkflowTaskQueueRequest,
    RecordActivityTaskHeartbeatByIdRequest, RecordActivityTaskHeartbeatRequest,
    RecordActivityTaskHeartbeatResponse, RespondActivityTaskCanceledRequest,
    RespondActivityTaskCompletedRequest, RespondActivityTaskFailedRequest,
    RespondWorkflowTaskCompletedRequest, RespondWorkflowTaskFailedRequest,
    ResetStickyTaskQueueRequest, SignalWorkflowExecutionRequest, WorkflowTask,
};

/// Errors surfaced by the workflow service.
///
/// Transient errors are retried inside the core; terminal errors propagate to
/// the caller or change task outcome (a `NotFound` on heartbeat cancels the
/// activity, for example).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// The referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The namespace is not active in this cluster.
    #[error("namespace not active: {0}")]
    NamespaceNotActive(String),

    /// An entity with this identity already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The request was malformed or logically invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The server asks for cancellation of the in-flight operation.
    #[error("canceled")]
    Canceled,

    /// The server or transport is temporarily unavailable.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The server hit an internal error.
    #[error("internal: {0}")]
    Internal(String),

    /// The call ran past its deadline.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl ServiceError {
    /// Transient errors are retried with backoff; everything else is
    /// terminal for the current call.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ServiceError::Unavailable(_)
                | ServiceError::Internal(_)
                | ServiceError::DeadlineExceeded
        )
    }
}

/// The orchestration server RPC surface consumed by the worker core.
#[async_trait]
pub trait WorkflowService: Send + Sync {
    /// Fetch the next workflow task, or `None` on poll timeout.
    async fn poll_workflow_task_queue(
        &self,
        request: PollWorkflowTaskQueueRequest,
    ) -> Result<Option<WorkflowTask>, ServiceError>;

    /// Deliver commands for a processed workflow task. When the completion
    /// asks for it, the server replies with a fresh task for the same run.
    async fn respond_workflow_task_completed(
        &self,
        request: RespondWorkflowTaskCompletedRequest,
    ) -> Result<Option<WorkflowTask>, ServiceError>;

    /// Report a workflow task the worker could not process.
    async fn respond_workflow_task_failed(
        &self,
        request: RespondWorkflowTaskFailedRequest,
    ) -> Result<(), ServiceError>;

    /// Fetch one more page of history for an execution.
    async fn get_workflow_execution_history(
        &self,
        request: GetWorkflowExecutionHistoryRequest,
    ) -> Result<GetWorkflowExecutionHistoryResponse, ServiceError>;

    /// Fetch the next activity task, or `None` on poll timeout.
    async fn poll_activity_task_queue(
        &self,
        request: PollActivityTaskQueueRequest,
    ) -> Result<Option<ActivityTask>, ServiceError>;

    async fn respond_activity_task_completed(
        &self,
        request: RespondActivityTaskCompletedRequest,
    ) -> Result<(), ServiceError>;

    async fn respond_activity_task_failed(
        &self,
        request: RespondActivityTaskFailedRequest,
    ) -> Result<(), ServiceError>;

    async fn respond_activity_task_canceled(
        &self,
        request: RespondActivityTaskCanceledRequest,
    ) -> Result<(), ServiceError>;

    async fn record_activity_task_heartbeat(
        &self,
        request: RecordActivityTaskHeartbeatRequest,
    ) -> Result<RecordActivityTaskHeartbeatResponse, ServiceError>;

    async fn record_activity_task_heartbeat_by_id(
        &self,
        request: RecordActivityTaskHeartbeatByIdRequest,
    ) -> Result<RecordActivityTaskHeartbeatResponse, ServiceError>;

    /// Release sticky affinity for an execution after cache eviction.
    async fn reset_sticky_task_queue(
        &self,
        request: ResetStickyTaskQueueRequest,
    ) -> Result<(), ServiceError>;

    /// Deliver a signal to a workflow execution.
    async fn signal_workflow_execution(
        &self,
        request: SignalWorkflowExecutionRequest,
    ) -> Result<(), ServiceError>;
}
