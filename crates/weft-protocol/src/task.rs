// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task payloads and request/response types for the workflow service.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::events::{
    EventType, Failure, Header, HistoryPage, WorkflowExecution,
};
use crate::commands::Command;
use crate::payload::Payloads;

/// A request from the server to advance one workflow execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTask {
    /// Opaque token identifying this task to the server.
    pub task_token: Vec<u8>,
    pub workflow_execution: WorkflowExecution,
    pub workflow_type: String,
    /// First page of history for this task.
    pub history: HistoryPage,
    /// Last event id the worker previously processed for this run.
    pub previous_started_event_id: i64,
    /// Last event id this task must reach.
    pub started_event_id: i64,
    /// Continuation token for history pagination.
    pub next_page_token: Vec<u8>,
    /// Direct query, mutually exclusive with `queries`.
    pub query: Option<WorkflowQuery>,
    /// Consistent-query map answered inside the completion request.
    pub queries: HashMap<String, WorkflowQuery>,
}

impl WorkflowTask {
    /// True when the task carries history from the very first event.
    pub fn is_full_history(&self) -> bool {
        self.history
            .events
            .first()
            .map(|event| event.event_type == EventType::WorkflowExecutionStarted)
            .unwrap_or(false)
    }
}

/// A request from the server to run one activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityTask {
    pub task_token: Vec<u8>,
    pub workflow_execution: WorkflowExecution,
    pub workflow_type: String,
    pub activity_id: String,
    pub activity_type: String,
    pub input: Payloads,
    pub header: Option<Header>,
    pub schedule_to_close_timeout: Option<Duration>,
    pub start_to_close_timeout: Option<Duration>,
    pub heartbeat_timeout: Option<Duration>,
    pub attempt: u32,
}

/// A query against workflow state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowQuery {
    pub query_type: String,
    pub query_args: Option<Payloads>,
}

/// Outcome classification of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryResultType {
    Answered,
    Failed,
}

/// Per-query result inside a completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowQueryResult {
    pub result_type: QueryResultType,
    pub answer: Option<Payloads>,
    pub error_message: Option<String>,
}

/// Why a workflow task is reported failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowTaskFailedCause {
    Unspecified,
    /// The worker hit an unhandled failure (panic or nondeterminism) while
    /// processing the task.
    WorkflowWorkerUnhandledFailure,
}

/// Deliver the commands of a processed workflow task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RespondWorkflowTaskCompletedRequest {
    pub task_token: Vec<u8>,
    pub commands: Vec<Command>,
    pub identity: String,
    pub binary_checksum: String,
    pub return_new_workflow_task: bool,
    /// Heartbeat-style completion: ask the server to immediately create a
    /// fresh task for this run even though no new events exist.
    pub force_create_new_workflow_task: bool,
    pub query_results: HashMap<String, WorkflowQueryResult>,
}

/// Report a workflow task the worker could not process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RespondWorkflowTaskFailedRequest {
    pub task_token: Vec<u8>,
    pub cause: Option<WorkflowTaskFailedCause>,
    pub failure: Option<Failure>,
    pub identity: String,
    pub binary_checksum: String,
}

/// Answer a direct query task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RespondQueryTaskCompletedRequest {
    pub task_token: Vec<u8>,
    pub completed_type: QueryResultType,
    pub query_result: Option<Payloads>,
    pub error_message: Option<String>,
}

/// Deliver a successful activity result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RespondActivityTaskCompletedRequest {
    pub task_token: Vec<u8>,
    pub result: Option<Payloads>,
    pub identity: String,
}

/// Deliver a failed activity result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RespondActivityTaskFailedRequest {
    pub task_token: Vec<u8>,
    pub failure: Option<Failure>,
    pub identity: String,
}

/// Deliver a canceled activity outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RespondActivityTaskCanceledRequest {
    pub task_token: Vec<u8>,
    pub details: Option<Payloads>,
    pub identity: String,
}

/// Activity liveness/progress report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordActivityTaskHeartbeatRequest {
    pub task_token: Vec<u8>,
    pub details: Option<Payloads>,
    pub identity: String,
}

/// Heartbeat variant addressed by ids instead of task token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordActivityTaskHeartbeatByIdRequest {
    pub namespace: String,
    pub workflow_id: String,
    pub run_id: String,
    pub activity_id: String,
    pub details: Option<Payloads>,
    pub identity: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordActivityTaskHeartbeatResponse {
    /// The server asks the activity to cancel. Co-operative; the activity may
    /// still complete.
    pub cancel_requested: bool,
}

/// Release sticky affinity for an execution after cache eviction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResetStickyTaskQueueRequest {
    pub namespace: String,
    pub execution: WorkflowExecution,
}

/// Deliver a signal to a workflow execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalWorkflowExecutionRequest {
    pub namespace: String,
    pub workflow_execution: WorkflowExecution,
    pub signal_name: String,
    pub input: Payloads,
    pub identity: String,
}

/// Paginate the history of an execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetWorkflowExecutionHistoryRequest {
    pub namespace: String,
    pub execution: WorkflowExecution,
    pub next_page_token: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetWorkflowExecutionHistoryResponse {
    pub history: HistoryPage,
    pub next_page_token: Vec<u8>,
}

/// Long-poll for the next workflow task on a queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PollWorkflowTaskQueueRequest {
    pub namespace: String,
    pub task_queue: String,
    pub identity: String,
    pub binary_checksum: String,
}

/// Long-poll for the next activity task on a queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PollActivityTaskQueueRequest {
    pub namespace: String,
    pub task_queue: String,
    pub identity: String,
}
