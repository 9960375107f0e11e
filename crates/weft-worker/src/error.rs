// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker-side error taxonomy.
//!
//! Two layers: [`WorkflowError`] is the workflow-visible outcome vocabulary
//! (cancellation, continue-as-new, application failures, panics,
//! nondeterminism) and converts into wire [`Failure`]s; [`WorkerError`] is
//! what the task processing machinery itself can fail with.

use std::time::Duration;

use thiserror::Error;

use weft_protocol::events::{Failure, Header};
use weft_protocol::payload::Payloads;
use weft_protocol::service::ServiceError;

/// Parameters carried by a continue-as-new request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContinueAsNewParams {
    pub workflow_type: String,
    pub task_queue: String,
    pub input: Payloads,
    pub workflow_run_timeout: Duration,
    pub workflow_task_timeout: Duration,
    pub header: Option<Header>,
}

/// Workflow-visible outcomes.
///
/// `Canceled` and `ContinueAsNew` are sentinels: the completion builder maps
/// them to their dedicated terminal commands rather than treating them as
/// failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum WorkflowError {
    /// The workflow (or an activity within it) was canceled.
    #[error("canceled")]
    Canceled { details: Option<Payloads> },

    /// The workflow asked to continue as a new run.
    #[error("continue as new")]
    ContinueAsNew(Box<ContinueAsNewParams>),

    /// An application-level failure raised by workflow or activity code.
    #[error("{message}")]
    Application {
        message: String,
        /// Application-assigned failure type, matched against retry policies.
        error_type: String,
        non_retryable: bool,
        details: Option<Payloads>,
        cause: Option<Box<WorkflowError>>,
    },

    /// A panic captured at a recovery boundary.
    #[error("panic: {message}")]
    Panic {
        message: String,
        stack_trace: String,
    },

    /// Replay produced commands that do not match recorded history.
    #[error("{0}")]
    Nondeterminism(String),
}

impl WorkflowError {
    pub fn canceled() -> Self {
        WorkflowError::Canceled { details: None }
    }

    pub fn application(message: impl Into<String>) -> Self {
        WorkflowError::Application {
            message: message.into(),
            error_type: String::new(),
            non_retryable: false,
            details: None,
            cause: None,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, WorkflowError::Canceled { .. })
    }

    /// The failure type string used for retry-policy matching.
    pub fn error_type(&self) -> &str {
        match self {
            WorkflowError::Application { error_type, .. } => error_type,
            WorkflowError::Canceled { .. } => "CanceledError",
            WorkflowError::ContinueAsNew(_) => "ContinueAsNewError",
            WorkflowError::Panic { .. } => "PanicError",
            WorkflowError::Nondeterminism(_) => "NondeterminismError",
        }
    }

    /// Serialize into the wire failure shape.
    pub fn to_failure(&self) -> Failure {
        match self {
            WorkflowError::Application {
                message,
                error_type,
                non_retryable,
                cause,
                ..
            } => Failure {
                message: message.clone(),
                failure_type: error_type.clone(),
                non_retryable: *non_retryable,
                stack_trace: String::new(),
                cause: cause.as_ref().map(|c| Box::new(c.to_failure())),
            },
            WorkflowError::Panic {
                message,
                stack_trace,
            } => Failure {
                message: message.clone(),
                failure_type: "PanicError".to_string(),
                non_retryable: true,
                stack_trace: stack_trace.clone(),
                cause: None,
            },
            other => Failure {
                message: other.to_string(),
                failure_type: other.error_type().to_string(),
                non_retryable: false,
                stack_trace: String::new(),
                cause: None,
            },
        }
    }
}

/// Failures of the task processing machinery itself.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The task carried neither history events nor a query.
    #[error("nil or empty history")]
    EmptyTask,

    /// A task carried both a direct query and a query map.
    #[error("invalid query workflow task")]
    InvalidQueryTask,

    /// The first event of a full history was not workflow-execution-started.
    #[error("first history event is not WorkflowExecutionStarted")]
    MissingStartedEvent,

    /// The started event named no task queue.
    #[error("nil or empty TaskQueue in WorkflowExecutionStarted event")]
    MissingTaskQueue,

    /// The event stream skipped an id.
    #[error("missing history events, expectedNextEventID={expected} but receivedNextEventID={received}")]
    MissingHistoryEvents { expected: i64, received: i64 },

    /// The stream ended before the task's started event id.
    #[error("history_events: premature end of stream, expectedLastEventID={expected_last} but no more events after eventID={last_seen}")]
    PrematureEndOfStream { expected_last: i64, last_seen: i64 },

    /// The cached event handler vanished mid-processing.
    #[error("workflow execution context has been destroyed")]
    DestroyedContext,

    /// The requested activity type is not registered with this worker.
    #[error("unable to find activityType={activity_type}. Supported types: [{supported}]")]
    UnknownActivityType {
        activity_type: String,
        supported: String,
    },

    /// The activity outlived its deadline; the result is dropped and the
    /// server times the attempt out.
    #[error("activity complete after timeout")]
    ActivityDeadlineExceeded,

    /// A context propagator rejected the task header.
    #[error("unable to propagate context: {0}")]
    ContextPropagation(String),

    /// A workflow-task heartbeat failed. Distinct from workflow errors: the
    /// whole task must be retried by the server.
    #[error("error sending workflow task heartbeat: {0}")]
    WorkflowTaskHeartbeat(String),

    /// A service call failed terminally.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// A workflow error surfaced under the block-workflow panic policy.
    #[error(transparent)]
    Workflow(WorkflowError),
}

impl WorkerError {
    /// True for the heartbeat error class.
    pub fn is_heartbeat_error(&self) -> bool {
        matches!(self, WorkerError::WorkflowTaskHeartbeat(_))
    }
}

/// Session lifecycle errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session this context belongs to has already failed.
    #[error("session has failed")]
    SessionFailed,

    /// Admission control rejected the session.
    #[error("too many outstanding sessions")]
    TooManySessions,

    /// A still-open session already exists in this context.
    #[error("found existing open session in the context")]
    ExistingOpenSession,

    /// The recreate token could not be parsed.
    #[error("failed to deserialize recreate token: {0}")]
    InvalidRecreateToken(String),

    /// The creation activity failed before the session was established.
    #[error("session creation failed: {0}")]
    Creation(WorkflowError),

    /// An activity inside the session failed.
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}
