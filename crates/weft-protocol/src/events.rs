// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! History events.
//!
//! A workflow execution is persisted by the server as an ordered, gap-free
//! sequence of history events. The worker consumes these during replay and
//! never produces them directly; the server materializes them from the
//! commands the worker returns.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::payload::{Payload, Payloads};

/// A workflow execution identity pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub workflow_id: String,
    pub run_id: String,
}

impl WorkflowExecution {
    pub fn new(workflow_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
        }
    }
}

/// Server-side search attributes, an opaque indexed field map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchAttributes {
    pub indexed_fields: HashMap<String, Payload>,
}

impl SearchAttributes {
    pub fn contains_key(&self, key: &str) -> bool {
        self.indexed_fields.contains_key(key)
    }
}

/// A serialized failure, as carried by failed events and fail commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub message: String,
    /// Application-assigned failure type, empty for framework failures.
    pub failure_type: String,
    pub non_retryable: bool,
    pub stack_trace: String,
    pub cause: Option<Box<Failure>>,
}

/// Header carried for context propagation (tracing, baggage).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub fields: HashMap<String, Payload>,
}

/// The closed set of history event types the worker consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    WorkflowExecutionStarted,
    WorkflowExecutionCompleted,
    WorkflowExecutionFailed,
    WorkflowExecutionCanceled,
    WorkflowExecutionContinuedAsNew,
    WorkflowExecutionSignaled,
    WorkflowExecutionCancelRequested,
    WorkflowTaskScheduled,
    WorkflowTaskStarted,
    WorkflowTaskCompleted,
    WorkflowTaskTimedOut,
    WorkflowTaskFailed,
    ActivityTaskScheduled,
    ActivityTaskStarted,
    ActivityTaskCompleted,
    ActivityTaskFailed,
    ActivityTaskTimedOut,
    ActivityTaskCancelRequested,
    ActivityTaskCanceled,
    TimerStarted,
    TimerFired,
    TimerCanceled,
    MarkerRecorded,
    StartChildWorkflowExecutionInitiated,
    RequestCancelExternalWorkflowExecutionInitiated,
    SignalExternalWorkflowExecutionInitiated,
    UpsertWorkflowSearchAttributes,
}

/// Returns true for event types that are the direct result of a command the
/// worker produced. These events are always considered replayed, since the
/// code path that created them has already executed.
pub fn is_command_event(event_type: EventType) -> bool {
    matches!(
        event_type,
        EventType::WorkflowExecutionCompleted
            | EventType::WorkflowExecutionFailed
            | EventType::WorkflowExecutionCanceled
            | EventType::WorkflowExecutionContinuedAsNew
            | EventType::ActivityTaskScheduled
            | EventType::ActivityTaskCancelRequested
            | EventType::TimerStarted
            | EventType::TimerCanceled
            | EventType::MarkerRecorded
            | EventType::StartChildWorkflowExecutionInitiated
            | EventType::RequestCancelExternalWorkflowExecutionInitiated
            | EventType::SignalExternalWorkflowExecutionInitiated
            | EventType::UpsertWorkflowSearchAttributes
    )
}

/// One history event. `event_id` is monotonic and gap-free per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub event_id: i64,
    pub event_type: EventType,
    pub attributes: EventAttributes,
}

impl HistoryEvent {
    pub fn new(event_id: i64, event_type: EventType, attributes: EventAttributes) -> Self {
        Self {
            event_id,
            event_type,
            attributes,
        }
    }

    /// Marker name if this is a marker-recorded event.
    pub fn marker_name(&self) -> Option<&str> {
        match &self.attributes {
            EventAttributes::MarkerRecorded(attrs) => Some(&attrs.marker_name),
            _ => None,
        }
    }

    /// Short human form used in nondeterminism errors, e.g.
    /// `ACTIVITY_TASK_SCHEDULED(greet)`.
    pub fn describe(&self) -> String {
        let detail = match &self.attributes {
            EventAttributes::ActivityTaskScheduled(a) => Some(a.activity_type.clone()),
            EventAttributes::TimerStarted(a) => Some(a.timer_id.clone()),
            EventAttributes::TimerCanceled(a) => Some(a.timer_id.clone()),
            EventAttributes::MarkerRecorded(a) => Some(a.marker_name.clone()),
            EventAttributes::StartChildWorkflowExecutionInitiated(a) => {
                Some(a.workflow_type.clone())
            }
            EventAttributes::SignalExternalWorkflowExecutionInitiated(a) => {
                Some(a.signal_name.clone())
            }
            _ => None,
        };
        match detail {
            Some(detail) => format!("{}({})", self.event_type, detail),
            None => self.event_type.to_string(),
        }
    }
}

/// One page of history, as delivered in a task or fetched via pagination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage {
    pub events: Vec<HistoryEvent>,
}

impl HistoryPage {
    pub fn new(events: Vec<HistoryEvent>) -> Self {
        Self { events }
    }
}

/// Typed attributes, keyed by event type. Events the core does not inspect
/// carry `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum EventAttributes {
    #[default]
    None,
    WorkflowExecutionStarted(WorkflowExecutionStartedAttributes),
    WorkflowExecutionCompleted(WorkflowExecutionCompletedAttributes),
    WorkflowExecutionFailed(WorkflowExecutionFailedAttributes),
    WorkflowExecutionCanceled(WorkflowExecutionCanceledAttributes),
    WorkflowExecutionContinuedAsNew(WorkflowExecutionContinuedAsNewAttributes),
    WorkflowExecutionSignaled(WorkflowExecutionSignaledAttributes),
    WorkflowTaskCompleted(WorkflowTaskCompletedAttributes),
    ActivityTaskScheduled(ActivityTaskScheduledAttributes),
    ActivityTaskCompleted(ActivityTaskCompletedAttributes),
    ActivityTaskFailed(ActivityTaskFailedAttributes),
    ActivityTaskCancelRequested(ActivityTaskCancelRequestedAttributes),
    TimerStarted(TimerStartedAttributes),
    TimerFired(TimerFiredAttributes),
    TimerCanceled(TimerCanceledAttributes),
    MarkerRecorded(MarkerRecordedAttributes),
    StartChildWorkflowExecutionInitiated(StartChildWorkflowExecutionInitiatedAttributes),
    RequestCancelExternalWorkflowExecutionInitiated(
        RequestCancelExternalWorkflowExecutionInitiatedAttributes,
    ),
    SignalExternalWorkflowExecutionInitiated(SignalExternalWorkflowExecutionInitiatedAttributes),
    UpsertWorkflowSearchAttributes(UpsertWorkflowSearchAttributesEventAttributes),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionStartedAttributes {
    pub workflow_type: String,
    pub task_queue: String,
    pub input: Payloads,
    pub workflow_execution_timeout: Duration,
    pub workflow_run_timeout: Duration,
    pub workflow_task_timeout: Duration,
    pub attempt: u32,
    pub cron_schedule: String,
    pub continued_execution_run_id: String,
    pub parent_workflow_namespace: String,
    pub parent_workflow_execution: Option<WorkflowExecution>,
    pub last_completion_result: Option<Payloads>,
    pub continued_failure: Option<Failure>,
    pub memo: HashMap<String, Payload>,
    pub search_attributes: Option<SearchAttributes>,
    pub header: Option<Header>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionCompletedAttributes {
    pub result: Option<Payloads>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionFailedAttributes {
    pub failure: Option<Failure>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionCanceledAttributes {
    pub details: Option<Payloads>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionContinuedAsNewAttributes {
    pub new_execution_run_id: String,
    pub workflow_type: String,
    pub task_queue: String,
    pub input: Payloads,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionSignaledAttributes {
    pub signal_name: String,
    pub input: Payloads,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTaskCompletedAttributes {
    /// Identifies the worker binary that produced this task's commands.
    pub binary_checksum: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityTaskScheduledAttributes {
    pub activity_id: String,
    pub activity_type: String,
    pub task_queue: String,
    pub input: Payloads,
    pub schedule_to_close_timeout: Option<Duration>,
    pub start_to_close_timeout: Option<Duration>,
    pub heartbeat_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityTaskCompletedAttributes {
    pub scheduled_event_id: i64,
    pub result: Payloads,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityTaskFailedAttributes {
    pub scheduled_event_id: i64,
    pub failure: Option<Failure>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityTaskCancelRequestedAttributes {
    pub scheduled_event_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimerStartedAttributes {
    pub timer_id: String,
    pub start_to_fire_timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimerFiredAttributes {
    pub timer_id: String,
    pub started_event_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimerCanceledAttributes {
    pub timer_id: String,
    pub started_event_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarkerRecordedAttributes {
    pub marker_name: String,
    pub details: HashMap<String, Payloads>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartChildWorkflowExecutionInitiatedAttributes {
    pub namespace: String,
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_queue: String,
    pub input: Payloads,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestCancelExternalWorkflowExecutionInitiatedAttributes {
    pub namespace: String,
    pub workflow_execution: WorkflowExecution,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalExternalWorkflowExecutionInitiatedAttributes {
    pub namespace: String,
    pub workflow_execution: WorkflowExecution,
    pub signal_name: String,
    pub input: Payloads,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpsertWorkflowSearchAttributesEventAttributes {
    pub search_attributes: SearchAttributes,
}
