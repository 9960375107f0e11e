// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Commands.
//!
//! A command is a decision the workflow code produces during a task. The
//! server persists each command as the matching history event; the replay
//! matcher in the worker crate checks that pairing during replay.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::events::{Failure, Header, SearchAttributes, WorkflowExecution};
use crate::payload::{Payload, Payloads};
use crate::retry::RetryPolicy;

/// The closed set of command types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    ScheduleActivityTask,
    RequestCancelActivityTask,
    StartTimer,
    CancelTimer,
    CompleteWorkflowExecution,
    FailWorkflowExecution,
    CancelWorkflowExecution,
    ContinueAsNewWorkflowExecution,
    RecordMarker,
    StartChildWorkflowExecution,
    RequestCancelExternalWorkflowExecution,
    SignalExternalWorkflowExecution,
    UpsertWorkflowSearchAttributes,
}

/// One workflow decision, to be persisted by the server as a history event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub command_type: CommandType,
    pub attributes: CommandAttributes,
}

impl Command {
    pub fn new(command_type: CommandType, attributes: CommandAttributes) -> Self {
        Self {
            command_type,
            attributes,
        }
    }

    /// Marker name if this is a record-marker command.
    pub fn marker_name(&self) -> Option<&str> {
        match &self.attributes {
            CommandAttributes::RecordMarker(attrs) => Some(&attrs.marker_name),
            _ => None,
        }
    }

    /// Short human form used in nondeterminism errors, e.g.
    /// `SCHEDULE_ACTIVITY_TASK(farewell)`.
    pub fn describe(&self) -> String {
        let detail = match &self.attributes {
            CommandAttributes::ScheduleActivityTask(a) => Some(a.activity_type.clone()),
            CommandAttributes::StartTimer(a) => Some(a.timer_id.clone()),
            CommandAttributes::CancelTimer(a) => Some(a.timer_id.clone()),
            CommandAttributes::RecordMarker(a) => Some(a.marker_name.clone()),
            CommandAttributes::StartChildWorkflowExecution(a) => Some(a.workflow_type.clone()),
            CommandAttributes::SignalExternalWorkflowExecution(a) => Some(a.signal_name.clone()),
            _ => None,
        };
        match detail {
            Some(detail) => format!("{}({})", self.command_type, detail),
            None => self.command_type.to_string(),
        }
    }
}

/// Typed command attributes, keyed by command type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandAttributes {
    ScheduleActivityTask(ScheduleActivityTaskAttributes),
    RequestCancelActivityTask(RequestCancelActivityTaskAttributes),
    StartTimer(StartTimerAttributes),
    CancelTimer(CancelTimerAttributes),
    CompleteWorkflowExecution(CompleteWorkflowExecutionAttributes),
    FailWorkflowExecution(FailWorkflowExecutionAttributes),
    CancelWorkflowExecution(CancelWorkflowExecutionAttributes),
    ContinueAsNewWorkflowExecution(ContinueAsNewWorkflowExecutionAttributes),
    RecordMarker(RecordMarkerAttributes),
    StartChildWorkflowExecution(StartChildWorkflowExecutionAttributes),
    RequestCancelExternalWorkflowExecution(RequestCancelExternalWorkflowExecutionAttributes),
    SignalExternalWorkflowExecution(SignalExternalWorkflowExecutionAttributes),
    UpsertWorkflowSearchAttributes(UpsertWorkflowSearchAttributesAttributes),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleActivityTaskAttributes {
    pub activity_id: String,
    pub activity_type: String,
    pub task_queue: String,
    pub input: Payloads,
    pub schedule_to_close_timeout: Option<Duration>,
    pub schedule_to_start_timeout: Option<Duration>,
    pub start_to_close_timeout: Option<Duration>,
    pub heartbeat_timeout: Option<Duration>,
    pub retry_policy: Option<RetryPolicy>,
    pub header: Option<Header>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestCancelActivityTaskAttributes {
    pub scheduled_event_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartTimerAttributes {
    pub timer_id: String,
    pub start_to_fire_timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CancelTimerAttributes {
    pub timer_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompleteWorkflowExecutionAttributes {
    pub result: Option<Payloads>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailWorkflowExecutionAttributes {
    pub failure: Option<Failure>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CancelWorkflowExecutionAttributes {
    pub details: Option<Payloads>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContinueAsNewWorkflowExecutionAttributes {
    pub workflow_type: String,
    pub task_queue: String,
    pub input: Payloads,
    pub workflow_run_timeout: Duration,
    pub workflow_task_timeout: Duration,
    pub header: Option<Header>,
    pub memo: HashMap<String, Payload>,
    pub search_attributes: Option<SearchAttributes>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordMarkerAttributes {
    pub marker_name: String,
    pub details: HashMap<String, Payloads>,
    pub header: Option<Header>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartChildWorkflowExecutionAttributes {
    pub namespace: String,
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_queue: String,
    pub input: Payloads,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestCancelExternalWorkflowExecutionAttributes {
    pub namespace: String,
    pub workflow_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalExternalWorkflowExecutionAttributes {
    pub namespace: String,
    pub execution: WorkflowExecution,
    pub signal_name: String,
    pub input: Payloads,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpsertWorkflowSearchAttributesAttributes {
    pub search_attributes: SearchAttributes,
}
