// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Replay matcher.
//!
//! During replay the workflow code re-produces its decisions. Each command
//! must pair 1-to-1 with the history event the server recorded for it; any
//! divergence means the code no longer agrees with its own past and the
//! durability guarantee is broken.
//!
//! Non-strict mode (live replay) compares only identity-bearing fields.
//! Strict mode additionally compares payloads, timeouts, task queues and
//! search attributes; it is meant for offline replay tooling.

use weft_protocol::commands::{Command, CommandAttributes, CommandType};
use weft_protocol::events::{EventAttributes, EventType, HistoryEvent};
use weft_protocol::markers::{
    is_replay_namespace, CHANGE_VERSION_SEARCH_ATTRIBUTE, MUTABLE_SIDE_EFFECT_MARKER_NAME,
    VERSION_MARKER_NAME,
};

use crate::error::WorkflowError;

/// Compare replay-produced commands against the recorded command events.
///
/// `history_events` must already be restricted to the command-event set.
pub fn match_replay_with_history(
    replay_commands: &[Command],
    history_events: &[HistoryEvent],
) -> Result<(), WorkflowError> {
    match_with_mode(replay_commands, history_events, false)
}

/// Strict variant for offline replay tools.
pub fn match_replay_with_history_strict(
    replay_commands: &[Command],
    history_events: &[HistoryEvent],
) -> Result<(), WorkflowError> {
    match_with_mode(replay_commands, history_events, true)
}

fn match_with_mode(
    replay_commands: &[Command],
    history_events: &[HistoryEvent],
    strict: bool,
) -> Result<(), WorkflowError> {
    let mut di = 0;
    let mut hi = 0;

    while hi < history_events.len() || di < replay_commands.len() {
        let mut event = None;
        if hi < history_events.len() {
            let e = &history_events[hi];
            if skip_check_for_upsert_change_version(history_events, hi) {
                hi += 2;
                continue;
            }
            if skip_check_for_event(e) {
                hi += 1;
                continue;
            }
            event = Some(e);
        }

        let mut command = None;
        if di < replay_commands.len() {
            let d = &replay_commands[di];
            if skip_check_for_command(d) {
                di += 1;
                continue;
            }
            command = Some(d);
        }

        match (command, event) {
            (None, Some(e)) => {
                return Err(WorkflowError::Nondeterminism(format!(
                    "nondeterministic workflow: missing replay command for {}",
                    e.describe()
                )));
            }
            (Some(d), None) => {
                return Err(WorkflowError::Nondeterminism(format!(
                    "nondeterministic workflow: extra replay command for {}",
                    d.describe()
                )));
            }
            (Some(d), Some(e)) => {
                if !command_matches_event(d, e, strict) {
                    return Err(WorkflowError::Nondeterminism(format!(
                        "nondeterministic workflow: history event is {}, replay command is {}",
                        e.describe(),
                        d.describe()
                    )));
                }
            }
            (None, None) => unreachable!("loop condition guarantees one side"),
        }

        di += 1;
        hi += 1;
    }
    Ok(())
}

/// Version and mutable-side-effect markers never participate in matching:
/// their presence legitimately differs between recording and replay.
fn skip_check_for_command(command: &Command) -> bool {
    matches!(
        command.marker_name(),
        Some(VERSION_MARKER_NAME) | Some(MUTABLE_SIDE_EFFECT_MARKER_NAME)
    )
}

fn skip_check_for_event(event: &HistoryEvent) -> bool {
    matches!(
        event.marker_name(),
        Some(VERSION_MARKER_NAME) | Some(MUTABLE_SIDE_EFFECT_MARKER_NAME)
    )
}

/// A version marker immediately followed by a change-version search-attribute
/// upsert is skipped as a unit.
fn skip_check_for_upsert_change_version(events: &[HistoryEvent], idx: usize) -> bool {
    let event = &events[idx];
    if event.marker_name() != Some(VERSION_MARKER_NAME) {
        return false;
    }
    let Some(next) = events.get(idx + 1) else {
        return false;
    };
    if next.event_type != EventType::UpsertWorkflowSearchAttributes {
        return false;
    }
    match &next.attributes {
        EventAttributes::UpsertWorkflowSearchAttributes(attrs) => attrs
            .search_attributes
            .contains_key(CHANGE_VERSION_SEARCH_ATTRIBUTE),
        _ => false,
    }
}

/// Everything after the last dot, so renaming a module does not read as
/// nondeterminism.
fn last_part_of_name(name: &str) -> &str {
    match name.rfind('.') {
        Some(idx) if idx + 1 < name.len() => &name[idx + 1..],
        _ => name,
    }
}

/// Namespace comparison fails only when the command pins a real namespace
/// that differs from the recorded one.
fn namespaces_mismatch(event_namespace: &str, command_namespace: &str) -> bool {
    if command_namespace.is_empty() || is_replay_namespace(command_namespace) {
        return false;
    }
    event_namespace != command_namespace
}

/// The command-type-specific equality relation.
pub fn command_matches_event(command: &Command, event: &HistoryEvent, strict: bool) -> bool {
    match (&command.attributes, &event.attributes) {
        (
            CommandAttributes::ScheduleActivityTask(c),
            EventAttributes::ActivityTaskScheduled(e),
        ) => {
            if event.event_type != EventType::ActivityTaskScheduled {
                return false;
            }
            e.activity_id == c.activity_id
                && last_part_of_name(&e.activity_type) == last_part_of_name(&c.activity_type)
                && (!strict || e.task_queue == c.task_queue)
                && (!strict || e.input == c.input)
        }

        (
            CommandAttributes::RequestCancelActivityTask(c),
            EventAttributes::ActivityTaskCancelRequested(e),
        ) => e.scheduled_event_id == c.scheduled_event_id,

        (CommandAttributes::StartTimer(c), EventAttributes::TimerStarted(e)) => {
            e.timer_id == c.timer_id
                && (!strict || e.start_to_fire_timeout == c.start_to_fire_timeout)
        }

        (CommandAttributes::CancelTimer(c), EventAttributes::TimerCanceled(e)) => {
            e.timer_id == c.timer_id
        }

        (
            CommandAttributes::CompleteWorkflowExecution(c),
            EventAttributes::WorkflowExecutionCompleted(e),
        ) => !strict || e.result == c.result,

        (
            CommandAttributes::FailWorkflowExecution(c),
            EventAttributes::WorkflowExecutionFailed(e),
        ) => !strict || e.failure == c.failure,

        (
            CommandAttributes::CancelWorkflowExecution(c),
            EventAttributes::WorkflowExecutionCanceled(e),
        ) => !strict || e.details == c.details,

        (
            CommandAttributes::ContinueAsNewWorkflowExecution(_),
            EventAttributes::WorkflowExecutionContinuedAsNew(_),
        ) => true,

        (CommandAttributes::RecordMarker(c), EventAttributes::MarkerRecorded(e)) => {
            e.marker_name == c.marker_name
        }

        (
            CommandAttributes::RequestCancelExternalWorkflowExecution(c),
            EventAttributes::RequestCancelExternalWorkflowExecutionInitiated(e),
        ) => {
            !namespaces_mismatch(&e.namespace, &c.namespace)
                && e.workflow_execution.workflow_id == c.workflow_id
        }

        (
            CommandAttributes::SignalExternalWorkflowExecution(c),
            EventAttributes::SignalExternalWorkflowExecutionInitiated(e),
        ) => {
            !namespaces_mismatch(&e.namespace, &c.namespace)
                && e.signal_name == c.signal_name
                && e.workflow_execution.workflow_id == c.execution.workflow_id
        }

        (
            CommandAttributes::StartChildWorkflowExecution(c),
            EventAttributes::StartChildWorkflowExecutionInitiated(e),
        ) => {
            last_part_of_name(&e.workflow_type) == last_part_of_name(&c.workflow_type)
                && (!strict || !namespaces_mismatch(&e.namespace, &c.namespace))
                && (!strict || e.task_queue == c.task_queue)
        }

        (
            CommandAttributes::UpsertWorkflowSearchAttributes(c),
            EventAttributes::UpsertWorkflowSearchAttributes(e),
        ) => !strict || e.search_attributes == c.search_attributes,

        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use weft_protocol::commands::{
        RecordMarkerAttributes, ScheduleActivityTaskAttributes, StartTimerAttributes,
        UpsertWorkflowSearchAttributesAttributes,
    };
    use weft_protocol::events::{
        ActivityTaskScheduledAttributes, MarkerRecordedAttributes, SearchAttributes,
        TimerStartedAttributes, UpsertWorkflowSearchAttributesEventAttributes,
    };
    use weft_protocol::payload::Payload;

    fn schedule_activity_command(activity_id: &str, activity_type: &str) -> Command {
        Command::new(
            CommandType::ScheduleActivityTask,
            CommandAttributes::ScheduleActivityTask(ScheduleActivityTaskAttributes {
                activity_id: activity_id.into(),
                activity_type: activity_type.into(),
                ..Default::default()
            }),
        )
    }

    fn activity_scheduled_event(event_id: i64, activity_id: &str, activity_type: &str) -> HistoryEvent {
        HistoryEvent::new(
            event_id,
            EventType::ActivityTaskScheduled,
            EventAttributes::ActivityTaskScheduled(ActivityTaskScheduledAttributes {
                activity_id: activity_id.into(),
                activity_type: activity_type.into(),
                ..Default::default()
            }),
        )
    }

    fn marker_event(event_id: i64, marker_name: &str) -> HistoryEvent {
        HistoryEvent::new(
            event_id,
            EventType::MarkerRecorded,
            EventAttributes::MarkerRecorded(MarkerRecordedAttributes {
                marker_name: marker_name.into(),
                details: HashMap::new(),
            }),
        )
    }

    #[test]
    fn test_matching_activity_schedules() {
        let commands = vec![schedule_activity_command("5", "greet")];
        let events = vec![activity_scheduled_event(5, "5", "greet")];
        assert!(match_replay_with_history(&commands, &events).is_ok());
    }

    #[test]
    fn test_activity_type_mismatch_is_nondeterministic() {
        let commands = vec![schedule_activity_command("5", "farewell")];
        let events = vec![activity_scheduled_event(5, "5", "greet")];
        let err = match_replay_with_history(&commands, &events).unwrap_err();
        assert_eq!(
            err.to_string(),
            "nondeterministic workflow: history event is ACTIVITY_TASK_SCHEDULED(greet), \
             replay command is SCHEDULE_ACTIVITY_TASK(farewell)"
        );
    }

    #[test]
    fn test_activity_type_compared_by_last_dot_segment() {
        let commands = vec![schedule_activity_command("5", "orders.v2.greet")];
        let events = vec![activity_scheduled_event(5, "5", "orders.v1.greet")];
        assert!(match_replay_with_history(&commands, &events).is_ok());
    }

    #[test]
    fn test_missing_command() {
        let events = vec![activity_scheduled_event(5, "5", "greet")];
        let err = match_replay_with_history(&[], &events).unwrap_err();
        assert!(err.to_string().contains("missing replay command"));
    }

    #[test]
    fn test_extra_command() {
        let commands = vec![schedule_activity_command("5", "greet")];
        let err = match_replay_with_history(&commands, &[]).unwrap_err();
        assert!(err.to_string().contains("extra replay command"));
    }

    #[test]
    fn test_version_markers_never_cause_mismatch() {
        // A version marker recorded in history without a matching replay
        // command (the versioned branch is gone) and a replayed
        // mutable-side-effect marker with no event: both skipped.
        let commands = vec![
            Command::new(
                CommandType::RecordMarker,
                CommandAttributes::RecordMarker(RecordMarkerAttributes {
                    marker_name: MUTABLE_SIDE_EFFECT_MARKER_NAME.into(),
                    ..Default::default()
                }),
            ),
            schedule_activity_command("5", "greet"),
        ];
        let events = vec![
            marker_event(4, VERSION_MARKER_NAME),
            activity_scheduled_event(5, "5", "greet"),
        ];
        assert!(match_replay_with_history(&commands, &events).is_ok());
    }

    #[test]
    fn test_version_marker_with_change_version_upsert_skips_both() {
        let mut indexed = HashMap::new();
        indexed.insert(
            CHANGE_VERSION_SEARCH_ATTRIBUTE.to_string(),
            Payload::new(b"v1".to_vec()),
        );
        let events = vec![
            marker_event(4, VERSION_MARKER_NAME),
            HistoryEvent::new(
                5,
                EventType::UpsertWorkflowSearchAttributes,
                EventAttributes::UpsertWorkflowSearchAttributes(
                    UpsertWorkflowSearchAttributesEventAttributes {
                        search_attributes: SearchAttributes {
                            indexed_fields: indexed,
                        },
                    },
                ),
            ),
            activity_scheduled_event(6, "6", "greet"),
        ];
        let commands = vec![schedule_activity_command("6", "greet")];
        assert!(match_replay_with_history(&commands, &events).is_ok());
    }

    #[test]
    fn test_plain_upsert_still_matches() {
        // Without the change-version key the upsert event must pair with an
        // upsert command.
        let events = vec![HistoryEvent::new(
            5,
            EventType::UpsertWorkflowSearchAttributes,
            EventAttributes::UpsertWorkflowSearchAttributes(Default::default()),
        )];
        let commands = vec![Command::new(
            CommandType::UpsertWorkflowSearchAttributes,
            CommandAttributes::UpsertWorkflowSearchAttributes(
                UpsertWorkflowSearchAttributesAttributes::default(),
            ),
        )];
        assert!(match_replay_with_history(&commands, &events).is_ok());
    }

    #[test]
    fn test_timer_id_match() {
        let commands = vec![Command::new(
            CommandType::StartTimer,
            CommandAttributes::StartTimer(StartTimerAttributes {
                timer_id: "7".into(),
                start_to_fire_timeout: std::time::Duration::from_secs(30),
            }),
        )];
        let events = vec![HistoryEvent::new(
            7,
            EventType::TimerStarted,
            EventAttributes::TimerStarted(TimerStartedAttributes {
                timer_id: "7".into(),
                start_to_fire_timeout: std::time::Duration::from_secs(60),
            }),
        )];
        // Non-strict ignores the timeout.
        assert!(match_replay_with_history(&commands, &events).is_ok());
        // Strict does not.
        assert!(match_replay_with_history_strict(&commands, &events).is_err());
    }

    #[test]
    fn test_terminal_command_matches_terminal_event() {
        // Replaying the last task of a closed workflow re-produces the
        // terminal command; it must pair with the recorded terminal event.
        let commands = vec![Command::new(
            CommandType::CompleteWorkflowExecution,
            CommandAttributes::CompleteWorkflowExecution(
                weft_protocol::commands::CompleteWorkflowExecutionAttributes { result: None },
            ),
        )];
        let events = vec![HistoryEvent::new(
            10,
            EventType::WorkflowExecutionCompleted,
            EventAttributes::WorkflowExecutionCompleted(
                weft_protocol::events::WorkflowExecutionCompletedAttributes {
                    result: Some(weft_protocol::payload::Payloads::empty()),
                },
            ),
        )];
        // Non-strict ignores the payloads; the pairing is by type.
        assert!(match_replay_with_history(&commands, &events).is_ok());
        assert!(match_replay_with_history_strict(&commands, &events).is_err());
    }

    #[test]
    fn test_last_part_of_name() {
        assert_eq!(last_part_of_name("pkg.module.Activity"), "Activity");
        assert_eq!(last_part_of_name("Activity"), "Activity");
        assert_eq!(last_part_of_name("trailing."), "trailing.");
    }

    #[test]
    fn test_namespace_rules() {
        assert!(!namespaces_mismatch("ns-a", ""));
        assert!(!namespaces_mismatch("ns-a", "ReplayNamespace"));
        assert!(!namespaces_mismatch("ns-a", "ns-a"));
        assert!(namespaces_mismatch("ns-a", "ns-b"));
    }
}
