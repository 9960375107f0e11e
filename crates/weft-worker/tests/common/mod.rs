// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared test support: an in-memory workflow service, canned history
//! builders, and a scripted event handler standing in for the deterministic
//! workflow interpreter.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;

use weft_protocol::commands::{
    Command, CommandAttributes, CommandType, ScheduleActivityTaskAttributes,
};
use weft_protocol::events::{
    ActivityTaskCompletedAttributes, ActivityTaskScheduledAttributes, EventAttributes, EventType,
    HistoryEvent, HistoryPage, WorkflowExecutionStartedAttributes, WorkflowTaskCompletedAttributes,
};
use weft_protocol::payload::Payloads;
use weft_protocol::service::{ServiceError, WorkflowService};
use weft_protocol::task::{
    ActivityTask, GetWorkflowExecutionHistoryRequest, GetWorkflowExecutionHistoryResponse,
    PollActivityTaskQueueRequest, PollWorkflowTaskQueueRequest,
    RecordActivityTaskHeartbeatByIdRequest, RecordActivityTaskHeartbeatRequest,
    RecordActivityTaskHeartbeatResponse, RespondActivityTaskCanceledRequest,
    RespondActivityTaskCompletedRequest, RespondActivityTaskFailedRequest,
    RespondWorkflowTaskCompletedRequest, RespondWorkflowTaskFailedRequest,
    ResetStickyTaskQueueRequest, SignalWorkflowExecutionRequest, WorkflowTask,
};

use weft_worker::{
    EventHandlerFactory, HistoryIterator, LocalActivityResult, LocalActivityTask,
    WorkflowCompletion, WorkflowEventHandler, WorkflowInfo,
};

// ============================================================================
// History builders
// ============================================================================

pub fn wf_started(event_id: i64, task_queue: &str, task_timeout: Duration) -> HistoryEvent {
    HistoryEvent::new(
        event_id,
        EventType::WorkflowExecutionStarted,
        EventAttributes::WorkflowExecutionStarted(WorkflowExecutionStartedAttributes {
            workflow_type: "test-workflow".to_string(),
            task_queue: task_queue.to_string(),
            workflow_task_timeout: task_timeout,
            attempt: 1,
            ..Default::default()
        }),
    )
}

pub fn wf_task_scheduled(event_id: i64) -> HistoryEvent {
    HistoryEvent::new(event_id, EventType::WorkflowTaskScheduled, EventAttributes::None)
}

pub fn wf_task_started(event_id: i64) -> HistoryEvent {
    HistoryEvent::new(event_id, EventType::WorkflowTaskStarted, EventAttributes::None)
}

pub fn wf_task_completed(event_id: i64, binary_checksum: &str) -> HistoryEvent {
    HistoryEvent::new(
        event_id,
        EventType::WorkflowTaskCompleted,
        EventAttributes::WorkflowTaskCompleted(WorkflowTaskCompletedAttributes {
            binary_checksum: binary_checksum.to_string(),
        }),
    )
}

pub fn activity_scheduled(
    event_id: i64,
    activity_id: &str,
    activity_type: &str,
) -> HistoryEvent {
    HistoryEvent::new(
        event_id,
        EventType::ActivityTaskScheduled,
        EventAttributes::ActivityTaskScheduled(ActivityTaskScheduledAttributes {
            activity_id: activity_id.to_string(),
            activity_type: activity_type.to_string(),
            ..Default::default()
        }),
    )
}

pub fn activity_completed(
    event_id: i64,
    scheduled_event_id: i64,
    result: &str,
) -> HistoryEvent {
    HistoryEvent::new(
        event_id,
        EventType::ActivityTaskCompleted,
        EventAttributes::ActivityTaskCompleted(ActivityTaskCompletedAttributes {
            scheduled_event_id,
            result: Payloads::json(&result).expect("encode result"),
        }),
    )
}

/// The eight-event history of a run that scheduled one activity and got its
/// result back: ready for the final workflow task.
pub fn greet_history(task_timeout: Duration) -> Vec<HistoryEvent> {
    vec![
        wf_started(1, "test-queue", task_timeout),
        wf_task_scheduled(2),
        wf_task_started(3),
        wf_task_completed(4, "checksum-1"),
        activity_scheduled(5, "A1", "greet"),
        activity_completed(6, 5, "Hello World!"),
        wf_task_scheduled(7),
        wf_task_started(8),
    ]
}

pub fn workflow_task(
    run_id: &str,
    events: Vec<HistoryEvent>,
    previous_started_event_id: i64,
    started_event_id: i64,
) -> WorkflowTask {
    WorkflowTask {
        task_token: format!("token-{}", run_id).into_bytes(),
        workflow_execution: weft_protocol::events::WorkflowExecution::new("wf-1", run_id),
        workflow_type: "test-workflow".to_string(),
        history: HistoryPage::new(events),
        previous_started_event_id,
        started_event_id,
        ..Default::default()
    }
}

// ============================================================================
// History iterator double
// ============================================================================

/// Serves pre-canned pages; `reset` rewinds to the first one.
pub struct StaticHistoryIterator {
    pages: Vec<HistoryPage>,
    index: usize,
}

impl StaticHistoryIterator {
    pub fn new(pages: Vec<HistoryPage>) -> Self {
        Self { pages, index: 0 }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Models the pagination of a task that already embeds its history: no
    /// further pages to fetch, but `reset` rewinds to the full history from
    /// the first event.
    pub fn full_history(events: Vec<HistoryEvent>) -> Self {
        let pages = vec![HistoryPage::new(events)];
        let index = pages.len();
        Self { pages, index }
    }
}

#[async_trait]
impl HistoryIterator for StaticHistoryIterator {
    fn has_next_page(&self) -> bool {
        self.index < self.pages.len()
    }

    async fn next_page(&mut self) -> Result<HistoryPage, ServiceError> {
        let page = self
            .pages
            .get(self.index)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound("no more history pages".to_string()))?;
        self.index += 1;
        Ok(page)
    }

    fn reset(&mut self) {
        self.index = 0;
    }
}

// ============================================================================
// Workflow service double
// ============================================================================

/// Records requests and serves configurable heartbeat responses.
#[derive(Default)]
pub struct MockWorkflowService {
    pub heartbeat_count: AtomicUsize,
    pub heartbeat_error: StdMutex<Option<ServiceError>>,
    pub heartbeat_cancel_requested: StdMutex<bool>,
    pub signals: StdMutex<Vec<SignalWorkflowExecutionRequest>>,
    pub sticky_resets: StdMutex<Vec<ResetStickyTaskQueueRequest>>,
}

impl MockWorkflowService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_heartbeat_error(&self, error: ServiceError) {
        *self.heartbeat_error.lock().unwrap() = Some(error);
    }

    pub fn set_heartbeat_cancel_requested(&self, cancel: bool) {
        *self.heartbeat_cancel_requested.lock().unwrap() = cancel;
    }

    pub fn heartbeats(&self) -> usize {
        self.heartbeat_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkflowService for MockWorkflowService {
    async fn poll_workflow_task_queue(
        &self,
        _request: PollWorkflowTaskQueueRequest,
    ) -> Result<Option<WorkflowTask>, ServiceError> {
        Ok(None)
    }

    async fn respond_workflow_task_completed(
        &self,
        _request: RespondWorkflowTaskCompletedRequest,
    ) -> Result<Option<WorkflowTask>, ServiceError> {
        Ok(None)
    }

    async fn respond_workflow_task_failed(
        &self,
        _request: RespondWorkflowTaskFailedRequest,
    ) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn get_workflow_execution_history(
        &self,
        _request: GetWorkflowExecutionHistoryRequest,
    ) -> Result<GetWorkflowExecutionHistoryResponse, ServiceError> {
        Ok(GetWorkflowExecutionHistoryResponse::default())
    }

    async fn poll_activity_task_queue(
        &self,
        _request: PollActivityTaskQueueRequest,
    ) -> Result<Option<ActivityTask>, ServiceError> {
        Ok(None)
    }

    async fn respond_activity_task_completed(
        &self,
        _request: RespondActivityTaskCompletedRequest,
    ) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn respond_activity_task_failed(
        &self,
        _request: RespondActivityTaskFailedRequest,
    ) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn respond_activity_task_canceled(
        &self,
        _request: RespondActivityTaskCanceledRequest,
    ) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn record_activity_task_heartbeat(
        &self,
        _request: RecordActivityTaskHeartbeatRequest,
    ) -> Result<RecordActivityTaskHeartbeatResponse, ServiceError> {
        self.heartbeat_count.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.heartbeat_error.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(RecordActivityTaskHeartbeatResponse {
            cancel_requested: *self.heartbeat_cancel_requested.lock().unwrap(),
        })
    }

    async fn record_activity_task_heartbeat_by_id(
        &self,
        _request: RecordActivityTaskHeartbeatByIdRequest,
    ) -> Result<RecordActivityTaskHeartbeatResponse, ServiceError> {
        self.heartbeat_count.fetch_add(1, Ordering::SeqCst);
        Ok(RecordActivityTaskHeartbeatResponse::default())
    }

    async fn reset_sticky_task_queue(
        &self,
        request: ResetStickyTaskQueueRequest,
    ) -> Result<(), ServiceError> {
        self.sticky_resets.lock().unwrap().push(request);
        Ok(())
    }

    async fn signal_workflow_execution(
        &self,
        request: SignalWorkflowExecutionRequest,
    ) -> Result<(), ServiceError> {
        self.signals.lock().unwrap().push(request);
        Ok(())
    }
}

// ============================================================================
// Scripted event handler
// ============================================================================

/// What the scripted workflow does when its execution starts.
#[derive(Debug, Clone)]
pub enum ScriptedBehavior {
    /// Schedule one activity and complete with its result.
    ScheduleActivity {
        activity_id: String,
        activity_type: String,
    },
    /// Schedule one local activity and complete with its result.
    ScheduleLocalActivity {
        activity_id: String,
        activity_type: String,
    },
    /// Complete right away with a fixed result.
    CompleteImmediately { result: String },
    /// Finish right away with the given workflow error (cancellation,
    /// continue-as-new, application failure).
    CompleteWithError { error: weft_worker::WorkflowError },
    /// Panic while processing the started event.
    PanicOnStart { message: String },
}

/// A deterministic stand-in for the workflow interpreter, driven by a single
/// [`ScriptedBehavior`].
pub struct ScriptedWorkflow {
    behavior: ScriptedBehavior,
    commands: Vec<Command>,
    completion: Option<WorkflowCompletion>,
    watched_scheduled_event_id: Option<i64>,
    pending_local_activities: HashMap<String, LocalActivityTask>,
    unstarted_local_activities: Vec<LocalActivityTask>,
}

impl ScriptedWorkflow {
    pub fn new(behavior: ScriptedBehavior) -> Self {
        Self {
            behavior,
            commands: Vec::new(),
            completion: None,
            watched_scheduled_event_id: None,
            pending_local_activities: HashMap::new(),
            unstarted_local_activities: Vec::new(),
        }
    }
}

impl WorkflowEventHandler for ScriptedWorkflow {
    fn process_event(
        &mut self,
        event: &HistoryEvent,
        _is_replay: bool,
        _is_last: bool,
    ) -> Result<(), weft_worker::WorkflowError> {
        match event.event_type {
            EventType::WorkflowExecutionStarted => match &self.behavior {
                ScriptedBehavior::ScheduleActivity {
                    activity_id,
                    activity_type,
                } => {
                    self.commands.push(Command::new(
                        CommandType::ScheduleActivityTask,
                        CommandAttributes::ScheduleActivityTask(ScheduleActivityTaskAttributes {
                            activity_id: activity_id.clone(),
                            activity_type: activity_type.clone(),
                            task_queue: "test-queue".to_string(),
                            ..Default::default()
                        }),
                    ));
                }
                ScriptedBehavior::ScheduleLocalActivity {
                    activity_id,
                    activity_type,
                } => {
                    let task = LocalActivityTask::new(activity_id.clone(), activity_type.clone());
                    self.pending_local_activities
                        .insert(activity_id.clone(), task.clone());
                    self.unstarted_local_activities.push(task);
                }
                ScriptedBehavior::CompleteImmediately { result } => {
                    self.completion = Some(WorkflowCompletion {
                        result: Some(Payloads::json(result).expect("encode result")),
                        error: None,
                    });
                }
                ScriptedBehavior::CompleteWithError { error } => {
                    self.completion = Some(WorkflowCompletion {
                        result: None,
                        error: Some(error.clone()),
                    });
                }
                ScriptedBehavior::PanicOnStart { message } => {
                    panic!("{}", message.clone());
                }
            },
            EventType::ActivityTaskScheduled => {
                if let EventAttributes::ActivityTaskScheduled(attrs) = &event.attributes {
                    if let ScriptedBehavior::ScheduleActivity {
                        activity_id,
                        activity_type,
                    } = &self.behavior
                    {
                        if attrs.activity_id == *activity_id
                            && attrs.activity_type == *activity_type
                        {
                            self.watched_scheduled_event_id = Some(event.event_id);
                        }
                    }
                }
            }
            EventType::ActivityTaskCompleted => {
                if let EventAttributes::ActivityTaskCompleted(attrs) = &event.attributes {
                    if self.watched_scheduled_event_id == Some(attrs.scheduled_event_id) {
                        self.completion = Some(WorkflowCompletion {
                            result: Some(attrs.result.clone()),
                            error: None,
                        });
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn process_query(
        &mut self,
        query_type: &str,
        _args: Option<&Payloads>,
    ) -> Result<Option<Payloads>, weft_worker::WorkflowError> {
        Ok(Some(
            Payloads::json(&format!("answer-{}", query_type)).expect("encode answer"),
        ))
    }

    fn drain_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }

    fn completion(&self) -> Option<WorkflowCompletion> {
        self.completion.clone()
    }

    fn apply_local_activity_result(
        &mut self,
        result: &LocalActivityResult,
    ) -> Result<(), weft_worker::WorkflowError> {
        self.pending_local_activities
            .remove(&result.task.activity_id);
        self.completion = Some(WorkflowCompletion {
            result: result.result.clone(),
            error: result.error.clone(),
        });
        Ok(())
    }

    fn pending_local_activity_count(&self) -> usize {
        self.pending_local_activities.len()
    }

    fn has_pending_local_activity(&self, activity_id: &str) -> bool {
        self.pending_local_activities.contains_key(activity_id)
    }

    fn take_unstarted_local_activities(&mut self) -> Vec<LocalActivityTask> {
        std::mem::take(&mut self.unstarted_local_activities)
    }

    fn local_activity_not_started(&mut self, task: LocalActivityTask) {
        self.unstarted_local_activities.push(task);
    }

    fn stack_trace(&self) -> String {
        "scripted workflow stack".to_string()
    }

    fn close(&mut self) {}
}

pub struct ScriptedWorkflowFactory {
    pub behavior: ScriptedBehavior,
}

impl ScriptedWorkflowFactory {
    pub fn new(behavior: ScriptedBehavior) -> Self {
        Self { behavior }
    }
}

impl EventHandlerFactory for ScriptedWorkflowFactory {
    fn create_handler(&self, _info: &WorkflowInfo) -> Box<dyn WorkflowEventHandler> {
        Box::new(ScriptedWorkflow::new(self.behavior.clone()))
    }
}
