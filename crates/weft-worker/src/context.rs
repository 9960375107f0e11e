// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow execution context.
//!
//! The per-run state cached between tasks by sticky execution. A context is
//! created on the first task for a run (or on a cache miss after eviction),
//! borrowed under its lock for the duration of each task, and destroyed on
//! completion, fatal error, or LRU eviction.
//!
//! Locking: the big state lock (`tokio::sync::Mutex<ContextState>`) is held
//! across the whole task, including the local-activity wait loop. The event
//! handler lives in a sibling slot guarded by its own `std::sync::Mutex`,
//! taken only around synchronous interpreter calls. Local-activity retry
//! timers touch the slot and the tunnel but never the big lock - taking it
//! would deadlock against the wait loop that is waiting for the very retry
//! the timer dispatches. The slot is either a live handler or `None`; a
//! timer that finds `None` knows the context was destroyed and gives up.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex, MutexGuard};
use tracing::{debug, error};

use weft_protocol::commands::{
    CancelWorkflowExecutionAttributes, Command, CommandAttributes, CommandType,
    CompleteWorkflowExecutionAttributes, ContinueAsNewWorkflowExecutionAttributes,
    FailWorkflowExecutionAttributes,
};
use weft_protocol::events::{
    is_command_event, EventType, HistoryEvent, SearchAttributes, WorkflowExecution,
};
use weft_protocol::markers::LOCAL_ACTIVITY_MARKER_NAME;
use weft_protocol::payload::{Payload, Payloads};
use weft_protocol::retry::RetryPolicy;
use weft_protocol::task::{
    QueryResultType, RespondQueryTaskCompletedRequest, RespondWorkflowTaskCompletedRequest,
    ResetStickyTaskQueueRequest, WorkflowQuery, WorkflowQueryResult, WorkflowTask,
};

use crate::cache::WorkflowCache;
use crate::checksum::binary_checksum;
use crate::config::{WorkerConfig, WorkflowPanicPolicy};
use crate::error::{WorkerError, WorkflowError};
use crate::history::{HistoryCursor, HistoryIterator};
use crate::processor::{PressurePointHandler, TaskCompletion};

/// Static identity of a run, extracted from the started event.
#[derive(Debug, Clone, Default)]
pub struct WorkflowInfo {
    pub workflow_execution: WorkflowExecution,
    pub workflow_type: String,
    pub task_queue: String,
    pub namespace: String,
    pub attempt: u32,
    pub workflow_execution_timeout: Duration,
    pub workflow_run_timeout: Duration,
    pub workflow_task_timeout: Duration,
    pub cron_schedule: String,
    pub continued_execution_run_id: String,
    pub parent_workflow_namespace: String,
    pub parent_workflow_execution: Option<WorkflowExecution>,
    pub memo: HashMap<String, Payload>,
    pub search_attributes: Option<SearchAttributes>,
    /// Checksum of the binary whose commands are being replayed; updated per
    /// batch from workflow-task-completed events.
    pub binary_checksum: String,
}

/// Terminal status reported by the event handler once the workflow function
/// returns.
#[derive(Debug, Clone, Default)]
pub struct WorkflowCompletion {
    pub result: Option<Payloads>,
    pub error: Option<WorkflowError>,
}

/// The deterministic workflow interpreter, hosted outside this crate.
///
/// The handler runs the user workflow as a cooperatively scheduled green
/// thread; `process_event` advances it synchronously and is never called
/// concurrently with itself.
pub trait WorkflowEventHandler: Send {
    /// Feed one history event to the workflow.
    fn process_event(
        &mut self,
        event: &HistoryEvent,
        is_replay: bool,
        is_last: bool,
    ) -> Result<(), WorkflowError>;

    /// Answer a query against current workflow state.
    fn process_query(
        &mut self,
        query_type: &str,
        args: Option<&Payloads>,
    ) -> Result<Option<Payloads>, WorkflowError>;

    /// Take the commands accumulated since the last drain.
    fn drain_commands(&mut self) -> Vec<Command>;

    /// Terminal status, set once the workflow function has returned.
    fn completion(&self) -> Option<WorkflowCompletion>;

    /// Apply a local-activity result to the waiting workflow code.
    fn apply_local_activity_result(
        &mut self,
        result: &LocalActivityResult,
    ) -> Result<(), WorkflowError>;

    /// Number of local activities scheduled but not yet resolved.
    fn pending_local_activity_count(&self) -> usize;

    /// Whether the given local activity is still awaited.
    fn has_pending_local_activity(&self, activity_id: &str) -> bool;

    /// Take the local activities that have not been handed to the executor.
    fn take_unstarted_local_activities(&mut self) -> Vec<LocalActivityTask>;

    /// Return a local activity whose dispatch failed.
    fn local_activity_not_started(&mut self, task: LocalActivityTask);

    /// Current workflow stack trace, for diagnostics.
    fn stack_trace(&self) -> String;

    /// Release interpreter resources. Called exactly once, on destroy.
    fn close(&mut self);
}

/// Builds event handlers for new or rebuilt contexts.
pub trait EventHandlerFactory: Send + Sync {
    fn create_handler(&self, info: &WorkflowInfo) -> Box<dyn WorkflowEventHandler>;
}

/// A local activity awaiting in-process execution.
#[derive(Debug, Clone)]
pub struct LocalActivityTask {
    pub activity_id: String,
    pub activity_type: String,
    pub input: Payloads,
    /// 1-indexed execution attempt.
    pub attempt: u32,
    pub retry_policy: Option<RetryPolicy>,
    pub expire_time: Option<Instant>,
    /// Where the executor delivers the result; attached at dispatch.
    pub result_tx: Option<mpsc::UnboundedSender<LocalActivityResult>>,
}

impl LocalActivityTask {
    pub fn new(activity_id: impl Into<String>, activity_type: impl Into<String>) -> Self {
        Self {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            input: Payloads::empty(),
            attempt: 1,
            retry_policy: None,
            expire_time: None,
            result_tx: None,
        }
    }
}

/// Outcome of one local-activity attempt.
#[derive(Debug, Clone)]
pub struct LocalActivityResult {
    pub task: LocalActivityTask,
    pub result: Option<Payloads>,
    pub error: Option<WorkflowError>,
    /// Server-side retry backoff recorded when a local retry is not
    /// possible; replay reads it back from the marker.
    pub backoff: Option<Duration>,
}

/// Requests flowing from workflow-task processing to the local-activity
/// executor: activity dispatches and best-effort stickiness resets.
#[derive(Debug)]
pub enum LocalActivityRequest {
    Execute(LocalActivityTask),
    ResetStickiness(ResetStickyTaskQueueRequest),
}

/// Sender half of the local-activity pipeline.
#[derive(Clone)]
pub struct LocalActivityTunnel {
    tx: mpsc::UnboundedSender<LocalActivityRequest>,
}

impl LocalActivityTunnel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LocalActivityRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Hand a local activity to the executor. False if the executor is gone.
    pub fn send_task(&self, task: LocalActivityTask) -> bool {
        self.tx.send(LocalActivityRequest::Execute(task)).is_ok()
    }

    /// Best-effort stickiness reset on eviction.
    pub fn send_reset_stickiness(&self, request: ResetStickyTaskQueueRequest) -> bool {
        self.tx
            .send(LocalActivityRequest::ResetStickiness(request))
            .is_ok()
    }
}

/// A workflow task bundled with its pagination iterator and local-activity
/// result channel.
pub struct WorkflowTaskInput {
    pub task: WorkflowTask,
    pub history_iterator: Box<dyn HistoryIterator>,
    pub la_result_tx: mpsc::UnboundedSender<LocalActivityResult>,
    pub la_result_rx: mpsc::UnboundedReceiver<LocalActivityResult>,
}

impl WorkflowTaskInput {
    pub fn new(task: WorkflowTask, history_iterator: Box<dyn HistoryIterator>) -> Self {
        let (la_result_tx, la_result_rx) = mpsc::unbounded_channel();
        Self {
            task,
            history_iterator,
            la_result_tx,
            la_result_rx,
        }
    }
}

/// Rewind the iterator and replace the task's history with the first page of
/// the full history.
pub(crate) async fn reset_history(input: &mut WorkflowTaskInput) -> Result<(), WorkerError> {
    input.history_iterator.reset();
    let page = input.history_iterator.next_page().await?;
    input.task.history = page;
    Ok(())
}

/// Trimmed view of the task being processed, kept for completion building.
#[derive(Debug, Clone)]
pub(crate) struct CurrentTask {
    task_token: Vec<u8>,
    query: Option<WorkflowQuery>,
    queries: HashMap<String, WorkflowQuery>,
}

/// Mutable per-run state, guarded by the context's big lock.
pub struct ContextState {
    pub(crate) workflow_info: WorkflowInfo,
    pub(crate) previous_started_event_id: i64,
    pub(crate) is_workflow_completed: bool,
    pub(crate) result: Option<Payloads>,
    pub(crate) err: Option<WorkflowError>,
    pub(crate) new_commands: Vec<Command>,
    pub(crate) current_task: Option<CurrentTask>,
    pub(crate) la_tunnel: Option<LocalActivityTunnel>,
}

/// The shared handler slot: either a live event handler or `None` once the
/// context is destroyed. Shared with local-activity retry timers, which
/// check for `None` before re-dispatching.
type HandlerSlot = Arc<StdMutex<Option<Box<dyn WorkflowEventHandler>>>>;

/// Cached per-run execution state. See the module docs for the locking
/// discipline.
pub struct WorkflowExecutionContext {
    run_id: String,
    state: Mutex<ContextState>,
    handler: HandlerSlot,
    factory: Arc<dyn EventHandlerFactory>,
    config: Arc<WorkerConfig>,
    cache: Arc<WorkflowCache>,
    pressure_points: Option<Arc<dyn PressurePointHandler>>,
}

impl WorkflowExecutionContext {
    pub fn new(
        workflow_info: WorkflowInfo,
        factory: Arc<dyn EventHandlerFactory>,
        config: Arc<WorkerConfig>,
        cache: Arc<WorkflowCache>,
        pressure_points: Option<Arc<dyn PressurePointHandler>>,
    ) -> Arc<Self> {
        let run_id = workflow_info.workflow_execution.run_id.clone();
        let handler = factory.create_handler(&workflow_info);
        Arc::new(Self {
            run_id,
            state: Mutex::new(ContextState {
                workflow_info,
                previous_started_event_id: 0,
                is_workflow_completed: false,
                result: None,
                err: None,
                new_commands: Vec::new(),
                current_task: None,
                la_tunnel: None,
            }),
            handler: Arc::new(StdMutex::new(Some(handler))),
            factory,
            config,
            cache,
            pressure_points,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub(crate) async fn lock_state(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().await
    }

    /// A destroyed context has no event handler and must be rebuilt from
    /// full history before resuming.
    pub fn is_destroyed(&self) -> bool {
        self.handler.lock().expect("handler slot lock").is_none()
    }

    pub(crate) fn set_la_tunnel_if_absent(&self, state: &mut ContextState, tunnel: Option<&LocalActivityTunnel>) {
        if state.la_tunnel.is_none() {
            state.la_tunnel = tunnel.cloned();
        }
    }

    // ========== Lifecycle ==========

    /// Eviction hook, run when the cache drops this entry. Queues the
    /// stickiness reset before clearing: once destroyed, nothing sensible
    /// can be learned from the context.
    pub(crate) async fn on_eviction(&self) {
        let mut state = self.state.lock().await;
        if Self::should_reset_sticky_on_eviction(&state) {
            self.queue_reset_stickiness(&state);
        }
        self.clear_state_locked(&mut state);
    }

    /// A reset request is only worth a server round trip while the run is
    /// still in flight; completed or errored runs have no sticky state left.
    fn should_reset_sticky_on_eviction(state: &ContextState) -> bool {
        state.err.is_none() && !state.is_workflow_completed
    }

    fn queue_reset_stickiness(&self, state: &ContextState) {
        let request = ResetStickyTaskQueueRequest {
            namespace: state.workflow_info.namespace.clone(),
            execution: state.workflow_info.workflow_execution.clone(),
        };
        // No tunnel means no worker is attached (offline replay); the reset
        // is best-effort and dropped.
        if let Some(tunnel) = &state.la_tunnel {
            tunnel.send_reset_stickiness(request);
        }
    }

    fn clear_state_locked(&self, state: &mut ContextState) {
        self.clear_current_task(state);
        state.is_workflow_completed = false;
        state.result = None;
        state.err = None;
        state.previous_started_event_id = 0;

        let mut slot = self.handler.lock().expect("handler slot lock");
        if let Some(mut handler) = slot.take() {
            handler.close();
        }
    }

    fn create_event_handler(&self, state: &mut ContextState) {
        self.clear_state_locked(state);
        let handler = self.factory.create_handler(&state.workflow_info);
        *self.handler.lock().expect("handler slot lock") = Some(handler);
    }

    /// Rebuild the handler after destruction. Two tasks (a workflow task and
    /// a query task) can share a cached context; if the first one errored and
    /// destroyed it, the second must restart from full history.
    pub(crate) async fn reset_state_if_destroyed(
        &self,
        state: &mut ContextState,
        input: &mut WorkflowTaskInput,
    ) -> Result<(), WorkerError> {
        if self.is_destroyed() {
            self.create_event_handler(state);
            if !input.task.is_full_history() {
                reset_history(input).await?;
            }
        }
        Ok(())
    }

    /// Discard cached state when the incoming task does not continue where
    /// this context stopped. Must run before any replay work.
    pub(crate) async fn reset_if_stale(
        &self,
        state: &mut ContextState,
        input: &mut WorkflowTaskInput,
    ) -> Result<(), WorkerError> {
        let first_event_id = input.task.history.events.first().map(|e| e.event_id);
        if let Some(first_event_id) = first_event_id {
            if first_event_id != state.previous_started_event_id + 1 {
                debug!(
                    workflow_id = %input.task.workflow_execution.workflow_id,
                    run_id = %input.task.workflow_execution.run_id,
                    cached_previous_started_event_id = state.previous_started_event_id,
                    task_first_event_id = first_event_id,
                    task_started_event_id = input.task.started_event_id,
                    "Cached state stale, new task has unexpected events"
                );
                self.clear_state_locked(state);
                return self.reset_state_if_destroyed(state, input).await;
            }
        }
        Ok(())
    }

    fn set_current_task(&self, state: &mut ContextState, task: &WorkflowTask) {
        state.current_task = Some(CurrentTask {
            task_token: task.task_token.clone(),
            query: task.query.clone(),
            queries: task.queries.clone(),
        });
        // Query tasks do not advance the run.
        if task.query.is_none() {
            state.previous_started_event_id = task.started_event_id;
        }
    }

    fn clear_current_task(&self, state: &mut ContextState) {
        state.new_commands.clear();
        state.current_task = None;
    }

    // ========== Event handler access ==========

    /// Run a non-resuming handler operation (drains, queries, dispatch
    /// bookkeeping) under the slot lock.
    fn with_handler<R>(
        &self,
        f: impl FnOnce(&mut dyn WorkflowEventHandler) -> R,
    ) -> Result<R, WorkerError> {
        let mut slot = self.handler.lock().expect("handler slot lock");
        let handler = slot.as_mut().ok_or(WorkerError::DestroyedContext)?;
        Ok(f(handler.as_mut()))
    }

    /// Advance the workflow through the handler, converting panics in user
    /// code into a panic completion the policy layer will route.
    fn resume_handler(
        &self,
        state: &mut ContextState,
        f: impl FnOnce(&mut dyn WorkflowEventHandler) -> Result<(), WorkflowError>,
    ) -> Result<(), WorkerError> {
        let mut slot = self.handler.lock().expect("handler slot lock");
        let handler = slot.as_mut().ok_or(WorkerError::DestroyedContext)?;

        let outcome = catch_unwind(AssertUnwindSafe(|| f(handler.as_mut())));
        match outcome {
            Ok(Ok(())) => {
                if let Some(completion) = handler.completion() {
                    state.is_workflow_completed = true;
                    state.result = completion.result;
                    state.err = completion.error;
                }
                Ok(())
            }
            Ok(Err(workflow_err)) => Err(WorkerError::Workflow(workflow_err)),
            Err(panic) => {
                let message = panic_message(&panic);
                let stack_trace = handler.stack_trace();
                state.is_workflow_completed = true;
                state.result = None;
                state.err = Some(WorkflowError::Panic {
                    message,
                    stack_trace,
                });
                Ok(())
            }
        }
    }

    // ========== Task processing ==========

    /// Process all events of one workflow task. Returns `None` when the task
    /// cannot complete yet because local activities are pending.
    pub(crate) async fn process_task(
        &self,
        state: &mut ContextState,
        input: &mut WorkflowTaskInput,
    ) -> Result<Option<TaskCompletion>, WorkerError> {
        self.reset_if_stale(state, input).await?;
        self.reset_state_if_destroyed(state, input).await?;
        self.set_current_task(state, &input.task);

        let skip_replay_check = input.task.query.is_some() || !input.task.is_full_history();
        let mut replay_commands: Vec<Command> = Vec::new();
        let mut respond_events: Vec<HistoryEvent> = Vec::new();

        {
            let mut cursor =
                HistoryCursor::new(&input.task, Some(input.history_iterator.as_mut()));

            'process_events: loop {
                let Some(batch) = cursor.next_batch().await? else {
                    break 'process_events;
                };

                state.workflow_info.binary_checksum = batch
                    .binary_checksum
                    .clone()
                    .filter(|checksum| !checksum.is_empty())
                    .unwrap_or_else(binary_checksum);

                // Markers recorded by this batch's task, minus local-activity
                // results, are applied first: the code consults them
                // mid-batch.
                for marker in &batch.markers {
                    if marker.marker_name() != Some(LOCAL_ACTIVITY_MARKER_NAME) {
                        self.resume_handler(state, |h| h.process_event(marker, true, false))?;
                        if state.is_workflow_completed {
                            break 'process_events;
                        }
                    }
                }

                let batch_len = batch.events.len();
                for (i, event) in batch.events.iter().enumerate() {
                    let is_in_replay = cursor.is_replay_event(event);
                    let is_last = !is_in_replay && i == batch_len - 1;

                    if !skip_replay_check && is_command_event(event.event_type) {
                        respond_events.push(event.clone());
                    }

                    if event.event_type == EventType::MarkerRecorded {
                        // Markers are applied in the ordered passes around
                        // the batch.
                        continue;
                    }

                    if !is_in_replay {
                        if let Some(pressure_points) = &self.pressure_points {
                            pressure_points.execute(event)?;
                        }
                    }

                    self.resume_handler(state, |h| {
                        h.process_event(event, is_in_replay, is_last)
                    })?;
                    if state.is_workflow_completed {
                        break 'process_events;
                    }
                }

                // Local-activity markers go last so replayed results become
                // observable to the code path that scheduled them.
                for marker in &batch.markers {
                    if marker.marker_name() == Some(LOCAL_ACTIVITY_MARKER_NAME) {
                        self.resume_handler(state, |h| h.process_event(marker, true, false))?;
                        if state.is_workflow_completed {
                            break 'process_events;
                        }
                    }
                }

                let batch_is_replay = batch
                    .events
                    .last()
                    .map(|event| cursor.is_replay_event(event))
                    .unwrap_or(false);
                if batch_is_replay {
                    // Commands re-produced during replay must never reach
                    // the server again; they only feed the determinism
                    // check.
                    let commands = self.with_handler(|h| h.drain_commands())?;
                    if !skip_replay_check {
                        replay_commands.extend(commands);
                    }
                }
            }
        }

        let mut workflow_error = None;
        if !skip_replay_check && !state.is_workflow_completed {
            if let Err(err) = crate::replay::match_replay_with_history(&replay_commands, &respond_events)
            {
                workflow_error = Some(err);
            }
        }

        self.apply_workflow_panic_policy(state, input, workflow_error)
    }

    /// Apply one local-activity result, possibly retrying locally first.
    pub(crate) async fn process_local_activity_result(
        &self,
        state: &mut ContextState,
        input: &mut WorkflowTaskInput,
        mut result: LocalActivityResult,
    ) -> Result<Option<TaskCompletion>, WorkerError> {
        if result.error.is_some() && self.retry_local_activity(state, &mut result) {
            // A local retry timer is in flight; the task stays open.
            return Ok(None);
        }

        let mut workflow_error = None;
        if let Err(err) = self.resume_handler(state, |h| h.apply_local_activity_result(&result)) {
            match err {
                WorkerError::Workflow(err) => workflow_error = Some(err),
                other => return Err(other),
            }
        }
        self.apply_workflow_panic_policy(state, input, workflow_error)
    }

    /// Decide between a worker-local retry timer and a workflow-side backoff
    /// timer. Local retries only make sense while they fit inside the
    /// workflow task timeout; longer backoffs are recorded on the marker and
    /// scheduled as server timers, otherwise the task would be held open by
    /// heartbeats for the whole backoff.
    fn retry_local_activity(
        &self,
        state: &mut ContextState,
        result: &mut LocalActivityResult,
    ) -> bool {
        let Some(policy) = result.task.retry_policy.clone() else {
            return false;
        };
        let Some(err) = &result.error else {
            return false;
        };
        if err.is_canceled() || !policy.is_retryable(err.error_type()) {
            return false;
        }

        let backoff =
            policy.backoff_for_attempt(result.task.attempt, Instant::now(), result.task.expire_time);
        let Some(backoff) = backoff else {
            return false;
        };

        if backoff > state.workflow_info.workflow_task_timeout {
            result.backoff = Some(backoff);
            return false;
        }

        let Some(tunnel) = state.la_tunnel.clone() else {
            return false;
        };

        let handler_slot = Arc::clone(&self.handler);
        let mut task = result.task.clone();
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            // The handler slot, not the big lock: the wait loop holds the
            // big lock while waiting for this very dispatch. An empty slot
            // means the context was destroyed in the meantime.
            let still_pending = {
                let slot = handler_slot.lock().expect("handler slot lock");
                match slot.as_ref() {
                    None => return,
                    Some(handler) => handler.has_pending_local_activity(&task.activity_id),
                }
            };
            if !still_pending {
                return;
            }
            task.attempt += 1;
            if !tunnel.send_task(task) {
                debug!("Local activity retry dropped, tunnel closed");
            }
        });
        true
    }

    /// Route a workflow error (nondeterminism or panic) per the configured
    /// policy, then build the completion.
    fn apply_workflow_panic_policy(
        &self,
        state: &mut ContextState,
        input: &WorkflowTaskInput,
        workflow_error: Option<WorkflowError>,
    ) -> Result<Option<TaskCompletion>, WorkerError> {
        let mut workflow_error = workflow_error;
        if workflow_error.is_none() {
            if let Some(err @ WorkflowError::Panic { .. }) = &state.err {
                workflow_error = Some(err.clone());
            }
        }

        if let Some(err) = workflow_error {
            match &err {
                WorkflowError::Panic { stack_trace, .. } => error!(
                    workflow_type = %state.workflow_info.workflow_type,
                    workflow_id = %state.workflow_info.workflow_execution.workflow_id,
                    run_id = %self.run_id,
                    error = %err,
                    stack_trace = %stack_trace,
                    "Workflow panic"
                ),
                _ => error!(
                    workflow_type = %state.workflow_info.workflow_type,
                    workflow_id = %state.workflow_info.workflow_execution.workflow_id,
                    run_id = %self.run_id,
                    error = %err,
                    "Workflow panic"
                ),
            }

            match self.config.workflow_panic_policy {
                WorkflowPanicPolicy::FailWorkflow => {
                    state.is_workflow_completed = true;
                    state.result = None;
                    state.err = Some(WorkflowError::Application {
                        message: "Workflow failed on panic due to FailWorkflow workflow panic policy"
                            .to_string(),
                        error_type: String::new(),
                        non_retryable: false,
                        details: None,
                        cause: Some(Box::new(err)),
                    });
                }
                WorkflowPanicPolicy::BlockWorkflow => {
                    // Returned without acking: the server records a task
                    // failure and retries until the code is fixed or the
                    // workflow times out.
                    return Err(WorkerError::Workflow(err));
                }
            }
        }

        Ok(self.complete_workflow_task(state, input, true))
    }

    // ========== Completion ==========

    /// Build the completion for the current task, first dispatching any
    /// unstarted local activities. With `wait_for_local_activities`, returns
    /// `None` while results are outstanding; without it, emits a
    /// heartbeat-style completion that keeps the task open server-side.
    pub(crate) fn complete_workflow_task(
        &self,
        state: &mut ContextState,
        input: &WorkflowTaskInput,
        wait_for_local_activities: bool,
    ) -> Option<TaskCompletion> {
        state.current_task.as_ref()?;

        if self.has_pending_local_activity_work(state) {
            if let Some(tunnel) = state.la_tunnel.clone() {
                let result_tx = input.la_result_tx.clone();
                let _ = self.with_handler(|h| {
                    for mut task in h.take_unstarted_local_activities() {
                        task.result_tx = Some(result_tx.clone());
                        if !tunnel.send_task(task.clone()) {
                            task.result_tx = None;
                            h.local_activity_not_started(task);
                        }
                    }
                });
                if wait_for_local_activities {
                    return None;
                }
            }
        }

        if let Ok(commands) = self.with_handler(|h| h.drain_commands()) {
            state.new_commands.extend(commands);
        }

        let completion = self.build_completion(state, !wait_for_local_activities);
        self.clear_current_task(state);
        Some(completion)
    }

    fn has_pending_local_activity_work(&self, state: &ContextState) -> bool {
        let pending = self
            .with_handler(|h| h.pending_local_activity_count())
            .unwrap_or(0);
        !state.is_workflow_completed
            && state
                .current_task
                .as_ref()
                .map(|t| t.query.is_none())
                .unwrap_or(false)
            && pending > 0
    }

    fn build_completion(&self, state: &mut ContextState, force_new_task: bool) -> TaskCompletion {
        let current = state
            .current_task
            .clone()
            .expect("build_completion requires a current task");

        // Direct query tasks answer with a query response, never commands.
        if let Some(query) = &current.query {
            return TaskCompletion::QueryCompleted(self.answer_direct_query(
                state,
                &current,
                query,
            ));
        }

        let mut commands = std::mem::take(&mut state.new_commands);
        let mut force_create_new_workflow_task = force_new_task;

        let close_command = match &state.err {
            Some(WorkflowError::Canceled { details }) => Some(Command::new(
                CommandType::CancelWorkflowExecution,
                CommandAttributes::CancelWorkflowExecution(CancelWorkflowExecutionAttributes {
                    details: details.clone(),
                }),
            )),
            Some(WorkflowError::ContinueAsNew(params)) => Some(Command::new(
                CommandType::ContinueAsNewWorkflowExecution,
                CommandAttributes::ContinueAsNewWorkflowExecution(
                    ContinueAsNewWorkflowExecutionAttributes {
                        workflow_type: params.workflow_type.clone(),
                        task_queue: params.task_queue.clone(),
                        input: params.input.clone(),
                        workflow_run_timeout: params.workflow_run_timeout,
                        workflow_task_timeout: params.workflow_task_timeout,
                        header: params.header.clone(),
                        memo: state.workflow_info.memo.clone(),
                        search_attributes: state.workflow_info.search_attributes.clone(),
                    },
                ),
            )),
            Some(err) => Some(Command::new(
                CommandType::FailWorkflowExecution,
                CommandAttributes::FailWorkflowExecution(FailWorkflowExecutionAttributes {
                    failure: Some(err.to_failure()),
                }),
            )),
            None if state.is_workflow_completed => Some(Command::new(
                CommandType::CompleteWorkflowExecution,
                CommandAttributes::CompleteWorkflowExecution(
                    CompleteWorkflowExecutionAttributes {
                        result: state.result.clone(),
                    },
                ),
            )),
            None => None,
        };

        if let Some(close_command) = close_command {
            commands.push(close_command);
            force_create_new_workflow_task = false;
        }

        let mut query_results = HashMap::new();
        for (query_id, query) in &current.queries {
            let outcome = self.with_handler(|h| {
                h.process_query(&query.query_type, query.query_args.as_ref())
            });
            let result = match outcome {
                Ok(Ok(answer)) => WorkflowQueryResult {
                    result_type: QueryResultType::Answered,
                    answer,
                    error_message: None,
                },
                Ok(Err(err)) => WorkflowQueryResult {
                    result_type: QueryResultType::Failed,
                    answer: None,
                    error_message: Some(err.to_string()),
                },
                Err(err) => WorkflowQueryResult {
                    result_type: QueryResultType::Failed,
                    answer: None,
                    error_message: Some(err.to_string()),
                },
            };
            query_results.insert(query_id.clone(), result);
        }

        TaskCompletion::Completed(RespondWorkflowTaskCompletedRequest {
            task_token: current.task_token,
            commands,
            identity: self.config.identity.clone(),
            binary_checksum: binary_checksum(),
            return_new_workflow_task: true,
            force_create_new_workflow_task,
            query_results,
        })
    }

    fn answer_direct_query(
        &self,
        state: &mut ContextState,
        current: &CurrentTask,
        query: &WorkflowQuery,
    ) -> RespondQueryTaskCompletedRequest {
        if let Some(WorkflowError::Panic { message, .. }) = &state.err {
            return RespondQueryTaskCompletedRequest {
                task_token: current.task_token.clone(),
                completed_type: QueryResultType::Failed,
                query_result: None,
                error_message: Some(format!("Workflow panic: {}", message)),
            };
        }

        let outcome =
            self.with_handler(|h| h.process_query(&query.query_type, query.query_args.as_ref()));
        match outcome {
            Ok(Ok(result)) => RespondQueryTaskCompletedRequest {
                task_token: current.task_token.clone(),
                completed_type: QueryResultType::Answered,
                query_result: result,
                error_message: None,
            },
            Ok(Err(err)) => RespondQueryTaskCompletedRequest {
                task_token: current.task_token.clone(),
                completed_type: QueryResultType::Failed,
                query_result: None,
                error_message: Some(err.to_string()),
            },
            Err(err) => RespondQueryTaskCompletedRequest {
                task_token: current.task_token.clone(),
                completed_type: QueryResultType::Failed,
                query_result: None,
                error_message: Some(err.to_string()),
            },
        }
    }

    // ========== Unlock discipline ==========

    /// Release the big lock, deciding whether the context stays cached.
    /// Evicts when the task errored, the context holds an error, the
    /// workflow completed, or sticky execution is off and no local-activity
    /// work remains. If the cache already dropped the entry elsewhere, the
    /// state is still cleared so observers see a destroyed context.
    pub(crate) fn unlock(
        &self,
        mut state: MutexGuard<'_, ContextState>,
        task_error: Option<&WorkerError>,
    ) {
        let should_evict = task_error.is_some()
            || state.err.is_some()
            || state.is_workflow_completed
            || (self.config.disable_sticky_execution
                && !self.has_pending_local_activity_work(&state));

        if should_evict {
            let was_cached = self.cache.remove(&self.run_id).is_some();
            if was_cached && Self::should_reset_sticky_on_eviction(&state) {
                self.queue_reset_stickiness(&state);
            }
            self.clear_state_locked(&mut state);
        }
        drop(state);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    eprintln!("DEBUG is_string={} is_str={} is_box_str={} is_cow={} is_box_any={}",
        panic.downcast_ref::<String>().is_some(),
        panic.downcast_ref::<&str>().is_some(),
        panic.downcast_ref::<Box<str>>().is_some(),
        panic.downcast_ref::<std::borrow::Cow<'static, str>>().is_some(),
        panic.downcast_ref::<Box<dyn std::any::Any + Send>>().is_some(),
    );
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl std::fmt::Debug for WorkflowExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowExecutionContext")
            .field("run_id", &self.run_id)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
