// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow task processor.
//!
//! The top-level loop for one polled workflow task: locate or create the
//! cached execution context, replay the task's events through it, and when
//! local activities keep the task open, race their results against the
//! workflow task deadline - forcing a heartbeat completion when time runs
//! low so the server does not time the task out.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, instrument};

use weft_protocol::events::{EventAttributes, HistoryEvent};
use weft_protocol::service::ServiceError;
use weft_protocol::task::{
    RespondQueryTaskCompletedRequest, RespondWorkflowTaskCompletedRequest,
    RespondWorkflowTaskFailedRequest, WorkflowTask, WorkflowTaskFailedCause,
};

use crate::cache::{sticky_cache, WorkflowCache};
use crate::checksum::binary_checksum;
use crate::config::WorkerConfig;
use crate::context::{
    reset_history, EventHandlerFactory, LocalActivityResult, LocalActivityTunnel,
    WorkflowExecutionContext, WorkflowInfo, WorkflowTaskInput,
};
use crate::error::{WorkerError, WorkflowError};
use crate::history::HistoryIterator;

/// Fraction of the workflow task timeout after which a pending-local-activity
/// task is force-completed with a heartbeat.
const RATIO_TO_FORCE_COMPLETE_WORKFLOW_TASK: f64 = 0.8;

/// The response produced for one processed workflow task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskCompletion {
    Completed(RespondWorkflowTaskCompletedRequest),
    Failed(RespondWorkflowTaskFailedRequest),
    QueryCompleted(RespondQueryTaskCompletedRequest),
}

/// Delivers a heartbeat completion mid-task and returns the follow-up task
/// the server responds with, if any. The processor keeps the local-activity
/// channel of the original input, so implementations only supply the new
/// task and its iterator.
#[async_trait]
pub trait WorkflowTaskHeartbeat: Send + Sync {
    async fn workflow_task_heartbeat(
        &self,
        completion: TaskCompletion,
        task_start: Instant,
    ) -> Result<Option<(WorkflowTask, Box<dyn HistoryIterator>)>, ServiceError>;
}

/// Test/operations hook invoked for every live (non-replay) event before it
/// reaches the workflow.
pub trait PressurePointHandler: Send + Sync {
    fn execute(&self, event: &HistoryEvent) -> Result<(), WorkerError>;
}

/// Processes polled workflow tasks against cached execution contexts.
pub struct WorkflowTaskProcessor {
    config: Arc<WorkerConfig>,
    factory: Arc<dyn EventHandlerFactory>,
    cache: Arc<WorkflowCache>,
    la_tunnel: Option<LocalActivityTunnel>,
    pressure_points: Option<Arc<dyn PressurePointHandler>>,
}

impl WorkflowTaskProcessor {
    /// Create a processor backed by the process-wide sticky cache.
    pub fn new(config: Arc<WorkerConfig>, factory: Arc<dyn EventHandlerFactory>) -> Self {
        Self::with_cache(config, factory, sticky_cache())
    }

    /// Create a processor with an explicit cache (used by tests and
    /// dedicated replay tooling).
    pub fn with_cache(
        config: Arc<WorkerConfig>,
        factory: Arc<dyn EventHandlerFactory>,
        cache: Arc<WorkflowCache>,
    ) -> Self {
        Self {
            config,
            factory,
            cache,
            la_tunnel: None,
            pressure_points: None,
        }
    }

    pub fn with_local_activity_tunnel(mut self, tunnel: LocalActivityTunnel) -> Self {
        self.la_tunnel = Some(tunnel);
        self
    }

    pub fn with_pressure_points(mut self, handler: Arc<dyn PressurePointHandler>) -> Self {
        self.pressure_points = Some(handler);
        self
    }

    /// Process one workflow task to a completion.
    ///
    /// Returns `Ok(None)` when a heartbeat consumed the task (the server
    /// returned no follow-up) - there is nothing left to deliver.
    #[instrument(skip_all, fields(
        workflow_type = %input.task.workflow_type,
        workflow_id = %input.task.workflow_execution.workflow_id,
        run_id = %input.task.workflow_execution.run_id,
    ))]
    pub async fn process_workflow_task(
        &self,
        mut input: WorkflowTaskInput,
        heartbeat: &dyn WorkflowTaskHeartbeat,
    ) -> Result<Option<TaskCompletion>, WorkerError> {
        if input.task.history.events.is_empty() && input.task.query.is_none() {
            return Err(WorkerError::EmptyTask);
        }
        if input.task.query.is_some() && !input.task.queries.is_empty() {
            return Err(WorkerError::InvalidQueryTask);
        }

        debug!(
            previous_started_event_id = input.task.previous_started_event_id,
            started_event_id = input.task.started_event_id,
            "Processing new workflow task"
        );

        let context = self.get_or_create_workflow_context(&mut input).await?;
        let mut state = context.lock_state().await;
        context.set_la_tunnel_if_absent(&mut state, self.la_tunnel.as_ref());

        let result = self
            .process_with_context(&context, &mut state, &mut input, heartbeat)
            .await;

        context.unlock(state, result.as_ref().err());
        result
    }

    async fn process_with_context(
        &self,
        context: &Arc<WorkflowExecutionContext>,
        state: &mut crate::context::ContextState,
        input: &mut WorkflowTaskInput,
        heartbeat: &dyn WorkflowTaskHeartbeat,
    ) -> Result<Option<TaskCompletion>, WorkerError> {
        'process_workflow: loop {
            let task_start = Instant::now();
            let response = context.process_task(state, input).await?;
            if let Some(completion) = response {
                return Ok(Some(completion));
            }

            // Local activities are pending; wait for results, heartbeating
            // before the server-side task deadline expires.
            loop {
                let mut task_timeout = state.workflow_info.workflow_task_timeout;
                if task_timeout.is_zero() {
                    task_timeout = self.config.default_workflow_task_timeout;
                }
                let deadline =
                    task_start + task_timeout.mul_f64(RATIO_TO_FORCE_COMPLETE_WORKFLOW_TASK);

                enum WaitOutcome {
                    DeadlineReached,
                    LocalActivity(Option<LocalActivityResult>),
                }

                let outcome = {
                    let la_result = input.la_result_rx.recv();
                    tokio::pin!(la_result);
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline.into()) => {
                            WaitOutcome::DeadlineReached
                        }
                        result = &mut la_result => WaitOutcome::LocalActivity(result),
                    }
                };

                match outcome {
                    WaitOutcome::DeadlineReached => {
                        let Some(completion) = context.complete_workflow_task(state, input, false)
                        else {
                            return Ok(None);
                        };
                        match heartbeat.workflow_task_heartbeat(completion, task_start).await {
                            Err(err) => {
                                return Err(WorkerError::WorkflowTaskHeartbeat(err.to_string()));
                            }
                            Ok(None) => return Ok(None),
                            Ok(Some((task, iterator))) => {
                                debug!("Workflow task heartbeat returned a follow-up task");
                                input.task = task;
                                input.history_iterator = iterator;
                                continue 'process_workflow;
                            }
                        }
                    }
                    WaitOutcome::LocalActivity(None) => {
                        // Result channel closed: the worker is shutting down
                        // and no completion can be produced for this task.
                        return Ok(None);
                    }
                    WaitOutcome::LocalActivity(Some(result)) => {
                        let response = context
                            .process_local_activity_result(state, input, result)
                            .await?;
                        match response {
                            None => continue,
                            Some(completion) => return Ok(Some(completion)),
                        }
                    }
                }
            }
        }
    }

    /// Locate the cached context for the task's run, or build one - resetting
    /// to full history when a delta page arrives for an evicted run.
    async fn get_or_create_workflow_context(
        &self,
        input: &mut WorkflowTaskInput,
    ) -> Result<Arc<WorkflowExecutionContext>, WorkerError> {
        let run_id = input.task.workflow_execution.run_id.clone();
        let is_full_history = input.task.is_full_history();

        let cached = if input.task.query.is_none() || !is_full_history {
            self.cache.get(&run_id)
        } else {
            None
        };
        if let Some(context) = cached {
            return Ok(context);
        }

        if !is_full_history {
            // Partial-history task but the cached state is gone; restart the
            // replay from the beginning.
            debug!(run_id = %run_id, "Sticky cache miss, resetting history");
            reset_history(input).await?;
        }

        let context = self.create_workflow_context(&input.task)?;
        if !self.config.disable_sticky_execution && input.task.query.is_none() {
            let (context, evicted) = self.cache.put_if_absent(&run_id, context);
            if let Some(victim) = evicted {
                victim.on_eviction().await;
            }
            return Ok(context);
        }
        Ok(context)
    }

    fn create_workflow_context(
        &self,
        task: &WorkflowTask,
    ) -> Result<Arc<WorkflowExecutionContext>, WorkerError> {
        let first_event = task
            .history
            .events
            .first()
            .ok_or(WorkerError::MissingStartedEvent)?;
        let EventAttributes::WorkflowExecutionStarted(attributes) = &first_event.attributes else {
            return Err(WorkerError::MissingStartedEvent);
        };
        if attributes.task_queue.is_empty() {
            return Err(WorkerError::MissingTaskQueue);
        }

        let workflow_info = WorkflowInfo {
            workflow_execution: task.workflow_execution.clone(),
            workflow_type: task.workflow_type.clone(),
            task_queue: attributes.task_queue.clone(),
            namespace: self.config.namespace.clone(),
            attempt: attributes.attempt,
            workflow_execution_timeout: attributes.workflow_execution_timeout,
            workflow_run_timeout: attributes.workflow_run_timeout,
            workflow_task_timeout: attributes.workflow_task_timeout,
            cron_schedule: attributes.cron_schedule.clone(),
            continued_execution_run_id: attributes.continued_execution_run_id.clone(),
            parent_workflow_namespace: attributes.parent_workflow_namespace.clone(),
            parent_workflow_execution: attributes.parent_workflow_execution.clone(),
            memo: attributes.memo.clone(),
            search_attributes: attributes.search_attributes.clone(),
            binary_checksum: String::new(),
        };

        Ok(WorkflowExecutionContext::new(
            workflow_info,
            self.factory.clone(),
            self.config.clone(),
            self.cache.clone(),
            self.pressure_points.clone(),
        ))
    }

    /// Build the task-failed report for a processing error.
    pub fn error_to_fail_workflow_task(
        &self,
        task_token: Vec<u8>,
        error: &WorkerError,
    ) -> RespondWorkflowTaskFailedRequest {
        let failure = match error {
            WorkerError::Workflow(workflow_error) => workflow_error.to_failure(),
            other => WorkflowError::application(other.to_string()).to_failure(),
        };
        RespondWorkflowTaskFailedRequest {
            task_token,
            cause: Some(WorkflowTaskFailedCause::WorkflowWorkerUnhandledFailure),
            failure: Some(failure),
            identity: self.config.identity.clone(),
            binary_checksum: binary_checksum(),
        }
    }
}
