// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Activity invoker.
//!
//! Wraps user activity implementations with deadline enforcement, panic
//! recovery, co-operative cancellation, and batched heartbeats. Heartbeats
//! are coalesced inside an 80%-of-heartbeat-timeout window: the first call
//! in a window goes out immediately, later calls only update the pending
//! details, and a batch-end timer flushes whatever is left.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weft_protocol::payload::Payloads;
use weft_protocol::retry::{service_retry_policy, with_retry};
use weft_protocol::service::{ServiceError, WorkflowService};
use weft_protocol::task::{
    ActivityTask, RecordActivityTaskHeartbeatRequest, RespondActivityTaskCanceledRequest,
    RespondActivityTaskCompletedRequest, RespondActivityTaskFailedRequest,
};

use crate::error::{WorkerError, WorkflowError};

/// Heartbeat interval used when the activity has no heartbeat timeout.
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(600);

/// Options for scheduling an activity from workflow code.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivityOptions {
    pub task_queue: String,
    pub schedule_to_close_timeout: Option<Duration>,
    pub schedule_to_start_timeout: Option<Duration>,
    pub start_to_close_timeout: Option<Duration>,
    pub heartbeat_timeout: Option<Duration>,
    pub retry_policy: Option<weft_protocol::retry::RetryPolicy>,
}

/// A registered activity implementation.
#[async_trait]
pub trait Activity: Send + Sync {
    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Payloads,
    ) -> Result<Payloads, WorkflowError>;
}

/// Registry of activity implementations, keyed by activity type.
#[derive(Default)]
pub struct ActivityRegistry {
    activities: HashMap<String, Arc<dyn Activity>>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, activity_type: impl Into<String>, activity: Arc<dyn Activity>) {
        self.activities.insert(activity_type.into(), activity);
    }

    pub fn get(&self, activity_type: &str) -> Option<Arc<dyn Activity>> {
        self.activities.get(activity_type).cloned()
    }

    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.activities.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Extracts tracing/baggage headers into the activity's ambient context
/// before user code runs.
pub trait ContextPropagator: Send + Sync {
    fn extract(&self, header: &weft_protocol::events::Header) -> Result<(), String>;
}

/// Per-invocation context handed to the activity implementation.
pub struct ActivityContext {
    task: ActivityTask,
    task_queue: String,
    cancellation: CancellationToken,
    invoker: Arc<HeartbeatInvoker>,
}

impl ActivityContext {
    pub fn task(&self) -> &ActivityTask {
        &self.task
    }

    pub fn task_queue(&self) -> &str {
        &self.task_queue
    }

    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        self.task.heartbeat_timeout
    }

    /// Resolves when the server (or the worker shutdown) requests
    /// cancellation. Co-operative: the activity may finish its work and
    /// still complete.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Report progress. Batched; see the module docs.
    pub async fn record_heartbeat(&self, details: Option<Payloads>) -> Result<(), ServiceError> {
        HeartbeatInvoker::heartbeat(&self.invoker, details, false).await
    }
}

/// Outcome of one activity invocation, ready for delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityTaskResult {
    Completed(RespondActivityTaskCompletedRequest),
    Failed(RespondActivityTaskFailedRequest),
    Canceled(RespondActivityTaskCanceledRequest),
}

struct HeartbeatState {
    /// `Some(details)` while a batch window is open and details are
    /// buffered; the inner option mirrors heartbeats without details.
    pending_details: Option<Option<Payloads>>,
    batch_window_open: bool,
}

/// Sends activity heartbeats on behalf of one task, batching bursts.
pub struct HeartbeatInvoker {
    service: Arc<dyn WorkflowService>,
    identity: String,
    task_token: Vec<u8>,
    heartbeat_timeout: Duration,
    cancel_handler: CancellationToken,
    close: CancellationToken,
    worker_stop: CancellationToken,
    state: Mutex<HeartbeatState>,
}

impl HeartbeatInvoker {
    pub fn new(
        service: Arc<dyn WorkflowService>,
        identity: String,
        task_token: Vec<u8>,
        heartbeat_timeout: Option<Duration>,
        cancel_handler: CancellationToken,
        worker_stop: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            service,
            identity,
            task_token,
            heartbeat_timeout: heartbeat_timeout
                .filter(|timeout| !timeout.is_zero())
                .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL),
            cancel_handler,
            close: CancellationToken::new(),
            worker_stop,
            state: Mutex::new(HeartbeatState {
                pending_details: None,
                batch_window_open: false,
            }),
        })
    }

    /// Record a heartbeat. Within an open batch window the details are
    /// buffered and flushed by the window timer; otherwise the heartbeat is
    /// sent immediately and a new window opens.
    pub fn heartbeat(
        invoker: &Arc<Self>,
        details: Option<Payloads>,
        skip_batching: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), ServiceError>> + Send + '_>>
    {
        Box::pin(async move {
        {
            let mut state = invoker.state.lock().expect("heartbeat state lock");
            if state.batch_window_open && !skip_batching {
                state.pending_details = Some(details);
                return Ok(());
            }
        }

        let (cancel_requested, result) = invoker.internal_heartbeat(details).await;

        // Cancellation is co-operative, so a canceled activity keeps its
        // batching alive; it may continue heartbeating until it completes.
        if (result.is_ok() || cancel_requested) && !skip_batching {
            {
                let mut state = invoker.state.lock().expect("heartbeat state lock");
                state.pending_details = None;
                state.batch_window_open = true;
            }
            let invoker = invoker.clone();
            tokio::spawn(async move {
                let window = invoker.heartbeat_timeout.mul_f64(0.8);
                tokio::select! {
                    _ = tokio::time::sleep(window) => {}
                    _ = invoker.worker_stop.cancelled() => {}
                    _ = invoker.close.cancelled() => return,
                }
                let pending = {
                    let mut state = invoker.state.lock().expect("heartbeat state lock");
                    state.batch_window_open = false;
                    state.pending_details.take()
                };
                if let Some(details) = pending {
                    let _ = Self::heartbeat(&invoker, details, false).await;
                }
            });
        }

        result
        })
    }

    /// One heartbeat RPC, with transient-error retries. Returns whether the
    /// server requested cancellation alongside the call result.
    async fn internal_heartbeat(
        &self,
        details: Option<Payloads>,
    ) -> (bool, Result<(), ServiceError>) {
        let request = RecordActivityTaskHeartbeatRequest {
            task_token: self.task_token.clone(),
            details,
            identity: self.identity.clone(),
        };

        let response = with_retry(&service_retry_policy(), || {
            let request = request.clone();
            async move { self.service.record_activity_task_heartbeat(request).await }
        })
        .await;

        match response {
            Ok(response) if response.cancel_requested => {
                self.cancel_handler.cancel();
                (true, Ok(()))
            }
            Ok(_) => (false, Ok(())),
            Err(
                err @ (ServiceError::NotFound(_)
                | ServiceError::NamespaceNotActive(_)
                | ServiceError::Canceled),
            ) => {
                // The execution is gone or canceling; stop the activity.
                self.cancel_handler.cancel();
                (true, Err(err))
            }
            Err(err) => (false, Err(err)),
        }
    }

    /// Stop the batching machinery. Flushes buffered details unless the
    /// activity completed successfully, in which case progress no longer
    /// matters.
    pub async fn close(&self, flush_buffered_heartbeat: bool) {
        self.close.cancel();
        let pending = {
            let mut state = self.state.lock().expect("heartbeat state lock");
            state.batch_window_open = false;
            state.pending_details.take()
        };
        if flush_buffered_heartbeat {
            if let Some(details) = pending {
                let _ = self.internal_heartbeat(details).await;
            }
        }
    }
}

/// Executes polled activity tasks against the registry.
pub struct ActivityTaskProcessor {
    task_queue: String,
    identity: String,
    service: Arc<dyn WorkflowService>,
    registry: Arc<ActivityRegistry>,
    context_propagators: Vec<Arc<dyn ContextPropagator>>,
    worker_stop: CancellationToken,
}

impl ActivityTaskProcessor {
    pub fn new(
        task_queue: impl Into<String>,
        identity: impl Into<String>,
        service: Arc<dyn WorkflowService>,
        registry: Arc<ActivityRegistry>,
        worker_stop: CancellationToken,
    ) -> Self {
        Self {
            task_queue: task_queue.into(),
            identity: identity.into(),
            service,
            registry,
            context_propagators: Vec::new(),
            worker_stop,
        }
    }

    pub fn with_context_propagators(
        mut self,
        propagators: Vec<Arc<dyn ContextPropagator>>,
    ) -> Self {
        self.context_propagators = propagators;
        self
    }

    /// Execute one activity task to a deliverable result.
    pub async fn execute(&self, task: ActivityTask) -> Result<ActivityTaskResult, WorkerError> {
        debug!(
            workflow_id = %task.workflow_execution.workflow_id,
            run_id = %task.workflow_execution.run_id,
            activity_type = %task.activity_type,
            "Processing new activity task"
        );

        let Some(activity) = self.registry.get(&task.activity_type) else {
            return Err(WorkerError::UnknownActivityType {
                activity_type: task.activity_type.clone(),
                supported: self.registry.registered_names().join(", "),
            });
        };

        // Propagate tracing/baggage before user code observes the context.
        if let Some(header) = &task.header {
            for propagator in &self.context_propagators {
                propagator
                    .extract(header)
                    .map_err(WorkerError::ContextPropagation)?;
            }
        }

        let cancellation = CancellationToken::new();
        let invoker = HeartbeatInvoker::new(
            self.service.clone(),
            self.identity.clone(),
            task.task_token.clone(),
            task.heartbeat_timeout,
            cancellation.clone(),
            self.worker_stop.clone(),
        );

        let deadline = activity_deadline(&task);
        let ctx = ActivityContext {
            task: task.clone(),
            task_queue: self.task_queue.clone(),
            cancellation,
            invoker: invoker.clone(),
        };

        let execution = std::panic::AssertUnwindSafe(activity.execute(&ctx, task.input.clone()))
            .catch_unwind();
        let outcome = tokio::time::timeout(deadline, execution).await;

        let result = match outcome {
            Err(_elapsed) => {
                // Too late to respond; the server has already timed the
                // attempt out and possibly retried it elsewhere.
                info!(
                    workflow_id = %task.workflow_execution.workflow_id,
                    run_id = %task.workflow_execution.run_id,
                    activity_type = %task.activity_type,
                    "Activity complete after timeout"
                );
                Err(WorkerError::ActivityDeadlineExceeded)
            }
            Ok(Err(panic)) => {
                let message = panic_message(panic);
                error!(
                    workflow_id = %task.workflow_execution.workflow_id,
                    run_id = %task.workflow_execution.run_id,
                    activity_type = %task.activity_type,
                    panic_error = %message,
                    "Activity panic"
                );
                let failure = WorkflowError::Panic {
                    message: format!("activity panic: {}", message),
                    stack_trace: std::backtrace::Backtrace::force_capture().to_string(),
                }
                .to_failure();
                Ok(ActivityTaskResult::Failed(RespondActivityTaskFailedRequest {
                    task_token: task.task_token.clone(),
                    failure: Some(failure),
                    identity: self.identity.clone(),
                }))
            }
            Ok(Ok(Ok(result))) => {
                Ok(ActivityTaskResult::Completed(RespondActivityTaskCompletedRequest {
                    task_token: task.task_token.clone(),
                    result: Some(result),
                    identity: self.identity.clone(),
                }))
            }
            Ok(Ok(Err(WorkflowError::Canceled { details }))) => {
                Ok(ActivityTaskResult::Canceled(RespondActivityTaskCanceledRequest {
                    task_token: task.task_token.clone(),
                    details,
                    identity: self.identity.clone(),
                }))
            }
            Ok(Ok(Err(err))) => {
                warn!(
                    workflow_id = %task.workflow_execution.workflow_id,
                    run_id = %task.workflow_execution.run_id,
                    activity_type = %task.activity_type,
                    error = %err,
                    "Activity error"
                );
                Ok(ActivityTaskResult::Failed(RespondActivityTaskFailedRequest {
                    task_token: task.task_token.clone(),
                    failure: Some(err.to_failure()),
                    identity: self.identity.clone(),
                }))
            }
        };

        // Flush buffered progress unless the activity completed.
        let completed = matches!(result, Ok(ActivityTaskResult::Completed(_)));
        invoker.close(!completed).await;

        result
    }
}

/// Effective deadline from the task's schedule-to-close / start-to-close
/// timeouts; activities without either get a generous default.
fn activity_deadline(task: &ActivityTask) -> Duration {
    match (task.schedule_to_close_timeout, task.start_to_close_timeout) {
        (Some(schedule), Some(start)) => schedule.min(start),
        (Some(schedule), None) => schedule,
        (None, Some(start)) => start,
        (None, None) => Duration::from_secs(60 * 60 * 24),
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
