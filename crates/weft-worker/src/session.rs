// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Session coordination.
//!
//! A session pins subsequent activities of one workflow to the single worker
//! that owns a scarce resource. It is built from two internal activities and
//! process-local state: the long-running creation activity acquires an
//! admission token, signals the workflow which worker won, and heartbeats
//! until the session completes; the short completion activity closes the
//! session's done channel so the creation activity can exit and return its
//! token. Sessions are never persisted - if the worker dies, the server
//! observes the heartbeat timeout and the workflow sees the session fail.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use weft_protocol::payload::Payloads;
use weft_protocol::retry::RetryPolicy;
use weft_protocol::service::WorkflowService;
use weft_protocol::task::SignalWorkflowExecutionRequest;

use crate::activity::{Activity, ActivityContext, ActivityOptions, ActivityRegistry};
use crate::config::WorkerConfig;
use crate::error::{SessionError, WorkflowError};

/// Name of the long-running creation activity.
pub const SESSION_CREATION_ACTIVITY_NAME: &str = "internalSessionCreationActivity";

/// Name of the completion activity.
pub const SESSION_COMPLETION_ACTIVITY_NAME: &str = "internalSessionCompletionActivity";

/// Heartbeat timeout applied when [`SessionOptions`] does not set one.
pub const DEFAULT_SESSION_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(20);

/// Creation-activity heartbeats never space out further than this.
const MAX_SESSION_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Schedule/start timeouts for the completion activity. Short: the target
/// worker is known to be alive, it just signaled.
const SESSION_COMPLETION_TIMEOUT: Duration = Duration::from_secs(3);

/// Task queue the creation activity is scheduled on.
pub fn creation_task_queue(base: &str) -> String {
    format!("{}__internal_session_creation", base)
}

/// Task queue owned by exactly one worker, derived from its resource.
pub fn resource_specific_task_queue(resource_id: &str, host_name: &str) -> String {
    format!("{}@{}", resource_id, host_name)
}

/// Lifecycle of a session as seen by its workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Failed,
    Closed,
}

/// Session creation parameters.
///
/// `execution_timeout` bounds the whole session; `creation_timeout` bounds
/// how long creation may wait for a worker; `heartbeat_timeout` is how fast
/// the server declares a session's worker dead (default 20s).
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub execution_timeout: Duration,
    pub creation_timeout: Duration,
    pub heartbeat_timeout: Option<Duration>,
}

impl SessionOptions {
    pub fn new(execution_timeout: Duration, creation_timeout: Duration) -> Self {
        Self {
            execution_timeout,
            creation_timeout,
            heartbeat_timeout: None,
        }
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }
}

/// Information about an established session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub host_name: String,
    pub resource_id: String,
    pub task_queue: String,
    pub state: SessionState,
}

/// Payload of the creation-response signal sent to the workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCreationResponse {
    #[serde(rename = "Tasklist")]
    pub tasklist: String,
    #[serde(rename = "HostName")]
    pub host_name: String,
    #[serde(rename = "ResourceID")]
    pub resource_id: String,
}

/// Canonical recreate-token shape: `{"Tasklist":"<string>"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RecreateParams {
    #[serde(rename = "Tasklist")]
    tasklist: String,
}

/// Serialize the token handed across runs for worker affinity.
pub fn serialize_recreate_token(tasklist: &str) -> Vec<u8> {
    serde_json::to_vec(&RecreateParams {
        tasklist: tasklist.to_string(),
    })
    .expect("recreate token serialization cannot fail")
}

fn deserialize_recreate_token(token: &[u8]) -> Result<RecreateParams, SessionError> {
    serde_json::from_slice(token).map_err(|err| SessionError::InvalidRecreateToken(err.to_string()))
}

// ============================================================================
// Admission control
// ============================================================================

/// Bounds the number of concurrently open sessions on this worker.
pub struct SessionTokenBucket {
    semaphore: Arc<Semaphore>,
}

impl SessionTokenBucket {
    pub fn new(concurrent_session_execution_size: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrent_session_execution_size)),
        }
    }

    /// Take a token without blocking. False when the bucket is empty.
    pub fn try_acquire_token(&self) -> bool {
        match self.semaphore.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Return a token, waking one waiter.
    pub fn add_token(&self) {
        self.semaphore.add_permits(1);
    }

    /// Block until at least one token is available, without taking it. Used
    /// by the session poller to gate polling on capacity.
    pub async fn wait_for_available_token(&self) {
        if let Ok(permit) = self.semaphore.acquire().await {
            drop(permit);
        }
    }

    pub fn available_tokens(&self) -> usize {
        self.semaphore.available_permits()
    }
}

// ============================================================================
// Worker-side environment
// ============================================================================

/// Process-local session state on the worker that owns the resource.
pub struct SessionEnvironment {
    resource_id: String,
    host_name: String,
    resource_task_queue: String,
    done_channels: StdMutex<HashMap<String, oneshot::Sender<()>>>,
    token_bucket: SessionTokenBucket,
}

impl SessionEnvironment {
    pub fn new(
        resource_id: impl Into<String>,
        host_name: impl Into<String>,
        concurrent_session_execution_size: usize,
    ) -> Arc<Self> {
        let resource_id = resource_id.into();
        let host_name = host_name.into();
        let resource_task_queue = resource_specific_task_queue(&resource_id, &host_name);
        Arc::new(Self {
            resource_id,
            host_name,
            resource_task_queue,
            done_channels: StdMutex::new(HashMap::new()),
            token_bucket: SessionTokenBucket::new(concurrent_session_execution_size),
        })
    }

    /// Admit a session, registering its done channel.
    pub fn create_session(&self, session_id: &str) -> Result<oneshot::Receiver<()>, SessionError> {
        if !self.token_bucket.try_acquire_token() {
            return Err(SessionError::TooManySessions);
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.done_channels
            .lock()
            .expect("session done-channel lock")
            .insert(session_id.to_string(), done_tx);
        Ok(done_rx)
    }

    /// Close the session's done channel. Removing the sender first makes the
    /// close exactly-once even under racing completions.
    pub fn complete_session(&self, session_id: &str) {
        let done_tx = self
            .done_channels
            .lock()
            .expect("session done-channel lock")
            .remove(session_id);
        if let Some(done_tx) = done_tx {
            let _ = done_tx.send(());
        }
    }

    pub fn add_session_token(&self) {
        self.token_bucket.add_token();
    }

    pub fn token_bucket(&self) -> &SessionTokenBucket {
        &self.token_bucket
    }

    pub fn resource_specific_task_queue(&self) -> &str {
        &self.resource_task_queue
    }

    pub fn creation_response(&self) -> SessionCreationResponse {
        SessionCreationResponse {
            tasklist: self.resource_task_queue.clone(),
            host_name: self.host_name.clone(),
            resource_id: self.resource_id.clone(),
        }
    }
}

/// Returns the admission token when the creation activity exits.
struct SessionTokenGuard {
    environment: Arc<SessionEnvironment>,
}

impl Drop for SessionTokenGuard {
    fn drop(&mut self) {
        self.environment.add_session_token();
    }
}

// ============================================================================
// Built-in activities
// ============================================================================

/// Long-running creation activity: admission, creation-response signal, then
/// heartbeats until completion or cancellation.
pub struct SessionCreationActivity {
    environment: Arc<SessionEnvironment>,
    service: Arc<dyn WorkflowService>,
    namespace: String,
    identity: String,
}

impl SessionCreationActivity {
    pub fn new(
        environment: Arc<SessionEnvironment>,
        service: Arc<dyn WorkflowService>,
        namespace: impl Into<String>,
        identity: impl Into<String>,
    ) -> Self {
        Self {
            environment,
            service,
            namespace: namespace.into(),
            identity: identity.into(),
        }
    }

    async fn signal_creation_response(
        &self,
        ctx: &ActivityContext,
        session_id: &str,
    ) -> Result<(), WorkflowError> {
        let input = Payloads::json(&self.environment.creation_response()).map_err(|err| {
            WorkflowError::application(format!("failed to encode creation response: {}", err))
        })?;
        let request = SignalWorkflowExecutionRequest {
            namespace: self.namespace.clone(),
            workflow_execution: ctx.task().workflow_execution.clone(),
            signal_name: session_id.to_string(),
            input,
            identity: self.identity.clone(),
        };
        self.service
            .signal_workflow_execution(request)
            .await
            .map_err(|err| {
                WorkflowError::application(format!("failed to signal creation response: {}", err))
            })
    }
}

#[async_trait]
impl Activity for SessionCreationActivity {
    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Payloads,
    ) -> Result<Payloads, WorkflowError> {
        let session_id: String = input.first_json().map_err(|err| {
            WorkflowError::application(format!("invalid session id payload: {}", err))
        })?;

        let mut done = self.environment.create_session(&session_id).map_err(|_| {
            // Retryable: tokens return as other sessions complete.
            WorkflowError::Application {
                message: "too many outstanding sessions".to_string(),
                error_type: "TooManySessions".to_string(),
                non_retryable: false,
                details: None,
                cause: None,
            }
        })?;
        let _token_guard = SessionTokenGuard {
            environment: self.environment.clone(),
        };

        self.signal_creation_response(ctx, &session_id).await?;
        debug!(session_id = %session_id, "Session created");

        let heartbeat_timeout = ctx
            .heartbeat_timeout()
            .filter(|timeout| !timeout.is_zero())
            .unwrap_or(DEFAULT_SESSION_HEARTBEAT_TIMEOUT);
        let heartbeat_interval = (heartbeat_timeout / 3).min(MAX_SESSION_HEARTBEAT_INTERVAL);
        let mut ticker = tokio::time::interval(heartbeat_interval);
        ticker.tick().await; // the first tick is immediate

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    self.environment.complete_session(&session_id);
                    return Err(WorkflowError::canceled());
                }
                _ = ticker.tick() => {
                    if let Err(err) = ctx.record_heartbeat(None).await {
                        warn!(session_id = %session_id, error = %err, "Session heartbeat failed");
                        self.environment.complete_session(&session_id);
                        return Err(WorkflowError::application(format!(
                            "session heartbeat failed: {}",
                            err
                        )));
                    }
                }
                _ = &mut done => {
                    debug!(session_id = %session_id, "Session completed");
                    return Ok(Payloads::empty());
                }
            }
        }
    }
}

/// Completion activity: closes the named done channel so the creation
/// activity exits and releases the resource without waiting for a heartbeat
/// round trip.
pub struct SessionCompletionActivity {
    environment: Arc<SessionEnvironment>,
}

impl SessionCompletionActivity {
    pub fn new(environment: Arc<SessionEnvironment>) -> Self {
        Self { environment }
    }
}

#[async_trait]
impl Activity for SessionCompletionActivity {
    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Payloads,
    ) -> Result<Payloads, WorkflowError> {
        let session_id: String = input.first_json().map_err(|err| {
            WorkflowError::application(format!("invalid session id payload: {}", err))
        })?;
        self.environment.complete_session(&session_id);
        Ok(Payloads::empty())
    }
}

/// Build the worker's session environment from its configuration, or `None`
/// when the session worker is disabled. Without an explicit resource id the
/// worker is its own resource.
pub fn session_environment_from_config(config: &WorkerConfig) -> Option<Arc<SessionEnvironment>> {
    if !config.enable_session_worker {
        return None;
    }
    let resource_id = config
        .session_resource_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    Some(SessionEnvironment::new(
        resource_id,
        config.host_name.clone(),
        config.max_concurrent_session_execution_size,
    ))
}

/// Register both session activities with a worker's registry.
pub fn register_session_activities(
    registry: &mut ActivityRegistry,
    environment: Arc<SessionEnvironment>,
    service: Arc<dyn WorkflowService>,
    namespace: impl Into<String>,
    identity: impl Into<String>,
) {
    registry.register(
        SESSION_CREATION_ACTIVITY_NAME,
        Arc::new(SessionCreationActivity::new(
            environment.clone(),
            service,
            namespace,
            identity,
        )),
    );
    registry.register(
        SESSION_COMPLETION_ACTIVITY_NAME,
        Arc::new(SessionCompletionActivity::new(environment)),
    );
}

// ============================================================================
// Workflow-side state machine
// ============================================================================

/// Seam to the deterministic workflow interpreter: scheduling activities,
/// receiving signals, spawning workflow-scope background work.
#[async_trait]
pub trait SessionWorkflowHost: Send + Sync {
    /// Schedule an activity and wait for its result; `cancellation` wires
    /// session cancellation into the activity.
    async fn execute_activity(
        &self,
        options: ActivityOptions,
        activity_name: &str,
        input: Payloads,
        cancellation: CancellationToken,
    ) -> Result<Payloads, WorkflowError>;

    /// Receive one payload from the named signal channel.
    async fn receive_signal(&self, signal_name: &str) -> Result<Payloads, WorkflowError>;

    /// Run background work in workflow scope.
    fn spawn(&self, future: futures::future::BoxFuture<'static, ()>);

    /// Produce the session identifier. Hosts should record this as a side
    /// effect so replay sees the same id.
    fn generate_session_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Retry policy for session creation: admission rejections resolve as other
/// sessions complete.
fn creation_retry_policy() -> RetryPolicy {
    RetryPolicy {
        initial_interval: Duration::from_secs(1),
        backoff_coefficient: 1.1,
        maximum_interval: Some(Duration::from_secs(10)),
        maximum_attempts: 0,
        non_retryable_error_types: Vec::new(),
    }
}

/// Creates and tracks sessions for one workflow.
pub struct SessionClient {
    host: Arc<dyn SessionWorkflowHost>,
    base_task_queue: String,
    current: StdMutex<Option<Arc<StdMutex<SessionInfo>>>>,
}

impl SessionClient {
    pub fn new(host: Arc<dyn SessionWorkflowHost>, base_task_queue: impl Into<String>) -> Self {
        Self {
            host,
            base_task_queue: base_task_queue.into(),
            current: StdMutex::new(None),
        }
    }

    /// Create a session on this workflow's base task queue.
    pub async fn create_session(
        &self,
        options: &SessionOptions,
    ) -> Result<SessionHandle, SessionError> {
        self.create(creation_task_queue(&self.base_task_queue), options, true)
            .await
    }

    /// Recreate a session on the worker a previous session ran on, using the
    /// token from [`SessionHandle::recreate_token`].
    pub async fn recreate_session(
        &self,
        recreate_token: &[u8],
        options: &SessionOptions,
    ) -> Result<SessionHandle, SessionError> {
        let params = deserialize_recreate_token(recreate_token)?;
        self.create(params.tasklist, options, true).await
    }

    async fn create(
        &self,
        creation_task_queue: String,
        options: &SessionOptions,
        retryable: bool,
    ) -> Result<SessionHandle, SessionError> {
        {
            let current = self.current.lock().expect("session client lock");
            if let Some(info) = current.as_ref() {
                if info.lock().expect("session info lock").state == SessionState::Open {
                    return Err(SessionError::ExistingOpenSession);
                }
            }
        }

        let session_id = self.host.generate_session_id();
        debug!(session_id = %session_id, "Start creating session");

        let heartbeat_timeout = options
            .heartbeat_timeout
            .filter(|timeout| !timeout.is_zero())
            .unwrap_or(DEFAULT_SESSION_HEARTBEAT_TIMEOUT);
        let activity_options = ActivityOptions {
            task_queue: creation_task_queue,
            schedule_to_start_timeout: Some(options.creation_timeout),
            start_to_close_timeout: Some(options.execution_timeout),
            heartbeat_timeout: Some(heartbeat_timeout),
            retry_policy: retryable.then(creation_retry_policy),
            ..Default::default()
        };

        // Session scope: completing or failing the session cancels the
        // creation activity and every user activity scheduled within it.
        let cancellation = CancellationToken::new();

        let creation_input = Payloads::json(&session_id)
            .map_err(|err| SessionError::Workflow(WorkflowError::application(err.to_string())))?;
        let (creation_tx, mut creation_rx) = oneshot::channel();
        {
            let host = self.host.clone();
            let creation_cancellation = cancellation.child_token();
            self.host.spawn(Box::pin(async move {
                let result = host
                    .execute_activity(
                        activity_options,
                        SESSION_CREATION_ACTIVITY_NAME,
                        creation_input,
                        creation_cancellation,
                    )
                    .await;
                let _ = creation_tx.send(result);
            }));
        }

        // Race the creation-response signal against the creation activity
        // itself finishing: the activity stopping first means creation
        // failed (usually a creation timeout).
        let response: SessionCreationResponse = tokio::select! {
            signal = self.host.receive_signal(&session_id) => {
                let payload = signal.map_err(SessionError::Workflow)?;
                payload.first_json().map_err(|err| {
                    SessionError::Workflow(WorkflowError::application(format!(
                        "invalid creation response: {}",
                        err
                    )))
                })?
            }
            result = &mut creation_rx => {
                cancellation.cancel();
                let err = match result {
                    Ok(Err(err)) => err,
                    Ok(Ok(_)) => WorkflowError::application(
                        "session creation activity completed before signaling",
                    ),
                    Err(_) => WorkflowError::application("session creation activity was dropped"),
                };
                debug!(session_id = %session_id, error = %err, "Failed to create session");
                return Err(SessionError::Creation(err));
            }
        };

        let info = Arc::new(StdMutex::new(SessionInfo {
            session_id: session_id.clone(),
            host_name: response.host_name,
            resource_id: response.resource_id,
            task_queue: response.tasklist,
            state: SessionState::Open,
        }));

        // Watch the still-running creation activity: any non-cancellation
        // error means the owning worker died and the session has failed.
        {
            let info = info.clone();
            let cancellation = cancellation.clone();
            let session_id = session_id.clone();
            self.host.spawn(Box::pin(async move {
                if let Ok(Err(err)) = creation_rx.await {
                    if !err.is_canceled() {
                        debug!(session_id = %session_id, error = %err, "Session failed");
                        info.lock().expect("session info lock").state = SessionState::Failed;
                        cancellation.cancel();
                    }
                }
            }));
        }

        debug!(session_id = %session_id, "Created session");
        *self.current.lock().expect("session client lock") = Some(info.clone());
        Ok(SessionHandle {
            info,
            cancellation,
            host: self.host.clone(),
        })
    }
}

/// A live session as seen by workflow code.
pub struct SessionHandle {
    info: Arc<StdMutex<SessionInfo>>,
    cancellation: CancellationToken,
    host: Arc<dyn SessionWorkflowHost>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("info", &self.info.lock().expect("session info lock"))
            .field("cancellation", &self.cancellation)
            .finish()
    }
}

impl SessionHandle {
    pub fn info(&self) -> SessionInfo {
        self.info.lock().expect("session info lock").clone()
    }

    pub fn state(&self) -> SessionState {
        self.info.lock().expect("session info lock").state
    }

    /// The token [`SessionClient::recreate_session`] accepts to pin a future
    /// session to the same worker.
    pub fn recreate_token(&self) -> Vec<u8> {
        serialize_recreate_token(&self.info.lock().expect("session info lock").task_queue)
    }

    /// Run an activity inside the session: pinned to the session's task
    /// queue and canceled with the session. Fails fast once the session has
    /// failed, without scheduling anything.
    pub async fn execute_activity(
        &self,
        mut options: ActivityOptions,
        activity_name: &str,
        input: Payloads,
    ) -> Result<Payloads, SessionError> {
        let task_queue = {
            let info = self.info.lock().expect("session info lock");
            if info.state == SessionState::Failed {
                return Err(SessionError::SessionFailed);
            }
            info.task_queue.clone()
        };
        options.task_queue = task_queue;
        self.host
            .execute_activity(options, activity_name, input, self.cancellation.child_token())
            .await
            .map_err(SessionError::Workflow)
    }

    /// Complete the session: cancel its scope, then run the completion
    /// activity in a separate non-cancellable scope so the resource is
    /// guaranteed to be released before the workflow moves on.
    pub async fn complete(&self) {
        let (session_id, task_queue) = {
            let info = self.info.lock().expect("session info lock");
            if info.state != SessionState::Open {
                return;
            }
            (info.session_id.clone(), info.task_queue.clone())
        };

        // Cancels the creation activity and all user activities of the
        // session.
        self.cancellation.cancel();

        let options = ActivityOptions {
            task_queue,
            schedule_to_start_timeout: Some(SESSION_COMPLETION_TIMEOUT),
            start_to_close_timeout: Some(SESSION_COMPLETION_TIMEOUT),
            ..Default::default()
        };
        let input = match Payloads::json(&session_id) {
            Ok(input) => input,
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "Failed to encode session id");
                Payloads::empty()
            }
        };
        if let Err(err) = self
            .host
            .execute_activity(
                options,
                SESSION_COMPLETION_ACTIVITY_NAME,
                input,
                CancellationToken::new(),
            )
            .await
        {
            warn!(session_id = %session_id, error = %err, "Complete session activity failed");
        }

        self.info.lock().expect("session info lock").state = SessionState::Closed;
        debug!(session_id = %session_id, "Completed session");
    }
}
