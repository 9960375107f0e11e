// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for session coordination.
//!
//! Two layers are covered:
//! 1. The worker-side session activities running under the real activity
//!    invoker: admission, the creation-response signal, heartbeats, and
//!    token return
//! 2. The workflow-side state machine against a fake workflow host:
//!    create/complete, failure propagation, recreation, and admission
//!
//! Run with:
//! ```bash
//! cargo test -p weft-worker --test session_test
//! ```

mod common;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use weft_protocol::payload::Payloads;
use weft_protocol::task::ActivityTask;

use weft_worker::session::{
    SESSION_COMPLETION_ACTIVITY_NAME, SESSION_CREATION_ACTIVITY_NAME,
};
use weft_worker::{
    register_session_activities, ActivityOptions, ActivityRegistry, ActivityTaskProcessor,
    ActivityTaskResult, SessionClient, SessionEnvironment, SessionError, SessionOptions,
    SessionState, SessionWorkflowHost, WorkflowError,
};

use common::MockWorkflowService;

// ============================================================================
// Worker-side: the real session activities under the activity invoker
// ============================================================================

fn session_activity_task(activity_type: &str, session_id: &str) -> ActivityTask {
    ActivityTask {
        task_token: format!("token-{}", session_id).into_bytes(),
        workflow_execution: weft_protocol::events::WorkflowExecution::new("wf-1", "run-1"),
        workflow_type: "test-workflow".to_string(),
        activity_id: session_id.to_string(),
        activity_type: activity_type.to_string(),
        input: Payloads::json(&session_id).unwrap(),
        header: None,
        schedule_to_close_timeout: Some(Duration::from_secs(10)),
        start_to_close_timeout: Some(Duration::from_secs(10)),
        // Heartbeat interval = timeout / 3 = 50ms, so liveness shows up
        // quickly in the test.
        heartbeat_timeout: Some(Duration::from_millis(150)),
        attempt: 1,
    }
}

#[tokio::test]
async fn test_session_activities_admission_signal_and_completion() {
    let service = Arc::new(MockWorkflowService::new());
    let environment = SessionEnvironment::new("gpu-0", "host-1", 2);
    let mut registry = ActivityRegistry::new();
    register_session_activities(
        &mut registry,
        environment.clone(),
        service.clone(),
        "test-ns",
        "test-worker",
    );
    let processor = Arc::new(ActivityTaskProcessor::new(
        "test-queue",
        "test-worker",
        service.clone(),
        Arc::new(registry),
        CancellationToken::new(),
    ));

    // Two long-running creation activities take both tokens.
    let first = tokio::spawn({
        let processor = processor.clone();
        async move {
            processor
                .execute(session_activity_task(SESSION_CREATION_ACTIVITY_NAME, "s1"))
                .await
        }
    });
    let second = tokio::spawn({
        let processor = processor.clone();
        async move {
            processor
                .execute(session_activity_task(SESSION_CREATION_ACTIVITY_NAME, "s2"))
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Both signaled their workflow with the resource-specific task queue.
    {
        let signals = service.signals.lock().unwrap();
        let mut names: Vec<_> = signals.iter().map(|s| s.signal_name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["s1", "s2"]);
        let response: weft_worker::session::SessionCreationResponse =
            signals[0].input.first_json().unwrap();
        assert_eq!(response.tasklist, "gpu-0@host-1");
        assert_eq!(response.host_name, "host-1");
        assert_eq!(response.resource_id, "gpu-0");
    }
    assert_eq!(environment.token_bucket().available_tokens(), 0);

    // A third session is rejected with a retryable admission error.
    let third = processor
        .execute(session_activity_task(SESSION_CREATION_ACTIVITY_NAME, "s3"))
        .await
        .unwrap();
    match third {
        ActivityTaskResult::Failed(response) => {
            let failure = response.failure.unwrap();
            assert_eq!(failure.message, "too many outstanding sessions");
            assert!(!failure.non_retryable);
        }
        other => panic!("expected an admission failure, got {:?}", other),
    }

    // Completing a session lets its creation activity return and release
    // the token.
    let completion = processor
        .execute(session_activity_task(SESSION_COMPLETION_ACTIVITY_NAME, "s1"))
        .await
        .unwrap();
    assert!(matches!(completion, ActivityTaskResult::Completed(_)));
    let creation_result = first.await.unwrap().unwrap();
    assert!(matches!(creation_result, ActivityTaskResult::Completed(_)));
    assert_eq!(environment.token_bucket().available_tokens(), 1);

    // Heartbeats flowed while the sessions were open (interval 100ms).
    assert!(service.heartbeats() >= 1);

    // Cleanup.
    processor
        .execute(session_activity_task(SESSION_COMPLETION_ACTIVITY_NAME, "s2"))
        .await
        .unwrap();
    second.await.unwrap().unwrap();
    assert_eq!(environment.token_bucket().available_tokens(), 2);
}

// ============================================================================
// Workflow-side: the state machine against a fake workflow host
// ============================================================================

/// A workflow host wired straight into a [`SessionEnvironment`], mimicking a
/// worker that polls the session task queues of this process.
struct FakeSessionHost {
    environment: Arc<SessionEnvironment>,
    signals: StdMutex<HashMap<String, VecDeque<Payloads>>>,
    signal_notify: Notify,
    activity_options: StdMutex<Vec<(String, ActivityOptions)>>,
    /// Simulates the session worker dying: open creation activities fail.
    kill_worker: CancellationToken,
}

impl FakeSessionHost {
    fn new(environment: Arc<SessionEnvironment>) -> Arc<Self> {
        Arc::new(Self {
            environment,
            signals: StdMutex::new(HashMap::new()),
            signal_notify: Notify::new(),
            activity_options: StdMutex::new(Vec::new()),
            kill_worker: CancellationToken::new(),
        })
    }

    fn send_signal(&self, signal_name: &str, payload: Payloads) {
        self.signals
            .lock()
            .unwrap()
            .entry(signal_name.to_string())
            .or_default()
            .push_back(payload);
        self.signal_notify.notify_waiters();
    }

    fn options_for(&self, activity_name: &str) -> Vec<ActivityOptions> {
        self.activity_options
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == activity_name)
            .map(|(_, options)| options.clone())
            .collect()
    }
}

#[async_trait]
impl SessionWorkflowHost for FakeSessionHost {
    async fn execute_activity(
        &self,
        options: ActivityOptions,
        activity_name: &str,
        input: Payloads,
        cancellation: CancellationToken,
    ) -> Result<Payloads, WorkflowError> {
        self.activity_options
            .lock()
            .unwrap()
            .push((activity_name.to_string(), options));

        match activity_name {
            SESSION_CREATION_ACTIVITY_NAME => {
                let session_id: String = input
                    .first_json()
                    .map_err(|err| WorkflowError::application(err.to_string()))?;
                let mut done =
                    self.environment
                        .create_session(&session_id)
                        .map_err(|_| WorkflowError::Application {
                            message: "too many outstanding sessions".to_string(),
                            error_type: "TooManySessions".to_string(),
                            non_retryable: false,
                            details: None,
                            cause: None,
                        })?;

                self.send_signal(
                    &session_id,
                    Payloads::json(&self.environment.creation_response()).unwrap(),
                );

                let result = tokio::select! {
                    _ = cancellation.cancelled() => {
                        self.environment.complete_session(&session_id);
                        Err(WorkflowError::canceled())
                    }
                    _ = self.kill_worker.cancelled() => {
                        self.environment.complete_session(&session_id);
                        Err(WorkflowError::application("session worker died"))
                    }
                    _ = &mut done => Ok(Payloads::empty()),
                };
                self.environment.add_session_token();
                result
            }
            SESSION_COMPLETION_ACTIVITY_NAME => {
                let session_id: String = input
                    .first_json()
                    .map_err(|err| WorkflowError::application(err.to_string()))?;
                self.environment.complete_session(&session_id);
                Ok(Payloads::empty())
            }
            _ => {
                // User activity: echo the input unless the session scope is
                // canceled first.
                tokio::select! {
                    _ = cancellation.cancelled() => Err(WorkflowError::canceled()),
                    _ = tokio::time::sleep(Duration::from_millis(10)) => Ok(input),
                }
            }
        }
    }

    async fn receive_signal(&self, signal_name: &str) -> Result<Payloads, WorkflowError> {
        loop {
            let notified = self.signal_notify.notified();
            tokio::pin!(notified);
            if let Some(payload) = self
                .signals
                .lock()
                .unwrap()
                .get_mut(signal_name)
                .and_then(|queue| queue.pop_front())
            {
                return Ok(payload);
            }
            notified.await;
        }
    }

    fn spawn(&self, future: futures::future::BoxFuture<'static, ()>) {
        tokio::spawn(future);
    }
}

fn session_options() -> SessionOptions {
    SessionOptions::new(Duration::from_secs(10), Duration::from_secs(1))
}

#[tokio::test]
async fn test_create_execute_complete_session() {
    let environment = SessionEnvironment::new("gpu-0", "host-1", 2);
    let host = FakeSessionHost::new(environment.clone());
    let client = SessionClient::new(host.clone(), "orders");

    let session = client.create_session(&session_options()).await.unwrap();
    assert_eq!(session.state(), SessionState::Open);

    let info = session.info();
    assert_eq!(info.task_queue, "gpu-0@host-1");
    assert_eq!(info.host_name, "host-1");
    assert_eq!(info.resource_id, "gpu-0");

    // The creation activity was scheduled on the creation task queue with
    // the session retry policy attached.
    let creation_options = host.options_for(SESSION_CREATION_ACTIVITY_NAME);
    assert_eq!(
        creation_options[0].task_queue,
        "orders__internal_session_creation"
    );
    assert!(creation_options[0].retry_policy.is_some());
    assert_eq!(
        creation_options[0].heartbeat_timeout,
        Some(Duration::from_secs(20))
    );

    // User activities run pinned to the session task queue.
    let echoed = session
        .execute_activity(
            ActivityOptions::default(),
            "user-activity",
            Payloads::json(&"hello").unwrap(),
        )
        .await
        .unwrap();
    let value: String = echoed.first_json().unwrap();
    assert_eq!(value, "hello");
    let user_options = host.options_for("user-activity");
    assert_eq!(user_options[0].task_queue, "gpu-0@host-1");

    session.complete().await;
    assert_eq!(session.state(), SessionState::Closed);

    // The completion activity ran on the session task queue with the short
    // timeouts.
    let completion_options = host.options_for(SESSION_COMPLETION_ACTIVITY_NAME);
    assert_eq!(completion_options[0].task_queue, "gpu-0@host-1");
    assert_eq!(
        completion_options[0].schedule_to_start_timeout,
        Some(Duration::from_secs(3))
    );

    // The creation activity exits and returns its token.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(environment.token_bucket().available_tokens(), 2);
}

#[tokio::test]
async fn test_existing_open_session_is_rejected() {
    let environment = SessionEnvironment::new("gpu-0", "host-1", 2);
    let host = FakeSessionHost::new(environment);
    let client = SessionClient::new(host, "orders");

    let session = client.create_session(&session_options()).await.unwrap();
    let err = client
        .create_session(&session_options())
        .await
        .expect_err("second open session must be rejected");
    assert!(matches!(err, SessionError::ExistingOpenSession));

    session.complete().await;
    // After completing, a new session may be created.
    client.create_session(&session_options()).await.unwrap();
}

#[tokio::test]
async fn test_worker_death_fails_session() {
    let environment = SessionEnvironment::new("gpu-0", "host-1", 2);
    let host = FakeSessionHost::new(environment);
    let client = SessionClient::new(host.clone(), "orders");

    let session = client.create_session(&session_options()).await.unwrap();
    assert_eq!(session.state(), SessionState::Open);

    host.kill_worker.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(session.state(), SessionState::Failed);

    // Activities in a failed session fail fast, without scheduling.
    let before = host.options_for("user-activity").len();
    let err = session
        .execute_activity(
            ActivityOptions::default(),
            "user-activity",
            Payloads::empty(),
        )
        .await
        .expect_err("failed session rejects activities");
    assert!(matches!(err, SessionError::SessionFailed));
    assert_eq!(host.options_for("user-activity").len(), before);
}

#[tokio::test]
async fn test_recreate_session_pins_worker() {
    let environment = SessionEnvironment::new("gpu-0", "host-1", 2);
    let host = FakeSessionHost::new(environment);

    let first_client = SessionClient::new(host.clone(), "orders");
    let first = first_client.create_session(&session_options()).await.unwrap();
    let token = first.recreate_token();
    assert_eq!(
        String::from_utf8(token.clone()).unwrap(),
        r#"{"Tasklist":"gpu-0@host-1"}"#
    );
    first.complete().await;

    // The next run recreates the session on the resource-specific queue.
    let second_client = SessionClient::new(host.clone(), "orders");
    let second = second_client
        .recreate_session(&token, &session_options())
        .await
        .unwrap();
    assert_eq!(second.info().task_queue, "gpu-0@host-1");

    let creation_options = host.options_for(SESSION_CREATION_ACTIVITY_NAME);
    assert_eq!(creation_options[1].task_queue, "gpu-0@host-1");

    second.complete().await;
}

#[tokio::test]
async fn test_session_admission_bound() {
    let environment = SessionEnvironment::new("gpu-0", "host-1", 2);
    let host = FakeSessionHost::new(environment);

    let clients: Vec<_> = (0..3)
        .map(|_| SessionClient::new(host.clone(), "orders"))
        .collect();

    let first = clients[0].create_session(&session_options()).await.unwrap();
    let _second = clients[1].create_session(&session_options()).await.unwrap();

    // The third workflow is rejected by admission control.
    let err = clients[2]
        .create_session(&session_options())
        .await
        .expect_err("admission must reject the third session");
    match err {
        SessionError::Creation(workflow_error) => {
            assert!(workflow_error
                .to_string()
                .contains("too many outstanding sessions"));
        }
        other => panic!("unexpected error: {:?}", other),
    }

    // A returned token admits it.
    first.complete().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    clients[2].create_session(&session_options()).await.unwrap();
}
