// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker configuration.

use std::time::Duration;

/// What to do when workflow code panics or replay detects nondeterminism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkflowPanicPolicy {
    /// Convert the panic into a workflow failure: the task completes with a
    /// fail-workflow command and the execution ends.
    #[default]
    FailWorkflow,
    /// Surface the panic as a workflow task failure. The server retries the
    /// task until the code is fixed or the workflow times out.
    BlockWorkflow,
}

/// Configuration for a worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Namespace all operations run against.
    pub namespace: String,
    /// Worker identity reported in completions and heartbeats.
    pub identity: String,
    /// Host name, used for resource-specific session task queues.
    pub host_name: String,
    /// Base task queue this worker polls.
    pub task_queue: String,
    /// Disable the sticky execution cache; every task replays from the
    /// beginning of history.
    pub disable_sticky_execution: bool,
    /// Panic/nondeterminism handling, see [`WorkflowPanicPolicy`].
    pub workflow_panic_policy: WorkflowPanicPolicy,
    /// Run the session worker (creation/completion activities).
    pub enable_session_worker: bool,
    /// Identifier of the scarce resource sessions consume on this worker.
    pub session_resource_id: Option<String>,
    /// Maximum number of concurrently open sessions on this worker.
    pub max_concurrent_session_execution_size: usize,
    /// Upper bound on workflow tasks processed concurrently.
    pub max_concurrent_workflow_task_execution_size: usize,
    /// Fallback workflow task timeout when history does not carry one.
    pub default_workflow_task_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            identity: format!("{}@{}", std::process::id(), default_host_name()),
            host_name: default_host_name(),
            task_queue: "default".to_string(),
            disable_sticky_execution: false,
            workflow_panic_policy: WorkflowPanicPolicy::default(),
            enable_session_worker: false,
            session_resource_id: None,
            max_concurrent_session_execution_size: 1000,
            max_concurrent_workflow_task_execution_size: 1000,
            default_workflow_task_timeout: Duration::from_secs(10),
        }
    }
}

impl WorkerConfig {
    /// Create a configuration for the given namespace and task queue.
    pub fn new(namespace: impl Into<String>, task_queue: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            task_queue: task_queue.into(),
            ..Default::default()
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn with_host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = host_name.into();
        self
    }

    pub fn with_disable_sticky_execution(mut self, disable: bool) -> Self {
        self.disable_sticky_execution = disable;
        self
    }

    pub fn with_workflow_panic_policy(mut self, policy: WorkflowPanicPolicy) -> Self {
        self.workflow_panic_policy = policy;
        self
    }

    pub fn with_session_worker(mut self, resource_id: impl Into<String>) -> Self {
        self.enable_session_worker = true;
        self.session_resource_id = Some(resource_id.into());
        self
    }

    pub fn with_max_concurrent_session_execution_size(mut self, size: usize) -> Self {
        self.max_concurrent_session_execution_size = size;
        self
    }
}

fn default_host_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.max_concurrent_session_execution_size, 1000);
        assert!(!config.disable_sticky_execution);
        assert_eq!(config.workflow_panic_policy, WorkflowPanicPolicy::FailWorkflow);
        assert!(!config.enable_session_worker);
    }

    #[test]
    fn test_builder_pattern() {
        let config = WorkerConfig::new("prod", "orders")
            .with_identity("worker-1")
            .with_disable_sticky_execution(true)
            .with_workflow_panic_policy(WorkflowPanicPolicy::BlockWorkflow)
            .with_session_worker("gpu-0")
            .with_max_concurrent_session_execution_size(2);

        assert_eq!(config.namespace, "prod");
        assert_eq!(config.task_queue, "orders");
        assert_eq!(config.identity, "worker-1");
        assert!(config.disable_sticky_execution);
        assert_eq!(config.workflow_panic_policy, WorkflowPanicPolicy::BlockWorkflow);
        assert!(config.enable_session_worker);
        assert_eq!(config.session_resource_id.as_deref(), Some("gpu-0"));
        assert_eq!(config.max_concurrent_session_execution_size, 2);
    }
}
