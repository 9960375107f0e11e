// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Weft worker - the workflow task processing engine of the weft SDK.
//!
//! This crate is the hard core of the worker: it deterministically replays
//! workflow code against server-supplied event histories, proves that the
//! decisions the code produces match the decisions recorded in history,
//! caches partially-executed workflow state between tasks, runs activities
//! with deadlines/heartbeats/cancellation, and coordinates worker-pinned
//! sessions over scarce resources.
//!
//! # Architecture
//!
//! - [`cache`] - process-wide sticky cache of execution contexts (LRU,
//!   eviction hooks that release sticky affinity server-side)
//! - [`history`] - streams history pages into per-task event batches with
//!   marker reordering
//! - [`context`] - per-run mutable state, the event-handler seam, the
//!   local-activity pipeline
//! - [`replay`] - deterministic matching of replayed commands against
//!   recorded events
//! - [`processor`] - the top-level task loop, including the
//!   heartbeat-on-deadline dance for pending local activities
//! - [`activity`] - activity execution with panic recovery and batched
//!   heartbeats
//! - [`session`] - admission-controlled, worker-pinned sessions
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use weft_worker::{WorkerConfig, WorkflowTaskProcessor};
//!
//! let config = Arc::new(WorkerConfig::new("prod", "orders"));
//! let processor = WorkflowTaskProcessor::new(config, my_handler_factory);
//!
//! // For each task the poller hands over:
//! let completion = processor.process_workflow_task(input, &heartbeat).await?;
//! ```

pub mod activity;
pub mod cache;
pub mod checksum;
pub mod config;
pub mod context;
pub mod error;
pub mod history;
pub mod processor;
pub mod replay;
pub mod session;

pub use activity::{
    Activity, ActivityContext, ActivityOptions, ActivityRegistry, ActivityTaskProcessor,
    ActivityTaskResult, ContextPropagator, HeartbeatInvoker,
};
pub use cache::{set_sticky_cache_size, sticky_cache, WorkflowCache, DEFAULT_STICKY_CACHE_SIZE};
pub use checksum::binary_checksum;
pub use config::{WorkerConfig, WorkflowPanicPolicy};
pub use context::{
    EventHandlerFactory, LocalActivityRequest, LocalActivityResult, LocalActivityTask,
    LocalActivityTunnel, WorkflowCompletion, WorkflowEventHandler, WorkflowExecutionContext,
    WorkflowInfo, WorkflowTaskInput,
};
pub use error::{ContinueAsNewParams, SessionError, WorkerError, WorkflowError};
pub use history::{EventBatch, HistoryCursor, HistoryIterator};
pub use processor::{
    PressurePointHandler, TaskCompletion, WorkflowTaskHeartbeat, WorkflowTaskProcessor,
};
pub use replay::{match_replay_with_history, match_replay_with_history_strict};
pub use session::{
    creation_task_queue, register_session_activities, resource_specific_task_queue,
    session_environment_from_config, SessionClient, SessionCreationResponse, SessionEnvironment,
    SessionHandle, SessionInfo, SessionOptions, SessionState, SessionTokenBucket,
    SessionWorkflowHost,
};
