// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Weft protocol - typed wire surface for the weft durable-workflow SDK.
//!
//! This crate defines the data model the worker core exchanges with the
//! orchestration server: history events, commands, task payloads, the
//! request/response types of the relevant RPCs, and the [`WorkflowService`]
//! trait that transports implement. It deliberately contains no marshalling;
//! a gRPC (or other) transport layer adapts these types at the edge.
//!
//! # Layout
//!
//! - [`events`] - history events, the append-only record of an execution
//! - [`commands`] - decisions produced by workflow code during a task
//! - [`task`] - workflow/activity task payloads and RPC request types
//! - [`service`] - the [`WorkflowService`] trait and [`ServiceError`]
//! - [`retry`] - retry policies and the transient-error retry wrapper
//! - [`markers`] - well-known marker names
//! - [`payload`] - opaque payload containers

pub mod commands;
pub mod events;
pub mod markers;
pub mod payload;
pub mod retry;
pub mod service;
pub mod task;

pub use commands::{Command, CommandAttributes, CommandType};
pub use events::{
    is_command_event, EventAttributes, EventType, Failure, Header, HistoryEvent, HistoryPage,
    SearchAttributes, WorkflowExecution,
};
pub use payload::{Payload, Payloads};
pub use retry::{service_retry_policy, with_retry, RetryPolicy};
pub use service::{ServiceError, WorkflowService};
pub use task::{ActivityTask, WorkflowQuery, WorkflowTask};
