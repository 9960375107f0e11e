// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! History cursor.
//!
//! Streams a workflow's event history page by page and partitions it into
//! per-task batches. A batch ends at a workflow-task-started event that is
//! not followed by a task failure or timeout; scheduled/failed/timed-out
//! task events are bookkeeping and never reach the workflow.
//!
//! Markers need special ordering. A marker recorded by task N appears in
//! history after task N's started event, but replay must apply it around the
//! batch that produced it: version and side-effect markers before the batch
//! (the code consults them mid-batch), local-activity markers after (their
//! results only become observable once the task has started). The cursor
//! therefore yields each batch together with the markers found in the
//! batch that follows it.

use async_trait::async_trait;
use tracing::warn;

use weft_protocol::events::{is_command_event, EventAttributes, EventType, HistoryEvent, HistoryPage};
use weft_protocol::service::ServiceError;
use weft_protocol::task::WorkflowTask;

use crate::error::WorkerError;

/// Fetches subsequent pages of an execution's history from the server.
#[async_trait]
pub trait HistoryIterator: Send {
    fn has_next_page(&self) -> bool;
    async fn next_page(&mut self) -> Result<HistoryPage, ServiceError>;
    /// Rewind to the first page of the full history.
    fn reset(&mut self);
}

/// One command-event batch, ready for delivery to the event handler.
#[derive(Debug, Default)]
pub struct EventBatch {
    /// Ordinary events of this batch, in history order.
    pub events: Vec<HistoryEvent>,
    /// Markers recorded by this batch's task, pre-fetched from the following
    /// events. Applied around `events` per the ordering rules above.
    pub markers: Vec<HistoryEvent>,
    /// Binary checksum of the worker that completed this batch's task.
    pub binary_checksum: Option<String>,
}

/// Streams command-event batches out of a workflow task plus its iterator.
pub struct HistoryCursor<'a> {
    loaded_events: Vec<HistoryEvent>,
    current_index: usize,
    /// Next event id expected, for gap detection.
    next_event_id: i64,
    /// Last event id this task must reach; zero means read to the end.
    last_event_id: i64,
    previous_started_event_id: i64,
    iterator: Option<&'a mut dyn HistoryIterator>,
    /// Look-ahead batch, so markers of batch N+1 ride along with batch N.
    next: Option<Vec<HistoryEvent>>,
    binary_checksum: Option<String>,
}

impl<'a> HistoryCursor<'a> {
    pub fn new(task: &WorkflowTask, iterator: Option<&'a mut dyn HistoryIterator>) -> Self {
        let loaded_events = task.history.events.clone();
        let next_event_id = loaded_events.first().map(|e| e.event_id).unwrap_or(0);
        Self {
            loaded_events,
            current_index: 0,
            next_event_id,
            last_event_id: task.started_event_id,
            previous_started_event_id: task.previous_started_event_id,
            iterator,
            next: None,
            binary_checksum: None,
        }
    }

    /// True iff replaying `event` re-covers ground the workflow has already
    /// executed: either the event predates the last processed task, or it is
    /// the direct result of a command this code produced.
    pub fn is_replay_event(&self, event: &HistoryEvent) -> bool {
        event.event_id <= self.previous_started_event_id || is_command_event(event.event_type)
    }

    /// Yield the next batch, or `None` at end of stream.
    pub async fn next_batch(&mut self) -> Result<Option<EventBatch>, WorkerError> {
        if self.next.is_none() {
            let (events, _) = self.next_command_events().await?;
            self.next = Some(events);
        }

        let events = self.next.take().unwrap_or_default();
        let binary_checksum = self.binary_checksum.clone();
        let mut markers = Vec::new();
        if !events.is_empty() {
            let (next_events, next_markers) = self.next_command_events().await?;
            self.next = Some(next_events);
            markers = next_markers;
        }

        if events.is_empty() {
            return Ok(None);
        }
        Ok(Some(EventBatch {
            events,
            markers,
            binary_checksum,
        }))
    }

    async fn next_command_events(
        &mut self,
    ) -> Result<(Vec<HistoryEvent>, Vec<HistoryEvent>), WorkerError> {
        let mut events = Vec::new();
        let mut markers = Vec::new();

        if self.current_index == self.loaded_events.len() && !self.has_more_events() {
            self.verify_all_events_processed()?;
            return Ok((events, markers));
        }

        loop {
            while self.current_index == self.loaded_events.len() {
                if !self.has_more_events() {
                    self.verify_all_events_processed()?;
                    self.shrink_loaded_events();
                    return Ok((events, markers));
                }
                self.load_more_events().await?;
            }

            let event = self.loaded_events[self.current_index].clone();
            if event.event_id != self.next_event_id {
                return Err(WorkerError::MissingHistoryEvents {
                    expected: self.next_event_id,
                    received: event.event_id,
                });
            }
            self.next_event_id += 1;

            match event.event_type {
                EventType::WorkflowTaskStarted => {
                    let (next_task_failed, binary_checksum) =
                        self.is_next_workflow_task_failed().await?;
                    if !next_task_failed {
                        self.binary_checksum = binary_checksum;
                        self.current_index += 1;
                        events.push(event);
                        break;
                    }
                }
                EventType::WorkflowTaskScheduled
                | EventType::WorkflowTaskTimedOut
                | EventType::WorkflowTaskFailed => {
                    // Bookkeeping events, never delivered.
                }
                _ => {
                    if event.event_type == EventType::MarkerRecorded {
                        markers.push(event.clone());
                    }
                    events.push(event);
                }
            }
            self.current_index += 1;
        }

        self.shrink_loaded_events();
        Ok((events, markers))
    }

    /// Peek past a workflow-task-started event: did the task fail or time
    /// out (batch continues), and if it completed, under which binary?
    async fn is_next_workflow_task_failed(&mut self) -> Result<(bool, Option<String>), WorkerError> {
        let next_index = self.current_index + 1;
        if next_index >= self.loaded_events.len() && self.has_more_events() {
            self.load_more_events().await?;
        }

        if let Some(next_event) = self.loaded_events.get(next_index) {
            let failed = matches!(
                next_event.event_type,
                EventType::WorkflowTaskTimedOut | EventType::WorkflowTaskFailed
            );
            let binary_checksum = match &next_event.attributes {
                EventAttributes::WorkflowTaskCompleted(attrs)
                    if next_event.event_type == EventType::WorkflowTaskCompleted =>
                {
                    Some(attrs.binary_checksum.clone())
                }
                _ => None,
            };
            return Ok((failed, binary_checksum));
        }
        Ok((false, None))
    }

    fn has_more_events(&self) -> bool {
        self.iterator
            .as_ref()
            .map(|it| it.has_next_page())
            .unwrap_or(false)
    }

    async fn load_more_events(&mut self) -> Result<(), WorkerError> {
        let iterator = self
            .iterator
            .as_mut()
            .expect("load_more_events called without an iterator");
        let page = iterator.next_page().await?;
        self.loaded_events.extend(page.events);
        if self.next_event_id == 0 {
            if let Some(first) = self.loaded_events.first() {
                self.next_event_id = first.event_id;
            }
        }
        Ok(())
    }

    fn verify_all_events_processed(&self) -> Result<(), WorkerError> {
        if self.last_event_id > 0 && self.next_event_id <= self.last_event_id {
            return Err(WorkerError::PrematureEndOfStream {
                expected_last: self.last_event_id,
                last_seen: self.next_event_id - 1,
            });
        }
        if self.last_event_id > 0 && self.next_event_id != self.last_event_id + 1 {
            warn!(
                expected_last_event_id = self.last_event_id,
                processed_last_event_id = self.next_event_id - 1,
                "Processed events past the expected last event id"
            );
        }
        Ok(())
    }

    /// Drop the processed prefix so long histories do not pin memory.
    fn shrink_loaded_events(&mut self) {
        if self.current_index > 0 {
            self.loaded_events.drain(..self.current_index);
            self.current_index = 0;
        }
    }
}
