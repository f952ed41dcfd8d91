//! Progress events
//!
//! Fire-and-forget notifications for tool calls and fix steps.
//! Sinks must not block and have no say in control flow.

use serde::Serialize;
use std::sync::Mutex;

/// Tool invocation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Executing,
    Completed,
    Failed,
}

/// Events emitted by the orchestrator and the fix executor
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MedicEvent {
    Tool {
        tool: String,
        input: serde_json::Value,
        status: ToolStatus,
    },
    FixState {
        fix_id: String,
        state: String,
    },
    FixStep {
        fix_id: String,
        index: usize,
        total: usize,
        command: String,
        success: Option<bool>,
    },
    FixFinished {
        fix_id: String,
        success: bool,
        succeeded: usize,
        failed: usize,
    },
}

/// Receiver of progress events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: MedicEvent);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: MedicEvent) {}
}

/// Forwards events to `tracing` at debug level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: MedicEvent) {
        match &event {
            MedicEvent::Tool { tool, status, .. } => {
                tracing::debug!(tool = %tool, status = ?status, "tool event");
            }
            MedicEvent::FixState { fix_id, state } => {
                tracing::debug!(fix_id = %fix_id, state = %state, "fix state");
            }
            MedicEvent::FixStep {
                fix_id,
                index,
                total,
                success,
                ..
            } => {
                tracing::debug!(fix_id = %fix_id, step = index + 1, total, ?success, "fix step");
            }
            MedicEvent::FixFinished {
                fix_id,
                success,
                succeeded,
                failed,
            } => {
                tracing::debug!(fix_id = %fix_id, success, succeeded, failed, "fix finished");
            }
        }
    }
}

/// Keeps every event in memory (tests and audit capture)
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<MedicEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MedicEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: MedicEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
