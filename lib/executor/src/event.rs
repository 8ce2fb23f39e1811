//! Monotonic execution events emitted by every successful executor
//! operation (§4.5): "every successful operation appends an ExecutionEvent
//! with a monotonic id".

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use model::{Decision, StepId, WorkflowId};

#[derive(Debug, Clone)]
pub enum ExecutionEventKind {
    Submitted,
    StepActivated { step_id: StepId },
    DecisionRecorded { step_id: StepId, decision: Decision },
    Delegated { step_id: StepId },
    Escalated { step_id: StepId },
    Cancelled,
    Provisioned { succeeded: bool },
}

#[derive(Debug, Clone)]
pub struct ExecutionEvent {
    pub id: u64,
    pub workflow_id: WorkflowId,
    pub kind: ExecutionEventKind,
    pub at: DateTime<Utc>,
}

/// Issues strictly increasing event ids. One sequencer is expected to be
/// shared across all workflows in a process, matching the "monotonic id"
/// requirement rather than a per-workflow counter.
pub struct EventSequencer {
    next_id: AtomicU64,
}

impl EventSequencer {
    pub fn new() -> Self { Self { next_id: AtomicU64::new(1) } }

    pub fn next(&self, workflow_id: WorkflowId, kind: ExecutionEventKind) -> ExecutionEvent {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        ExecutionEvent { id, workflow_id, kind, at: Utc::now() }
    }
}

impl Default for EventSequencer {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_strictly_increasing() {
        let sequencer = EventSequencer::new();
        let workflow_id = WorkflowId::new();
        let a = sequencer.next(workflow_id, ExecutionEventKind::Submitted);
        let b = sequencer.next(workflow_id, ExecutionEventKind::Cancelled);
        assert!(b.id > a.id);
    }
}
